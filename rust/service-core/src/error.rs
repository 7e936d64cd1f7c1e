// rust/service-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Abstract error kinds shared by the dispatcher, workers and clients.
///
/// The code survives a round trip through `tonic::Status`, so a handler error
/// reaches the remote caller with the same kind and message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Aborted,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

pub type Result<T> = std::result::Result<T, ServiceError>;

// Convenience constructors
impl ServiceError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns the abstract kind of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::InvalidArgument(_) | Self::Config { .. } => ErrorCode::InvalidArgument,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::Unavailable { .. } => ErrorCode::Unavailable,
            Self::Aborted(_) => ErrorCode::Aborted,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::Storage { source, .. } => match source {
                Some(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::NotFound,
                _ => ErrorCode::Internal,
            },
            Self::Internal { .. } | Self::Serialization { .. } => ErrorCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }

    /// Whether the failure is transport-level and the call may simply be repeated.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Unavailable | ErrorCode::Aborted | ErrorCode::Cancelled
        )
    }
}

impl From<tonic::Status> for ServiceError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(message),
            tonic::Code::AlreadyExists => Self::AlreadyExists(message),
            tonic::Code::InvalidArgument | tonic::Code::OutOfRange => {
                Self::InvalidArgument(message)
            }
            tonic::Code::FailedPrecondition => Self::FailedPrecondition(message),
            tonic::Code::Unavailable => Self::Unavailable {
                message,
                source: Some(Box::new(status)),
            },
            tonic::Code::Aborted => Self::Aborted(message),
            tonic::Code::Cancelled => Self::Cancelled(message),
            tonic::Code::DeadlineExceeded => Self::DeadlineExceeded(message),
            _ => Self::Internal {
                message,
                source: Some(Box::new(status)),
            },
        }
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(error: ServiceError) -> Self {
        let message = error.to_string();
        match error.code() {
            ErrorCode::NotFound => tonic::Status::not_found(message),
            ErrorCode::AlreadyExists => tonic::Status::already_exists(message),
            ErrorCode::InvalidArgument => tonic::Status::invalid_argument(message),
            ErrorCode::FailedPrecondition => tonic::Status::failed_precondition(message),
            ErrorCode::Unavailable => tonic::Status::unavailable(message),
            ErrorCode::Aborted => tonic::Status::aborted(message),
            ErrorCode::Cancelled => tonic::Status::cancelled(message),
            ErrorCode::DeadlineExceeded => tonic::Status::deadline_exceeded(message),
            ErrorCode::Internal => tonic::Status::internal(message),
        }
    }
}

impl From<bincode::Error> for ServiceError {
    fn from(error: bincode::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

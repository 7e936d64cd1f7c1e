//! Protocol wrapper types for dispatcher and worker messages.
//!
//! Rust-friendly types around the generated protobuf messages, with
//! conversions in both directions. Conversions from the wire validate enum
//! values and required fields.

use serde::{Deserialize, Serialize};

use super::proto;
use crate::dataset::{CompressedElement, DatasetDef};
use crate::error::{Result, ServiceError};

/// How the workers of a job divide the dataset between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// Every worker independently produces the whole dataset.
    ParallelEpochs,
    /// Workers jointly produce one pass, pulling splits from the dispatcher.
    DistributedEpoch,
}

impl ProcessingMode {
    pub fn to_proto(self) -> i32 {
        match self {
            Self::ParallelEpochs => proto::ProcessingModeDef::ParallelEpochs as i32,
            Self::DistributedEpoch => proto::ProcessingModeDef::DistributedEpoch as i32,
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for `INVALID` or unknown wire values.
    pub fn from_proto(value: i32) -> Result<Self> {
        match proto::ProcessingModeDef::try_from(value) {
            Ok(proto::ProcessingModeDef::ParallelEpochs) => Ok(Self::ParallelEpochs),
            Ok(proto::ProcessingModeDef::DistributedEpoch) => Ok(Self::DistributedEpoch),
            _ => Err(ServiceError::invalid_argument(format!(
                "Unrecognized processing mode: {value}"
            ))),
        }
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParallelEpochs => write!(f, "PARALLEL_EPOCHS"),
            Self::DistributedEpoch => write!(f, "DISTRIBUTED_EPOCH"),
        }
    }
}

impl From<DatasetDef> for proto::DatasetDef {
    fn from(def: DatasetDef) -> Self {
        Self { graph: def.graph }
    }
}

impl From<proto::DatasetDef> for DatasetDef {
    fn from(def: proto::DatasetDef) -> Self {
        Self { graph: def.graph }
    }
}

impl From<CompressedElement> for proto::CompressedElement {
    fn from(element: CompressedElement) -> Self {
        Self {
            data: element.data,
            uncompressed_size: element.uncompressed_size,
        }
    }
}

impl From<proto::CompressedElement> for CompressedElement {
    fn from(element: proto::CompressedElement) -> Self {
        Self {
            data: element.data,
            uncompressed_size: element.uncompressed_size,
        }
    }
}

/// Where a worker gets the dataset for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDataset {
    Def(DatasetDef),
    /// Path of a dataset file in the dispatcher's dataset store.
    Path(String),
}

/// Everything a worker needs to run a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDef {
    pub task_id: i64,
    pub job_id: i64,
    pub dataset_id: i64,
    pub processing_mode: ProcessingMode,
    pub dataset: TaskDataset,
}

impl From<TaskDef> for proto::TaskDef {
    fn from(task: TaskDef) -> Self {
        let dataset = match task.dataset {
            TaskDataset::Def(def) => proto::task_def::Dataset::DatasetDef(def.into()),
            TaskDataset::Path(path) => proto::task_def::Dataset::Path(path),
        };
        Self {
            dataset: Some(dataset),
            dataset_id: task.dataset_id,
            task_id: task.task_id,
            job_id: task.job_id,
            processing_mode: task.processing_mode.to_proto(),
        }
    }
}

impl TryFrom<proto::TaskDef> for TaskDef {
    type Error = ServiceError;

    fn try_from(task: proto::TaskDef) -> Result<Self> {
        let dataset = match task.dataset {
            Some(proto::task_def::Dataset::DatasetDef(def)) => TaskDataset::Def(def.into()),
            Some(proto::task_def::Dataset::Path(path)) => TaskDataset::Path(path),
            None => {
                return Err(ServiceError::invalid_argument(format!(
                    "task {} has neither a dataset definition nor a path",
                    task.task_id
                )))
            }
        };
        Ok(Self {
            task_id: task.task_id,
            job_id: task.job_id,
            dataset_id: task.dataset_id,
            processing_mode: ProcessingMode::from_proto(task.processing_mode)?,
            dataset,
        })
    }
}

/// Client-visible description of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskInfo {
    pub worker_address: String,
    pub task_id: i64,
    pub job_id: i64,
}

impl From<TaskInfo> for proto::TaskInfo {
    fn from(info: TaskInfo) -> Self {
        Self {
            worker_address: info.worker_address,
            task_id: info.task_id,
            job_id: info.job_id,
        }
    }
}

impl From<proto::TaskInfo> for TaskInfo {
    fn from(info: proto::TaskInfo) -> Self {
        Self {
            worker_address: info.worker_address,
            task_id: info.task_id,
            job_id: info.job_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TasksResponse {
    pub tasks: Vec<TaskInfo>,
    pub job_finished: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub new_tasks: Vec<TaskDef>,
    pub tasks_to_delete: Vec<i64>,
}

impl From<HeartbeatResponse> for proto::WorkerHeartbeatResponse {
    fn from(response: HeartbeatResponse) -> Self {
        Self {
            new_tasks: response.new_tasks.into_iter().map(Into::into).collect(),
            tasks_to_delete: response.tasks_to_delete,
        }
    }
}

impl TryFrom<proto::WorkerHeartbeatResponse> for HeartbeatResponse {
    type Error = ServiceError;

    fn try_from(response: proto::WorkerHeartbeatResponse) -> Result<Self> {
        Ok(Self {
            new_tasks: response
                .new_tasks
                .into_iter()
                .map(TaskDef::try_from)
                .collect::<Result<_>>()?,
            tasks_to_delete: response.tasks_to_delete,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub task_id: i64,
    pub completed: bool,
}

impl From<TaskProgress> for proto::TaskProgress {
    fn from(progress: TaskProgress) -> Self {
        Self {
            task_id: progress.task_id,
            completed: progress.completed,
        }
    }
}

impl From<proto::TaskProgress> for TaskProgress {
    fn from(progress: proto::TaskProgress) -> Self {
        Self {
            task_id: progress.task_id,
            completed: progress.completed,
        }
    }
}

/// Result of a worker `GetElement` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetElementResult {
    Element(CompressedElement),
    EndOfSequence,
}

impl From<GetElementResult> for proto::GetElementResponse {
    fn from(result: GetElementResult) -> Self {
        match result {
            GetElementResult::Element(element) => Self {
                compressed_element: Some(element.into()),
                end_of_sequence: false,
            },
            GetElementResult::EndOfSequence => Self {
                compressed_element: None,
                end_of_sequence: true,
            },
        }
    }
}

impl TryFrom<proto::GetElementResponse> for GetElementResult {
    type Error = ServiceError;

    fn try_from(response: proto::GetElementResponse) -> Result<Self> {
        if response.end_of_sequence {
            return Ok(Self::EndOfSequence);
        }
        response
            .compressed_element
            .map(|element| Self::Element(element.into()))
            .ok_or_else(|| {
                ServiceError::internal("GetElement response has neither an element nor end of sequence")
            })
    }
}

// rust/service-core/src/dataset/element.rs

//! Element representation produced by dataset iterators and served by workers.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

/// An element compressed for transfer from a worker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedElement {
    pub data: Vec<u8>,
    pub uncompressed_size: u64,
}

impl CompressedElement {
    pub fn compress(payload: &[u8]) -> Self {
        Self {
            data: lz4_flex::block::compress(payload),
            uncompressed_size: payload.len() as u64,
        }
    }

    /// # Errors
    ///
    /// Returns `Internal` if the payload is corrupt or its size doesn't match.
    pub fn decompress(&self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.uncompressed_size).map_err(|_| {
            ServiceError::internal(format!(
                "compressed element too large: {} bytes",
                self.uncompressed_size
            ))
        })?;
        lz4_flex::block::decompress(&self.data, size)
            .map_err(|e| ServiceError::internal_with_source("failed to decompress element", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int64,
    Bytes,
    Variant,
}

/// One value held by a `Variant` tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantValue {
    Compressed(CompressedElement),
    /// Any other variant payload, identified by its type name.
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorValues {
    Int64(Vec<i64>),
    Bytes(Vec<Vec<u8>>),
    Variant(Vec<VariantValue>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    /// Dimensions; empty for a scalar.
    pub shape: Vec<usize>,
    pub values: TensorValues,
}

impl Tensor {
    pub fn scalar_variant(value: VariantValue) -> Self {
        Self {
            shape: Vec::new(),
            values: TensorValues::Variant(vec![value]),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self.values {
            TensorValues::Int64(_) => DataType::Int64,
            TensorValues::Bytes(_) => DataType::Bytes,
            TensorValues::Variant(_) => DataType::Variant,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }
}

/// Extracts the compressed element from one iterator output.
///
/// Workers only serve elements that arrive as exactly one scalar variant
/// tensor holding a `CompressedElement`.
///
/// # Errors
///
/// Returns `FailedPrecondition` naming the first violated requirement.
pub fn compressed_element_from_outputs(outputs: Vec<Tensor>) -> Result<CompressedElement> {
    if outputs.len() != 1 {
        return Err(ServiceError::failed_precondition(format!(
            "Expected dataset to produce a single scalar variant tensor, but the dataset \
             produced {} outputs",
            outputs.len()
        )));
    }
    let Some(tensor) = outputs.into_iter().next() else {
        return Err(ServiceError::internal("iterator output vanished"));
    };
    if tensor.dtype() != DataType::Variant {
        return Err(ServiceError::failed_precondition(format!(
            "Expected dataset to produce a single scalar variant tensor, but the dataset \
             produced a tensor with type {:?}",
            tensor.dtype()
        )));
    }
    if !tensor.is_scalar() {
        return Err(ServiceError::failed_precondition(format!(
            "Expected dataset to produce a single scalar variant tensor, but the dataset \
             produced a tensor with shape {:?}",
            tensor.shape
        )));
    }
    match tensor.values {
        TensorValues::Variant(mut values) if values.len() == 1 => match values.remove(0) {
            VariantValue::Compressed(element) => Ok(element),
            VariantValue::Opaque(type_name) => Err(ServiceError::failed_precondition(format!(
                "Expected dataset to produce a CompressedElement variant tensor, but it \
                 produced {type_name}"
            ))),
        },
        _ => Err(ServiceError::failed_precondition(
            "Expected dataset to produce a scalar variant tensor holding one value",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_compress_decompress() {
        let payload = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let element = CompressedElement::compress(payload);
        assert_eq!(element.uncompressed_size, payload.len() as u64);
        assert!(element.data.len() < payload.len());
        assert_eq!(element.decompress().unwrap(), payload);
    }

    #[test]
    fn test_decompress_size_mismatch_fails() {
        let mut element = CompressedElement::compress(b"hello world");
        element.uncompressed_size = 3;
        assert!(element.decompress().is_err());
    }

    #[test]
    fn test_valid_output_accepted() {
        let element = CompressedElement::compress(b"x");
        let outputs = vec![Tensor::scalar_variant(VariantValue::Compressed(
            element.clone(),
        ))];
        assert_eq!(compressed_element_from_outputs(outputs).unwrap(), element);
    }

    #[test]
    fn test_wrong_count_rejected() {
        let element = VariantValue::Compressed(CompressedElement::compress(b"x"));
        let outputs = vec![
            Tensor::scalar_variant(element.clone()),
            Tensor::scalar_variant(element),
        ];
        let err = compressed_element_from_outputs(outputs).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("2 outputs"));
    }

    #[test]
    fn test_wrong_dtype_rejected() {
        let outputs = vec![Tensor {
            shape: Vec::new(),
            values: TensorValues::Int64(vec![7]),
        }];
        let err = compressed_element_from_outputs(outputs).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("Int64"));
    }

    #[test]
    fn test_non_scalar_rejected() {
        let element = VariantValue::Compressed(CompressedElement::compress(b"x"));
        let outputs = vec![Tensor {
            shape: vec![1],
            values: TensorValues::Variant(vec![element]),
        }];
        let err = compressed_element_from_outputs(outputs).unwrap_err();
        assert!(err.to_string().contains("shape"));
    }

    #[test]
    fn test_opaque_variant_rejected() {
        let outputs = vec![Tensor::scalar_variant(VariantValue::Opaque(
            "TensorList".to_string(),
        ))];
        let err = compressed_element_from_outputs(outputs).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("TensorList"));
    }
}

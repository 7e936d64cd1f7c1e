// rust/service-core/src/dataset/traits.rs

use async_trait::async_trait;

use super::element::Tensor;
use crate::error::Result;

/// An opaque, dataset-defined descriptor of a disjoint part of a dataset.
pub type Split = Vec<u8>;

/// A restartable lazy sequence of splits.
///
/// Under distributed-epoch processing every worker pulls from the same
/// logical provider, so together they see each split exactly once.
#[async_trait]
pub trait SplitProvider: Send {
    /// Returns the next split, or `None` once the sequence is exhausted.
    async fn get_next(&mut self) -> Result<Option<Split>>;

    /// Restarts the sequence from the beginning.
    async fn reset(&mut self) -> Result<()>;
}

/// Produces the elements of one pass over a dataset.
#[async_trait]
pub trait DatasetIterator: Send {
    /// Returns the next element, or `None` at end of sequence.
    async fn get_next(&mut self) -> Result<Option<Vec<Tensor>>>;
}

/// An executable dataset.
pub trait Dataset: Send + Sync {
    /// Builds an iterator. With a split provider, the iterator only produces
    /// the elements named by the splits it receives.
    fn make_iterator(
        &self,
        split_provider: Option<Box<dyn SplitProvider>>,
    ) -> Result<Box<dyn DatasetIterator>>;

    /// Builds a provider over this dataset's full split sequence.
    fn make_split_provider(&self) -> Result<Box<dyn SplitProvider>>;
}

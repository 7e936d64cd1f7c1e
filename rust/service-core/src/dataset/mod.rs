// rust/service-core/src/dataset/mod.rs

//! Dataset abstraction consumed by the dispatcher and workers.
//!
//! The service core only needs three things from a dataset: an iterator over
//! its elements, a split provider that partitions it for distributed-epoch
//! processing, and a stable fingerprint of its serialized graph.
//!
//! # Example
//!
//! ```ignore
//! use dataservice_core::dataset::{Dataset, DatasetDef, DatasetGraph, GraphDataset};
//!
//! let def = DatasetDef::from_graph(&DatasetGraph::range(0, 10))?;
//! let dataset = GraphDataset::from_def(&def)?;
//! let mut iterator = dataset.make_iterator(None)?;
//! while let Some(outputs) = iterator.get_next().await? {
//!     // outputs is a single scalar variant holding a CompressedElement
//! }
//! ```

mod element;
mod graph;
mod traits;

pub use element::{
    compressed_element_from_outputs, CompressedElement, DataType, Tensor, TensorValues,
    VariantValue,
};
pub use graph::{
    split_index, DatasetDef, DatasetGraph, GraphDataset, IndexSplitProvider, REPEAT_FOREVER,
};
pub use traits::{Dataset, DatasetIterator, Split, SplitProvider};

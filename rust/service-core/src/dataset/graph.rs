// rust/service-core/src/dataset/graph.rs

//! Serialized dataset graphs and their execution.
//!
//! A `DatasetDef` carries a bincode-encoded `DatasetGraph`. `GraphDataset`
//! executes a graph, yielding each element as a scalar variant tensor that
//! holds the lz4-compressed element bytes.

use std::hash::Hasher;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use super::element::{CompressedElement, Tensor, VariantValue};
use super::traits::{Dataset, DatasetIterator, Split, SplitProvider};
use crate::error::{Result, ServiceError};

/// Repeat count meaning "repeat forever".
pub const REPEAT_FOREVER: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetGraph {
    /// Integers `start, start+step, ...` up to but excluding `stop`.
    Range { start: i64, stop: i64, step: i64 },
    /// A fixed list of opaque elements.
    FromElements { elements: Vec<Vec<u8>> },
    /// `input` repeated `count` times, or forever for `REPEAT_FOREVER`.
    Repeat { input: Box<DatasetGraph>, count: i64 },
}

impl DatasetGraph {
    pub fn range(start: i64, stop: i64) -> Self {
        Self::Range {
            start,
            stop,
            step: 1,
        }
    }

    pub fn from_elements(elements: Vec<Vec<u8>>) -> Self {
        Self::FromElements { elements }
    }

    #[must_use]
    pub fn repeat(self, count: i64) -> Self {
        Self::Repeat {
            input: Box::new(self),
            count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Range { step, .. } if *step == 0 => {
                Err(ServiceError::invalid_argument("range step must not be zero"))
            }
            Self::Range { .. } | Self::FromElements { .. } => Ok(()),
            Self::Repeat { count, .. } if *count < REPEAT_FOREVER => Err(
                ServiceError::invalid_argument(format!("invalid repeat count {count}")),
            ),
            Self::Repeat { input, .. } => input.validate(),
        }
    }

    /// Number of elements one pass over a leaf produces, or over the
    /// repeated input for `Repeat`.
    fn num_splits(&self) -> usize {
        match self {
            Self::Range { start, stop, step } => range_len(*start, *stop, *step),
            Self::FromElements { elements } => elements.len(),
            Self::Repeat { input, .. } => input.num_splits(),
        }
    }
}

fn range_len(start: i64, stop: i64, step: i64) -> usize {
    let (span, stride) = if step > 0 && stop > start {
        (i128::from(stop) - i128::from(start), i128::from(step))
    } else if step < 0 && start > stop {
        (i128::from(start) - i128::from(stop), -i128::from(step))
    } else {
        return 0;
    };
    usize::try_from((span + stride - 1) / stride).unwrap_or(usize::MAX)
}

/// Serialized dataset graph as stored by the dispatcher and shipped to workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDef {
    pub graph: Vec<u8>,
}

impl DatasetDef {
    pub fn from_graph(graph: &DatasetGraph) -> Result<Self> {
        Ok(Self {
            graph: bincode::serialize(graph)?,
        })
    }

    /// Decodes and validates the graph.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the bytes are not a valid graph.
    pub fn graph(&self) -> Result<DatasetGraph> {
        let graph: DatasetGraph = bincode::deserialize(&self.graph).map_err(|e| {
            ServiceError::invalid_argument(format!("failed to decode dataset graph: {e}"))
        })?;
        graph.validate()?;
        Ok(graph)
    }

    /// Content hash of the canonical encoding of the graph.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the graph can't be decoded.
    pub fn fingerprint(&self) -> Result<u64> {
        let canonical = bincode::serialize(&self.graph()?)?;
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&canonical);
        Ok(hasher.finish())
    }
}

/// A dataset executed directly from its graph.
#[derive(Debug, Clone)]
pub struct GraphDataset {
    graph: Arc<DatasetGraph>,
}

impl GraphDataset {
    pub fn new(graph: DatasetGraph) -> Result<Self> {
        graph.validate()?;
        Ok(Self {
            graph: Arc::new(graph),
        })
    }

    pub fn from_def(def: &DatasetDef) -> Result<Self> {
        Self::new(def.graph()?)
    }
}

impl Dataset for GraphDataset {
    fn make_iterator(
        &self,
        split_provider: Option<Box<dyn SplitProvider>>,
    ) -> Result<Box<dyn DatasetIterator>> {
        Ok(Box::new(GraphIterator {
            root: NodeIter::new(&self.graph),
            split_provider,
        }))
    }

    fn make_split_provider(&self) -> Result<Box<dyn SplitProvider>> {
        Ok(Box::new(IndexSplitProvider::new(self.graph.num_splits())))
    }
}

/// Splits are little-endian `i64` element indices into one pass of the
/// dataset's leaf.
#[derive(Debug)]
pub struct IndexSplitProvider {
    len: usize,
    next: usize,
}

impl IndexSplitProvider {
    pub fn new(len: usize) -> Self {
        Self { len, next: 0 }
    }
}

#[async_trait]
impl SplitProvider for IndexSplitProvider {
    async fn get_next(&mut self) -> Result<Option<Split>> {
        if self.next >= self.len {
            return Ok(None);
        }
        let split = (self.next as i64).to_le_bytes().to_vec();
        self.next += 1;
        Ok(Some(split))
    }

    async fn reset(&mut self) -> Result<()> {
        self.next = 0;
        Ok(())
    }
}

/// Decodes a split produced by `IndexSplitProvider`.
pub fn split_index(split: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = split.try_into().map_err(|_| {
        ServiceError::invalid_argument(format!(
            "expected an 8-byte index split, got {} bytes",
            split.len()
        ))
    })?;
    Ok(i64::from_le_bytes(bytes))
}

struct GraphIterator {
    root: NodeIter,
    split_provider: Option<Box<dyn SplitProvider>>,
}

#[async_trait]
impl DatasetIterator for GraphIterator {
    async fn get_next(&mut self) -> Result<Option<Vec<Tensor>>> {
        let Some(payload) = self.root.next(&mut self.split_provider).await? else {
            return Ok(None);
        };
        let element = CompressedElement::compress(&payload);
        Ok(Some(vec![Tensor::scalar_variant(VariantValue::Compressed(
            element,
        ))]))
    }
}

enum NodeIter {
    Range {
        start: i64,
        step: i64,
        len: usize,
        next: usize,
    },
    Elements {
        elements: Arc<Vec<Vec<u8>>>,
        next: usize,
    },
    Repeat {
        input: Arc<DatasetGraph>,
        count: i64,
        completed: i64,
        current: Box<NodeIter>,
    },
}

impl NodeIter {
    fn new(graph: &DatasetGraph) -> Self {
        match graph {
            DatasetGraph::Range { start, stop, step } => Self::Range {
                start: *start,
                step: *step,
                len: range_len(*start, *stop, *step),
                next: 0,
            },
            DatasetGraph::FromElements { elements } => Self::Elements {
                elements: Arc::new(elements.clone()),
                next: 0,
            },
            DatasetGraph::Repeat { input, count } => Self::Repeat {
                input: Arc::new((**input).clone()),
                count: *count,
                completed: 0,
                current: Box::new(Self::new(input)),
            },
        }
    }

    fn leaf_len(&self) -> usize {
        match self {
            Self::Range { len, .. } => *len,
            Self::Elements { elements, .. } => elements.len(),
            Self::Repeat { current, .. } => current.leaf_len(),
        }
    }

    fn leaf_element(&self, index: usize) -> Option<Vec<u8>> {
        match self {
            Self::Range {
                start, step, len, ..
            } if index < *len => {
                let value = start.wrapping_add(step.wrapping_mul(index as i64));
                Some(value.to_le_bytes().to_vec())
            }
            Self::Elements { elements, .. } => elements.get(index).cloned(),
            _ => None,
        }
    }

    /// Next leaf index to produce: from the split provider when one is
    /// attached, otherwise from the local cursor.
    async fn next_index(
        &mut self,
        split_provider: &mut Option<Box<dyn SplitProvider>>,
    ) -> Result<Option<usize>> {
        if let Some(provider) = split_provider.as_mut() {
            let Some(split) = provider.get_next().await? else {
                return Ok(None);
            };
            let index = split_index(&split)?;
            let len = self.leaf_len();
            return match usize::try_from(index) {
                Ok(i) if i < len => Ok(Some(i)),
                _ => Err(ServiceError::invalid_argument(format!(
                    "split index {index} out of range for dataset with {len} elements"
                ))),
            };
        }
        let next = match self {
            Self::Range { next, .. } | Self::Elements { next, .. } => next,
            Self::Repeat { .. } => return Ok(None),
        };
        let index = *next;
        *next += 1;
        Ok(Some(index))
    }

    fn next<'a>(
        &'a mut self,
        split_provider: &'a mut Option<Box<dyn SplitProvider>>,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move {
            if let Self::Repeat {
                input,
                count,
                completed,
                current,
            } = self
            {
                loop {
                    if *count != REPEAT_FOREVER && *completed >= *count {
                        return Ok(None);
                    }
                    if let Some(element) = current.next(split_provider).await? {
                        return Ok(Some(element));
                    }
                    *completed += 1;
                    // Only an empty source ends the repeat early. A pass that
                    // got no splits because other consumers took them all
                    // moves on to the next repetition.
                    if current.leaf_len() == 0 {
                        return Ok(None);
                    }
                    if *count != REPEAT_FOREVER && *completed >= *count {
                        return Ok(None);
                    }
                    if let Some(provider) = split_provider.as_mut() {
                        provider.reset().await?;
                    }
                    **current = Self::new(input);
                }
            }

            let len = self.leaf_len();
            match self.next_index(split_provider).await? {
                Some(index) if index < len => Ok(self.leaf_element(index)),
                _ => Ok(None),
            }
        }
        .boxed()
    }
}

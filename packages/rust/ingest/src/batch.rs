//! Fixed-size batching of normalized documents.

use tedsync_shared::Document;

/// Collects documents until `bulk_size` are pending.
///
/// `drain` consumes the accumulator, so the final partial batch can only be
/// taken once.
#[derive(Debug)]
pub struct BatchAccumulator {
    bulk_size: usize,
    pending: Vec<Document>,
}

impl BatchAccumulator {
    /// A `bulk_size` of 0 is treated as 1.
    pub fn new(bulk_size: usize) -> Self {
        let bulk_size = bulk_size.max(1);
        Self {
            bulk_size,
            pending: Vec::with_capacity(bulk_size),
        }
    }

    pub fn add(&mut self, doc: Document) {
        self.pending.push(doc);
    }

    /// Take a full batch, if one is ready.
    pub fn flush_if_full(&mut self) -> Option<Vec<Document>> {
        if self.pending.len() < self.bulk_size {
            return None;
        }
        let rest = self.pending.split_off(self.bulk_size);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Take whatever is left.
    pub fn drain(self) -> Option<Vec<Document>> {
        (!self.pending.is_empty()).then_some(self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

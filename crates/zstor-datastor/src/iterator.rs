//! Random shard iteration

use crate::Shard;
use rand::Rng;

/// One-shot iterator over a set of shards in uniformly random order
///
/// The permutation is drawn lazily: each call picks uniformly among the
/// shards not yet returned. Callers keep pulling shards until they have as
/// many healthy ones as they need.
#[derive(Debug)]
pub struct ShardIterator {
    remaining: Vec<Shard>,
}

impl ShardIterator {
    pub(crate) fn new(shards: Vec<Shard>) -> Self {
        Self { remaining: shards }
    }
}

impl Iterator for ShardIterator {
    type Item = Shard;

    fn next(&mut self) -> Option<Shard> {
        if self.remaining.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.remaining.len());
        Some(self.remaining.swap_remove(idx))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining.len(), Some(self.remaining.len()))
    }
}

impl ExactSizeIterator for ShardIterator {}

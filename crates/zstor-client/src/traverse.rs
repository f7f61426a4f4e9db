//! Traversal of linked metadata
//!
//! A [`TraverseIterator`] walks a chain of metadata records by key, forward
//! along `next` links or backward along `previous` links, and filters the
//! records by epoch. Epoch bounds that are zero or negative are unbounded.
//!
//! Records on the near side of the range are skipped; the first record past
//! the far side ends the walk. Walking forward, the near side is the lower
//! bound; walking backward, it is the upper bound. Links leading back to a
//! record already visited end the walk with [`Error::LinkCycle`].

use crate::pipeline::Pipeline;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};
use zstor_common::{Error, Metadata, Result, display_key};
use zstor_metastor::MetaStore;

/// Direction of a traversal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Follow `next` links, oldest to newest
    Forward,
    /// Follow `previous` links, newest to oldest
    Backward,
}

/// Inclusive epoch range; `None` bounds are open
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochRange {
    lower: Option<i64>,
    upper: Option<i64>,
}

impl EpochRange {
    /// Build a range from raw bounds, treating values `<= 0` as unbounded
    pub fn new(lower: i64, upper: i64) -> Result<Self> {
        let lower = (lower > 0).then_some(lower);
        let upper = (upper > 0).then_some(upper);
        if let (Some(l), Some(u)) = (lower, upper) {
            if l > u {
                return Err(Error::InvalidEpochRange { start: l, end: u });
            }
        }
        Ok(Self { lower, upper })
    }

    fn below(&self, epoch: i64) -> bool {
        self.lower.is_some_and(|l| epoch < l)
    }

    fn above(&self, epoch: i64) -> bool {
        self.upper.is_some_and(|u| epoch > u)
    }
}

enum State {
    Unstarted,
    Positioned(Metadata),
    /// Keeps the last positioned record, if any
    Exhausted(Option<Metadata>),
}

/// Stateful cursor over a chain of metadata records
///
/// Not shareable between tasks: every call takes the iterator exclusively
/// or reads the current position.
pub struct TraverseIterator {
    metastore: Arc<dyn MetaStore>,
    pipeline: Arc<Pipeline>,
    direction: Direction,
    range: EpochRange,
    next_key: Option<Vec<u8>>,
    /// Keys loaded so far
    visited: HashSet<Vec<u8>>,
    state: State,
}

impl TraverseIterator {
    pub(crate) fn new(
        metastore: Arc<dyn MetaStore>,
        pipeline: Arc<Pipeline>,
        start_key: &[u8],
        direction: Direction,
        range: EpochRange,
    ) -> Result<Self> {
        if start_key.is_empty() {
            return Err(Error::MissingStartKey);
        }
        Ok(Self {
            metastore,
            pipeline,
            direction,
            range,
            next_key: Some(start_key.to_vec()),
            visited: HashSet::new(),
            state: State::Unstarted,
        })
    }

    /// Direction of this traversal
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Move to the next record within the epoch range
    ///
    /// Returns `Ok(false)` once the chain ends or leaves the range. A failed
    /// metadata lookup or a link cycle exhausts the iterator and is returned
    /// as the error.
    pub async fn next(&mut self) -> Result<bool> {
        while let Some(key) = self.next_key.take() {
            if !self.visited.insert(key.clone()) {
                warn!("Traversal reached {} a second time", display_key(&key));
                self.exhaust();
                return Err(Error::LinkCycle {
                    key: display_key(&key),
                });
            }
            let metadata = match self.metastore.get_metadata(&key).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.exhaust();
                    return Err(e);
                }
            };
            let following = match self.direction {
                Direction::Forward => metadata.next.clone(),
                Direction::Backward => metadata.previous.clone(),
            }
            .filter(|k| !k.is_empty());

            let (before, after) = (
                self.range.below(metadata.epoch),
                self.range.above(metadata.epoch),
            );
            let (skip, stop) = match self.direction {
                Direction::Forward => (before, after),
                Direction::Backward => (after, before),
            };
            if stop {
                debug!(
                    "Traversal stopped at {}: epoch {} out of range",
                    display_key(&key),
                    metadata.epoch
                );
                break;
            }
            if skip {
                debug!(
                    "Traversal skipped {}: epoch {} not yet in range",
                    display_key(&key),
                    metadata.epoch
                );
                self.next_key = following;
                continue;
            }

            self.next_key = following;
            self.state = State::Positioned(metadata);
            return Ok(true);
        }
        self.exhaust();
        Ok(false)
    }

    fn exhaust(&mut self) {
        self.next_key = None;
        self.state = match std::mem::replace(&mut self.state, State::Unstarted) {
            State::Unstarted => State::Exhausted(None),
            State::Positioned(metadata) => State::Exhausted(Some(metadata)),
            exhausted @ State::Exhausted(_) => exhausted,
        };
    }

    /// Key the next call to [`next`](Self::next) will load, without moving
    #[must_use]
    pub fn peek_next_key(&self) -> Option<&[u8]> {
        self.next_key.as_deref()
    }

    /// Record at the current position
    ///
    /// After exhaustion this keeps returning the last positioned record.
    pub fn get_metadata(&self) -> Result<&Metadata> {
        match &self.state {
            State::Positioned(metadata) | State::Exhausted(Some(metadata)) => Ok(metadata),
            State::Unstarted | State::Exhausted(None) => Err(Error::NotPositioned),
        }
    }

    /// Write the data of the record at the current position to `writer`
    pub async fn read_data<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let metadata = self.get_metadata()?;
        self.pipeline.read(metadata, writer).await
    }
}

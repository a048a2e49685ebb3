//! The recency cache of completed request results.

use std::num::NonZeroUsize;
use std::sync::Arc;

use thiserror::Error;

use crate::ring_buffer::RingBuffer;

/// The outcome of a completed, cacheable request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResult<T, E> {
    /// The ID of the request that produced this result.
    pub id: String,
    /// What the request's `run` returned, errors included.
    ///
    /// Shared so handing out a cached result never clones the value itself.
    pub result: Arc<Result<T, E>>,
}

/// Returned by [`RecencyCache::find`] when no result for the ID is cached.
///
/// This is the expected outcome for every request that has not completed recently, and not a
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not find result of request with ID {id} in cache")]
pub struct NotFound {
    /// The ID that was looked up.
    pub id: String,
}

/// Keeps the results of the last `capacity` cacheable requests.
///
/// This is a "last N" cache and not an LRU: lookups never change which entry gets evicted next.
/// Lookups scan all entries, which is fine for the small capacities this is meant for.
#[derive(Debug)]
pub struct RecencyCache<T, E> {
    entries: RingBuffer<CachedResult<T, E>>,
}

impl<T, E> RecencyCache<T, E> {
    /// Creates an empty cache holding at most `capacity` results.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RingBuffer::new(capacity),
        }
    }

    /// Stores a result as the most recent entry, evicting the oldest one when full.
    pub fn insert(&mut self, id: String, result: Arc<Result<T, E>>) {
        self.entries.append(CachedResult { id, result });
    }

    /// Finds the most recently cached result for `id`.
    pub fn find(&self, id: &str) -> Result<&CachedResult<T, E>, NotFound> {
        for index in 0..self.entries.len() {
            match self.entries.item(index) {
                Ok(entry) if entry.id == id => return Ok(entry),
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        len = self.entries.len(),
                        "Recency cache length and contents disagree",
                    );
                    debug_assert!(false, "{error}");
                }
            }
        }

        Err(NotFound { id: id.to_owned() })
    }

    /// The number of cached results.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no result has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The maximum number of results kept.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

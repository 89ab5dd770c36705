//! Insertion-ordered chunk table with lifecycle rules.
//!
//! Every chunk ever created stays in the table for the life of the registry.
//! Lookups by id resolve to the first record with that id in insertion order,
//! whether that record is live or freed, so duplicate ids shadow each other
//! the same way every time.
//!
//! Thread-safe via a single `parking_lot::Mutex`. Each public operation holds
//! the lock for its whole duration, which is what makes concurrent frees of
//! the same id resolve to exactly one `Freed`.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;

use crate::chunk::{Chunk, ChunkId, ChunkState, ChunkView, filled_payload};
use crate::config::{
    CREATE_DECLARED_SIZE, MAX_PAYLOAD_LEN, RAF_LEAK_LEN, UAF_LEAK_LEN, sentinel_bytes,
};
use crate::metrics::{RegistryMetrics, RegistryMetricsSnapshot};

/// Result of [`ChunkRegistry::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// `Live -> Freed`.
    Freed,
    /// The chunk was already freed (double free). State is unchanged.
    AlreadyFreed,
    NotFound,
}

/// Result of [`ChunkRegistry::mark_deleted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// `Live -> Freed`.
    Deleted,
    /// The chunk was already freed (double free). State is unchanged.
    AlreadyDeleted,
    NotFound,
}

/// Result of [`ChunkRegistry::use_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UseOutcome {
    Value(Vec<u8>),
    /// Touched a freed chunk: the sentinel plus up to 8 stale payload bytes.
    UafDetected { sentinel: [u8; 8], leaked: Vec<u8> },
    NotFound,
}

/// Result of [`ChunkRegistry::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Value(Vec<u8>),
    /// Read a freed chunk: up to 16 stale payload bytes.
    ReadAfterFree(Vec<u8>),
    NotFound,
}

/// Counts reported by [`ChunkRegistry::info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Records ever inserted (freed ones included).
    pub chunks: usize,
    /// Distinct ids that have been freed at least once.
    pub freed_ids: usize,
}

#[derive(Default)]
struct RegistryInner {
    chunks: Vec<Chunk>,
    freed_ids: HashSet<String>,
}

impl RegistryInner {
    fn first_mut(&mut self, id: &str) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|chunk| chunk.id == id)
    }

    fn first(&self, id: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.id == id)
    }

    /// Shared transition behind both free-like entry points.
    /// `Some(true)` freed now, `Some(false)` already freed, `None` unknown id.
    fn release(&mut self, id: &str) -> Option<bool> {
        let chunk = self.first_mut(id)?;
        if !chunk.state.is_live() {
            return Some(false);
        }
        chunk.state = ChunkState::Freed;
        self.freed_ids.insert(id.to_owned());
        Some(true)
    }
}

/// The simulated heap: an append-only table of chunks.
pub struct ChunkRegistry {
    inner: Mutex<RegistryInner>,
    metrics: RegistryMetrics,
}

impl ChunkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            metrics: RegistryMetrics::new(),
        }
    }

    /// Append a live chunk with an auto-filled payload. Never fails; an id
    /// that already exists produces a second record shadowed by the first.
    pub fn create(&self, id: &str) -> ChunkId {
        let mut inner = self.inner.lock();
        let index = inner.chunks.len() as u64;
        let payload = filled_payload(id, index);
        inner
            .chunks
            .push(Chunk::live(id.to_owned(), payload, CREATE_DECLARED_SIZE));
        RegistryMetrics::inc(&self.metrics.creates);
        ChunkId::new(id)
    }

    /// Append a live chunk named `chunk_<n>`, `n` being the table length
    /// before insertion. `data` is truncated to `min(size, 256)` bytes; the
    /// declared size is recorded but never enforced.
    pub fn allocate(&self, size: u32, data: &[u8]) -> ChunkId {
        let keep = data.len().min(MAX_PAYLOAD_LEN).min(size as usize);
        let mut inner = self.inner.lock();
        let id = format!("chunk_{}", inner.chunks.len());
        inner
            .chunks
            .push(Chunk::live(id.clone(), data[..keep].to_vec(), size));
        RegistryMetrics::inc(&self.metrics.allocations);
        ChunkId::new(id)
    }

    /// Free the first chunk named `id`.
    pub fn free(&self, id: &str) -> FreeOutcome {
        let outcome = match self.inner.lock().release(id) {
            Some(true) => FreeOutcome::Freed,
            Some(false) => FreeOutcome::AlreadyFreed,
            None => FreeOutcome::NotFound,
        };
        self.count_release(outcome == FreeOutcome::Freed, outcome == FreeOutcome::NotFound);
        outcome
    }

    /// Same transition as [`free`](Self::free), reported under its own outcome type.
    pub fn mark_deleted(&self, id: &str) -> DeleteOutcome {
        let outcome = match self.inner.lock().release(id) {
            Some(true) => DeleteOutcome::Deleted,
            Some(false) => DeleteOutcome::AlreadyDeleted,
            None => DeleteOutcome::NotFound,
        };
        self.count_release(
            outcome == DeleteOutcome::Deleted,
            outcome == DeleteOutcome::NotFound,
        );
        outcome
    }

    /// Access the first chunk named `id`.
    pub fn use_chunk(&self, id: &str) -> UseOutcome {
        let inner = self.inner.lock();
        match inner.first(id) {
            None => {
                RegistryMetrics::inc(&self.metrics.not_found);
                UseOutcome::NotFound
            }
            Some(chunk) if chunk.state.is_live() => UseOutcome::Value(chunk.payload.clone()),
            Some(chunk) => {
                RegistryMetrics::inc(&self.metrics.use_after_free);
                UseOutcome::UafDetected {
                    sentinel: sentinel_bytes(),
                    leaked: chunk.prefix(UAF_LEAK_LEN),
                }
            }
        }
    }

    /// Read the first chunk named `id`.
    pub fn read(&self, id: &str) -> ReadOutcome {
        let inner = self.inner.lock();
        match inner.first(id) {
            None => {
                RegistryMetrics::inc(&self.metrics.not_found);
                ReadOutcome::NotFound
            }
            Some(chunk) if chunk.state.is_live() => ReadOutcome::Value(chunk.payload.clone()),
            Some(chunk) => {
                RegistryMetrics::inc(&self.metrics.read_after_free);
                ReadOutcome::ReadAfterFree(chunk.prefix(RAF_LEAK_LEN))
            }
        }
    }

    #[must_use]
    pub fn info(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            chunks: inner.chunks.len(),
            freed_ids: inner.freed_ids.len(),
        }
    }

    /// Insertion-ordered view of every record.
    #[must_use]
    pub fn entries(&self) -> Vec<ChunkView> {
        self.inner.lock().chunks.iter().map(Chunk::view).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record, freed id and counter.
    ///
    /// The registry otherwise grows without bound; this is the hook for a
    /// supervisor that wants a clean table between scenarios.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.freed_ids.clear();
        self.metrics.reset();
    }

    #[must_use]
    pub fn metrics(&self) -> RegistryMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn count_release(&self, freed: bool, missing: bool) {
        let counter = if freed {
            &self.metrics.frees
        } else if missing {
            &self.metrics.not_found
        } else {
            &self.metrics.double_frees
        };
        RegistryMetrics::inc(counter);
    }
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

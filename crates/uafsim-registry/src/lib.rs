//! Symbolic heap for uafsim.
//!
//! This crate models heap object lifecycles without touching a real
//! allocator. A chunk is a named record with payload bytes, a declared size
//! and a live/freed flag; the registry applies the lifecycle rules and turns
//! unsafe sequences into typed outcomes instead of undefined behavior.
//!
//! # Architecture
//!
//! - **Chunks** (`chunk`): record shape, lifecycle state, deterministic payload filler
//! - **Registry** (`registry`): append-only table, first-match lookup, outcome types
//! - **Configuration** (`config`): field widths and the use-after-free sentinel
//! - **Metrics** (`metrics`): atomic counters for detections and lookups

pub mod chunk;
pub mod config;
pub mod metrics;
pub mod registry;

pub use chunk::{ChunkId, ChunkState, ChunkView};
pub use metrics::{RegistryMetrics, RegistryMetricsSnapshot};
pub use registry::{
    ChunkRegistry, DeleteOutcome, FreeOutcome, ReadOutcome, Snapshot, UseOutcome,
};

//! # metasieve-memory
//!
//! Memory-pressure-aware execution support for extraction jobs:
//!
//! - [`MemoryManager`]: point-in-time memory snapshots, pressure
//!   classification and per-job [`Strategy`](metasieve_core::Strategy)
//!   selection
//! - [`StreamingLayer`]: the [`ExtractionIo`](metasieve_core::ExtractionIo)
//!   implementation handed to units, providing chunked, restartable file
//!   reads through pooled buffers
//! - [`BufferPool`]: reusable byte buffers keyed by size class, with
//!   allocation/reuse/deallocation counters for observability
//!
//! Strategy selection is deterministic: with at least 3x the file size
//! available the job runs Aggressive (full-buffer reads, large chunks),
//! between 1x and 3x Balanced, otherwise Conservative (forced streaming,
//! smallest chunks). Critical pressure always forces Conservative; it is a
//! signal, never an abort.

pub mod monitor;
pub mod pool;
pub mod stream;

pub use monitor::{MemoryManager, MemoryThresholds};
pub use pool::{BufferPool, PoolStats};
pub use stream::{ChunkStream, StreamingLayer};

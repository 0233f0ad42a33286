//! Trait seams for metasieve components.
//!
//! - [`Entrypoint`]: the callable contract every capability unit implements
//! - [`ExtractionIo`]: streaming reads and buffer leasing, implemented by the
//!   memory layer
//! - [`ByteStream`]: a forward-only, restartable chunk sequence
//!
//! These traits keep unit internals opaque: the core never sees which parser
//! a unit calls, only its declared metadata and this interface.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::error::UnitError;
use crate::types::{FieldMap, FileDescriptor, Strategy, UpstreamResults};

/// Callable contract of a capability unit.
///
/// Implementations are registered under an entrypoint id at host startup and
/// referenced by name from unit manifests. An entrypoint must be cheap to
/// share (`Arc`) and safe to invoke concurrently for different files.
#[async_trait]
pub trait Entrypoint: Send + Sync {
    /// Run the unit against one file, returning its extracted fields.
    ///
    /// Errors are captured by the dispatcher as per-unit FAILED outcomes and
    /// never propagate to the caller of a dispatch run.
    async fn run(&self, ctx: &UnitContext) -> Result<FieldMap, UnitError>;
}

/// A lazy, forward-only sequence of byte chunks over one file.
///
/// Consuming the stream never holds more than the configured chunk size in
/// memory at a time: the returned slice borrows the stream's internal
/// (pooled) buffer and is overwritten by the next call. The sequence is
/// finite and restartable from the start. Structured-format readers may
/// yield one structural element per chunk instead of a fixed byte count.
#[async_trait]
pub trait ByteStream: Send {
    /// Next chunk, or `None` at end of file.
    async fn next_chunk(&mut self) -> std::io::Result<Option<&[u8]>>;

    /// Rewind to the beginning of the file.
    async fn restart(&mut self) -> std::io::Result<()>;

    /// Configured maximum chunk length in bytes.
    fn chunk_size(&self) -> usize;
}

/// I/O services available to a unit invocation: chunked reads and reusable
/// buffer leasing.
#[async_trait]
pub trait ExtractionIo: Send + Sync {
    /// Open a chunked stream over a file.
    async fn open_stream(
        &self,
        path: &Path,
        chunk_size: usize,
    ) -> std::io::Result<Box<dyn ByteStream>>;

    /// Lease a reusable buffer of at least `size_class` bytes.
    fn allocate(&self, size_class: usize) -> Vec<u8>;

    /// Return a leased buffer to the pool.
    fn release(&self, buf: Vec<u8>);
}

/// Execution context handed to each unit invocation.
///
/// The strategy is advisory: nothing prevents a unit from ignoring it and
/// reading the whole file into memory. That is a deliberate boundary: the
/// unit contract has no allocator seam through which a hard quota could be
/// enforced.
pub struct UnitContext {
    /// The file under extraction
    pub file: FileDescriptor,
    /// Execution profile selected for this job
    pub strategy: Strategy,
    /// Outcomes of this unit's direct dependencies
    pub upstream: UpstreamResults,
    /// Streaming and buffer services
    pub io: Arc<dyn ExtractionIo>,
}

impl UnitContext {
    /// Open a chunked stream over the job's file using the strategy's chunk
    /// size policy.
    pub async fn open_stream(&self) -> std::io::Result<Box<dyn ByteStream>> {
        self.io
            .open_stream(&self.file.path, self.strategy.chunk_size())
            .await
    }
}

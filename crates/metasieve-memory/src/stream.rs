//! Chunked, restartable file streaming through pooled buffers.

use async_trait::async_trait;
use metasieve_core::{ByteStream, ExtractionIo};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::trace;

use crate::pool::BufferPool;

/// The [`ExtractionIo`] implementation handed to capability units.
///
/// One streaming layer is shared across all jobs; it owns the buffer pool
/// whose counters feed the observability surface.
pub struct StreamingLayer {
    pool: Arc<BufferPool>,
}

impl StreamingLayer {
    #[must_use]
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    /// The shared buffer pool (for stats reporting).
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Default for StreamingLayer {
    fn default() -> Self {
        Self::new(Arc::new(BufferPool::default()))
    }
}

#[async_trait]
impl ExtractionIo for StreamingLayer {
    async fn open_stream(
        &self,
        path: &Path,
        chunk_size: usize,
    ) -> std::io::Result<Box<dyn ByteStream>> {
        let stream = ChunkStream::open(path, chunk_size, Arc::clone(&self.pool)).await?;
        Ok(Box::new(stream))
    }

    fn allocate(&self, size_class: usize) -> Vec<u8> {
        self.pool.allocate(size_class)
    }

    fn release(&self, buf: Vec<u8>) {
        self.pool.release(buf);
    }
}

/// Forward-only chunk reader over one file.
///
/// Holds a single pooled buffer of `chunk_size` bytes for its whole lifetime;
/// each [`next_chunk`](ByteStream::next_chunk) overwrites it. The buffer
/// returns to the pool on drop, including when a job is cancelled mid-read.
pub struct ChunkStream {
    file: File,
    path: PathBuf,
    chunk_size: usize,
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl ChunkStream {
    /// Open a stream with the given chunk size.
    pub async fn open(
        path: &Path,
        chunk_size: usize,
        pool: Arc<BufferPool>,
    ) -> std::io::Result<Self> {
        let chunk_size = chunk_size.max(1);
        let file = File::open(path).await?;
        let mut buf = pool.allocate(chunk_size);
        buf.resize(chunk_size, 0);
        trace!(path = %path.display(), chunk_size, "opened chunk stream");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            chunk_size,
            buf,
            pool,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteStream for ChunkStream {
    async fn next_chunk(&mut self) -> std::io::Result<Option<&[u8]>> {
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.file.read(&mut self.buf[filled..self.chunk_size]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            Ok(None)
        } else {
            Ok(Some(&self.buf[..filled]))
        }
    }

    async fn restart(&mut self) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn collect(stream: &mut ChunkStream) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            chunks.push(chunk.to_vec());
        }
        chunks
    }

    #[tokio::test]
    async fn test_chunks_never_exceed_chunk_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();

        let pool = Arc::new(BufferPool::default());
        let mut stream = ChunkStream::open(&path, 4096, pool).await.unwrap();
        let chunks = collect(&mut stream).await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 4096);
        assert_eq!(chunks[2].len(), 10_000 - 2 * 4096);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
    }

    #[tokio::test]
    async fn test_empty_file_yields_no_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let pool = Arc::new(BufferPool::default());
        let mut stream = ChunkStream::open(&path, 1024, pool).await.unwrap();
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_replays_from_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"abcdefgh").unwrap();

        let pool = Arc::new(BufferPool::default());
        let mut stream = ChunkStream::open(&path, 3, pool).await.unwrap();

        let first_pass = collect(&mut stream).await;
        stream.restart().await.unwrap();
        let second_pass = collect(&mut stream).await;

        assert_eq!(first_pass, second_pass);
        assert_eq!(first_pass.concat(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_stream_buffer_returns_to_pool_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"xyz").unwrap();

        let pool = Arc::new(BufferPool::default());
        {
            let _stream = ChunkStream::open(&path, 2048, Arc::clone(&pool))
                .await
                .unwrap();
            assert_eq!(pool.stats().allocations, 1);
            assert_eq!(pool.stats().idle_buffers, 0);
        }
        assert_eq!(pool.stats().idle_buffers, 1);

        // A second stream of the same chunk size reuses the buffer.
        let _stream = ChunkStream::open(&path, 2048, Arc::clone(&pool))
            .await
            .unwrap();
        assert_eq!(pool.stats().reuses, 1);
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let pool = Arc::new(BufferPool::default());
        let result = ChunkStream::open(Path::new("/nonexistent/file"), 1024, pool).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_streaming_layer_io_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, b"streamed content").unwrap();

        let layer = StreamingLayer::default();
        let mut stream = layer.open_stream(&path, 4).await.unwrap();
        let mut total = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 4);
            total.extend_from_slice(chunk);
        }
        assert_eq!(total, b"streamed content");

        let buf = layer.allocate(128);
        layer.release(buf);
        assert_eq!(layer.pool().stats().idle_buffers, 1);
    }
}

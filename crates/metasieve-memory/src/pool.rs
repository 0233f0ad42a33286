//! Reusable buffer pool keyed by size class.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::trace;

/// Default cap on idle buffers kept per size class.
pub const DEFAULT_MAX_IDLE_PER_CLASS: usize = 8;

/// Observability counters for the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Buffers newly allocated because no idle buffer was available
    pub allocations: u64,
    /// Leases served from an idle buffer
    pub reuses: u64,
    /// Idle buffers dropped (over-cap releases and trims)
    pub deallocations: u64,
    /// Idle buffers currently held, across all size classes
    pub idle_buffers: u64,
}

/// Pool of reusable byte buffers keyed by size class.
///
/// The pool exclusively owns idle buffers; between [`allocate`](Self::allocate)
/// and [`release`](Self::release) the borrower exclusively owns the buffer.
/// The internal lock covers only allocate/release/trim, never unit execution.
pub struct BufferPool {
    idle: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    max_idle_per_class: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
    deallocations: AtomicU64,
}

impl BufferPool {
    /// Create a pool keeping at most `max_idle_per_class` idle buffers per
    /// size class.
    #[must_use]
    pub fn new(max_idle_per_class: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_class,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
        }
    }

    /// Lease a buffer with capacity of at least `size_class` bytes and length
    /// zero. Returns a previously released buffer of the class when one is
    /// idle, otherwise allocates.
    #[must_use]
    pub fn allocate(&self, size_class: usize) -> Vec<u8> {
        let reused = {
            let mut idle = self.idle.lock().expect("buffer pool lock poisoned");
            idle.get_mut(&size_class).and_then(Vec::pop)
        };

        match reused {
            Some(mut buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                trace!(size_class, "pool miss, allocating new buffer");
                Vec::with_capacity(size_class)
            }
        }
    }

    /// Return a leased buffer to the pool for future reuse. Buffers released
    /// beyond the per-class idle cap are dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        let size_class = buf.capacity();
        if size_class == 0 {
            return;
        }
        buf.clear();

        let mut idle = self.idle.lock().expect("buffer pool lock poisoned");
        let slot = idle.entry(size_class).or_default();
        if slot.len() < self.max_idle_per_class {
            slot.push(buf);
        } else {
            drop(idle);
            self.deallocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop all idle buffers (conservative-strategy tuning).
    pub fn trim(&self) {
        let drained: u64 = {
            let mut idle = self.idle.lock().expect("buffer pool lock poisoned");
            let count = idle.values().map(|v| v.len() as u64).sum();
            idle.clear();
            count
        };
        if drained > 0 {
            self.deallocations.fetch_add(drained, Ordering::Relaxed);
            trace!(drained, "trimmed idle buffers");
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let idle_buffers = {
            let idle = self.idle.lock().expect("buffer pool lock poisoned");
            idle.values().map(|v| v.len() as u64).sum()
        };
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            idle_buffers,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_PER_CLASS)
    }
}

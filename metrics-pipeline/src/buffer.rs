//! Pooled byte buffers and the shared batching buffer.
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

struct PoolInner {
    free: ArrayQueue<Vec<u8>>,
    chunk_capacity: usize,
    max_retained_capacity: usize,
}

/// A bounded pool of reusable byte buffers.
///
/// Acquiring pops a free buffer if one is available and allocates a new one otherwise, so acquisition never blocks.
/// Buffers return to the pool when their [`PooledBuffer`] guard is dropped. If the pool is already full, or the
/// buffer grew far beyond the usual chunk size, it is freed instead.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

impl ChunkPool {
    /// Creates a new `ChunkPool` holding at most `max_pooled` free buffers, each allocated with `chunk_capacity` bytes.
    pub fn new(max_pooled: usize, chunk_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(max_pooled.max(1)),
                chunk_capacity,
                max_retained_capacity: chunk_capacity.saturating_mul(4),
            }),
        }
    }

    /// Acquires an empty buffer.
    pub fn acquire(&self) -> PooledBuffer {
        let mut buf = self.inner.free.pop().unwrap_or_else(|| Vec::with_capacity(self.inner.chunk_capacity));
        buf.clear();
        PooledBuffer { buf, pool: Arc::clone(&self.inner) }
    }

    /// Returns the number of free buffers currently held.
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }
}

impl fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPool")
            .field("available", &self.available())
            .field("capacity", &self.inner.free.capacity())
            .finish()
    }
}

/// A byte buffer borrowed from a [`ChunkPool`].
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.buf.len()).finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.buf.capacity() <= self.pool.max_retained_capacity {
            let buf = std::mem::take(&mut self.buf);
            let _ = self.pool.free.push(buf);
        }
    }
}

/// Buffers detached from a [`SharedBuffer`], in the order they must be written.
#[derive(Debug, Default)]
pub struct Detached {
    buffers: [Option<PooledBuffer>; 2],
}

impl Detached {
    fn push(&mut self, buf: PooledBuffer) {
        if let Some(slot) = self.buffers.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(buf);
        }
    }

    /// Returns `true` if nothing was detached.
    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(Option::is_none)
    }
}

impl IntoIterator for Detached {
    type Item = PooledBuffer;
    type IntoIter = std::iter::Flatten<std::array::IntoIter<Option<PooledBuffer>, 2>>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter().flatten()
    }
}

/// An accumulation buffer that batches chunks up to a target size.
///
/// Merging a chunk takes a short-lived lock, appends it, and detaches the buffer once it is full. A detached buffer is
/// swapped for a fresh one from the pool, so the lock is never held while the detached bytes are written anywhere.
///
/// Chunks are never split:
///
/// - a chunk larger than the target is detached on its own, after any pending bytes
/// - a chunk that does not fit in the remaining space detaches the pending bytes and starts the next buffer
/// - a chunk that fills the buffer exactly detaches it, chunk included
pub struct SharedBuffer {
    pool: ChunkPool,
    target: usize,
    current: Mutex<PooledBuffer>,
}

impl SharedBuffer {
    /// Creates a new `SharedBuffer` that detaches once `target` bytes have accumulated.
    pub fn new(pool: ChunkPool, target: usize) -> Self {
        let current = Mutex::new(pool.acquire());
        Self { pool, target, current }
    }

    /// Returns the target size.
    pub fn target_size(&self) -> usize {
        self.target
    }

    /// Returns the pool that chunks and buffers are drawn from.
    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    /// Merges `chunk`, returning any buffers that are ready to be written.
    pub fn merge(&self, chunk: PooledBuffer) -> Detached {
        let mut detached = Detached::default();
        if chunk.is_empty() {
            return detached;
        }

        let mut current = self.current.lock();
        if chunk.len() > self.target {
            if !current.is_empty() {
                detached.push(self.swap(&mut current));
            }
            drop(current);
            detached.push(chunk);
            return detached;
        }

        if current.len() + chunk.len() > self.target {
            detached.push(self.swap(&mut current));
        }
        current.extend_from_slice(&chunk);
        if current.len() >= self.target {
            detached.push(self.swap(&mut current));
        }
        detached
    }

    /// Detaches the pending bytes, if there are any.
    pub fn take(&self) -> Option<PooledBuffer> {
        let mut current = self.current.lock();
        (!current.is_empty()).then(|| self.swap(&mut current))
    }

    /// Returns the number of pending bytes.
    pub fn len(&self) -> usize {
        self.current.lock().len()
    }

    /// Returns `true` if there are no pending bytes.
    pub fn is_empty(&self) -> bool {
        self.current.lock().is_empty()
    }

    fn swap(&self, current: &mut PooledBuffer) -> PooledBuffer {
        std::mem::replace(current, self.pool.acquire())
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer").field("target", &self.target).field("pending", &self.len()).finish()
    }
}

/// Serializes batches from many producers into a shared buffer.
///
/// Each producer writes its batch into a private chunk without holding any lock, and only the merge into the shared
/// buffer is serialized. A batch that fails to serialize is discarded whole, so no partial record ever reaches the
/// shared buffer.
#[derive(Debug)]
pub struct BatchWriter {
    shared: SharedBuffer,
}

impl BatchWriter {
    /// Creates a new `BatchWriter` that detaches buffers of `target` bytes.
    pub fn new(pool: ChunkPool, target: usize) -> Self {
        Self { shared: SharedBuffer::new(pool, target) }
    }

    /// Serializes a batch with `f`, then merges it.
    ///
    /// # Errors
    ///
    /// If `f` fails, the batch is discarded and the error is returned.
    pub fn write_batch<F, E>(&self, f: F) -> Result<Detached, E>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), E>,
    {
        let mut chunk = self.shared.pool().acquire();
        f(&mut chunk)?;
        Ok(self.shared.merge(chunk))
    }

    /// Detaches whatever is pending, for the final write of a collection cycle.
    pub fn finish(&self) -> Option<PooledBuffer> {
        self.shared.take()
    }
}

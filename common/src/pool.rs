//! Bounded pool of reusable fixed-size buffers
//!
//! Every [`Buffer`] handed out by [`BufferPool::acquire`] carries a semaphore permit, so
//! at most `max_buf_num` buffers are ever outstanding. Acquiring from an exhausted pool
//! parks the caller until a buffer is released; waiters are woken in FIFO order and each
//! release wakes exactly one of them. Releasing never blocks: it pushes the allocation
//! back onto the free list and returns the permit.
//!
//! Buffers are allocated lazily, so a short transfer with a large pool only pays for the
//! buffers it actually used. Contents are not cleared between uses - only the slice up
//! to [`Buffer::len`] is meaningful.

use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("buffer pool is closed")]
pub struct PoolClosed;

#[derive(Debug)]
pub struct BufferPool {
    free: parking_lot::Mutex<Vec<Vec<u8>>>,
    slots: Arc<tokio::sync::Semaphore>,
    max_buf_num: usize,
    buf_size: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(max_buf_num: usize, buf_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: parking_lot::Mutex::new(Vec::new()),
            slots: Arc::new(tokio::sync::Semaphore::new(max_buf_num)),
            max_buf_num,
            buf_size,
        })
    }

    /// Waits until fewer than `max_buf_num` buffers are outstanding and hands one out.
    pub async fn acquire(self: &Arc<Self>) -> Result<Buffer, PoolClosed> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;
        let data = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; self.buf_size]);
        Ok(Buffer {
            data,
            len: 0,
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Returns a buffer to the pool; the same as dropping it.
    pub fn release(&self, buffer: Buffer) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&buffer.pool)));
        drop(buffer);
    }

    /// Fails all pending and future acquires. Outstanding buffers can still be released.
    pub fn close(&self) {
        self.slots.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Number of buffers acquired and not yet released.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_buf_num
            .saturating_sub(self.slots.available_permits())
    }

    /// Number of buffers allocated and currently sitting idle.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put_back(&self, data: Vec<u8>) {
        if data.len() == self.buf_size {
            self.free.lock().push(data);
        }
    }
}

/// A pooled buffer owned by exactly one task at a time.
///
/// Dereferences to the valid bytes (`..len`); the full region for reading into is
/// reached through [`Buffer::space_mut`].
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<BufferPool>,
    // released after `data` went back onto the free list, see Drop
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Buffer {
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole buffer, regardless of the current valid length.
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Marks the first `len` bytes as valid; clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len.min(self.data.len());
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.put_back(data);
    }
}

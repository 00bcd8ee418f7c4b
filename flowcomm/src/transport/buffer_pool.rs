use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::error::{CommError, Result};

/// Fixed-capacity byte region carried on the wire. `len` marks how much of
/// the capacity holds data.
pub struct DataBuffer {
    bytes: Box<[u8]>,
    len: usize,
}

impl DataBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// The filled part of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Append as much of `data` as fits; returns the number of bytes taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        self.bytes[self.len..self.len + take].copy_from_slice(&data[..take]);
        self.len += take;
        take
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Lock-free pool of equally sized wire buffers, allocated once.
///
/// A buffer is either free in the pool or owned by exactly one message.
/// Returning more buffers than the pool was filled with is a fatal error.
pub struct BufferPool {
    name: &'static str,
    free: ArrayQueue<DataBuffer>,
    count: usize,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(name: &'static str, count: usize, buffer_size: usize) -> Arc<Self> {
        Self::with_factory(name, count, buffer_size, DataBuffer::new)
    }

    /// Fill the pool with buffers produced by `create`, typically the
    /// channel's own allocator.
    pub fn with_factory(
        name: &'static str,
        count: usize,
        buffer_size: usize,
        mut create: impl FnMut(usize) -> DataBuffer,
    ) -> Arc<Self> {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = free.push(create(buffer_size));
        }
        Arc::new(Self {
            name,
            free,
            count,
            buffer_size,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total buffers owned by the pool, free or in flight.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.count - self.available()
    }

    pub fn acquire(&self) -> Option<DataBuffer> {
        self.free.pop()
    }

    pub fn release(&self, mut buffer: DataBuffer) -> Result<()> {
        buffer.clear();
        self.free
            .push(buffer)
            .map_err(|_| CommError::PoolOverflow { pool: self.name })
    }
}

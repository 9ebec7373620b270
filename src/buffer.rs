//! reusable request buffers.
//!
//! Every in-flight request owns one buffer for the raw message read from
//! /dev/fuse; the buffer goes back to the pool when the request is done.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// A free list of fixed-size byte buffers. Acquire never blocks: when the
/// list is empty a fresh buffer is allocated. Release keeps at most
/// `max_idle` buffers around. Buffers are not zeroed on reuse; callers must
/// treat uninitialized bytes as such.
#[derive(Debug)]
pub(crate) struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            buffer_size,
            max_idle,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0; self.buffer_size]);

        PooledBuffer {
            buffer: Some(buffer),
            pool: self.clone(),
        }
    }

    fn release(&self, buffer: Vec<u8>) {
        if buffer.capacity() < self.buffer_size {
            return;
        }

        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_idle {
            free.push(buffer);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`]; returns itself on drop.
#[derive(Debug)]
pub(crate) struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_deref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_allocates_when_empty() {
        let pool = BufferPool::new(128, 2);

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.len(), 128);
        assert_eq!(b.len(), 128);
    }

    #[test]
    fn release_reuses_buffer() {
        let pool = BufferPool::new(64, 2);

        let mut buffer = pool.acquire();
        buffer[0] = 0xAB;
        drop(buffer);

        // the pooled buffer comes back, contents untouched
        let buffer = pool.acquire();
        assert_eq!(buffer[0], 0xAB);
    }

    #[test]
    fn idle_buffers_are_bounded() {
        let pool = BufferPool::new(16, 1);

        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);

        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }
}

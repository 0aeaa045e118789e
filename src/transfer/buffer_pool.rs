//! Size-classed buffer pooling for copy loops.
//!
//! Four classes cover the whole range of transfer sizes; a buffer is checked
//! out for one copy and returns to its class on drop, so every exit path
//! (including errors mid-stream) releases it.

use bytes::Bytes;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Buffer capacities, smallest class first.
pub const SIZE_CLASSES: [usize; 4] = [8 * 1024, 64 * 1024, 1024 * 1024, 4 * 1024 * 1024];

/// Buffers retained per class when idle.
const POOL_DEPTH: usize = 8;

/// Pool of reusable byte buffers of one capacity.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Arc<Self> {
        let buffers = (0..pool_size)
            .map(|_| vec![0u8; buffer_capacity])
            .collect();
        Arc::new(Self {
            buffers: Mutex::new(buffers),
            buffer_capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Buffers currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// Check out a zero-length buffer with this class's capacity. Returned
    /// to the pool when the guard drops.
    pub fn take(self: &Arc<Self>) -> PooledBuf {
        let mut data = self
            .buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_capacity]);
        data.clear();
        data.resize(self.buffer_capacity, 0);
        PooledBuf {
            data,
            pool: Arc::clone(self),
        }
    }

    /// Wrap a checked-out buffer as `Bytes` that returns it on drop, for
    /// handing to a response body without a copy.
    pub fn wrap(self: &Arc<Self>, buf: Vec<u8>) -> Bytes {
        Bytes::from_owner(PooledVec {
            data: buf,
            pool: Arc::clone(self),
        })
    }

    fn return_buf(&self, mut buf: Vec<u8>) {
        // Drop undersized fallbacks and keep the pool bounded
        if buf.capacity() < self.buffer_capacity {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < POOL_DEPTH {
            buf.clear();
            buffers.push(buf);
        }
    }
}

/// RAII guard over a pooled buffer.
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Detach the buffer for `BufferPool::wrap`; skips the drop-return.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if !self.data.is_empty() || self.data.capacity() > 0 {
            self.pool.return_buf(std::mem::take(&mut self.data));
        }
    }
}

/// Owner type for `Bytes::from_owner`; returns the buffer on drop.
struct PooledVec {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl AsRef<[u8]> for PooledVec {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledVec {
    fn drop(&mut self) {
        self.pool.return_buf(std::mem::take(&mut self.data));
    }
}

/// All four size classes.
#[derive(Clone)]
pub struct BufferPools {
    classes: [Arc<BufferPool>; 4],
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPools {
    pub fn new() -> Self {
        Self {
            classes: SIZE_CLASSES.map(|capacity| BufferPool::new(2, capacity)),
        }
    }

    /// Pick the class for an expected byte count; unknown sizes get 1 MB.
    pub fn for_expected(&self, expected: Option<u64>) -> &Arc<BufferPool> {
        let index = match expected {
            Some(n) if n < 64 * 1024 => 0,
            Some(n) if n < 1024 * 1024 => 1,
            Some(n) if n < 100 * 1024 * 1024 => 2,
            Some(_) => 3,
            None => 2,
        };
        &self.classes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_selection_follows_expected_size() {
        let pools = BufferPools::new();
        assert_eq!(pools.for_expected(Some(1)).capacity(), 8 * 1024);
        assert_eq!(pools.for_expected(Some(64 * 1024)).capacity(), 64 * 1024);
        assert_eq!(pools.for_expected(Some(900 * 1024)).capacity(), 1024 * 1024);
        assert_eq!(
            pools.for_expected(Some(100 * 1024 * 1024)).capacity(),
            4 * 1024 * 1024
        );
        assert_eq!(pools.for_expected(None).capacity(), 1024 * 1024);
    }

    #[test]
    fn buffer_returns_on_drop() {
        let pool = BufferPool::new(1, 64);
        let baseline = pool.idle();

        let buf = pool.take();
        assert_eq!(pool.idle(), baseline - 1);
        drop(buf);
        assert_eq!(pool.idle(), baseline);
    }

    #[test]
    fn buffer_returns_on_error_paths() {
        let pool = BufferPool::new(1, 64);
        let baseline = pool.idle();

        let failing = || -> anyhow::Result<()> {
            let _buf = pool.take();
            anyhow::bail!("mid-copy failure");
        };
        assert!(failing().is_err());

        assert_eq!(pool.idle(), baseline, "pool must refill after a failure");
    }

    #[test]
    fn wrapped_bytes_return_buffer() {
        let pool = BufferPool::new(1, 8);
        let baseline = pool.idle();

        let mut buf = pool.take().into_inner();
        buf.clear();
        buf.extend_from_slice(b"abcd");
        let bytes = pool.wrap(buf);
        assert_eq!(&bytes[..], b"abcd");
        drop(bytes);

        assert_eq!(pool.idle(), baseline);
    }

    #[test]
    fn undersized_buffer_is_not_reclaimed() {
        let pool = BufferPool::new(1, 64);
        let baseline = pool.idle();

        drop(pool.wrap(Vec::with_capacity(2)));
        assert_eq!(pool.idle(), baseline);
    }
}

use std::sync::Mutex;
use tracing::{debug, trace};

/// A bounded free list of fixed-size byte buffers for the send / receive hot path.
///
/// Buffers are plain `Vec<u8>` with a length of exactly `buf_size`. A buffer is only taken back
///  if it still has that length - buffers of any other size are discarded rather than pooled, so
///  a single oversized allocation can not poison the pool.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Returns a buffer of exactly `buf_size` bytes. Its content is unspecified.
    pub fn obtain(&self) -> Vec<u8> {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        vec![0; self.buf_size]
    }

    /// Hands a buffer back. The caller must not touch it afterwards.
    pub fn recycle(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buf_size {
            debug!("discarding buffer of size {} instead of the pool's {} bytes", buffer.len(), self.buf_size);
            return;
        }

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_obtain_from_empty_pool() {
        let pool = BufferPool::new(10, 2);
        let buf = pool.obtain();
        assert_eq!(buf.len(), 10);
        assert_eq!(pool.num_pooled(), 0);
    }

    #[test]
    fn test_recycled_buffer_is_reused() {
        let pool = BufferPool::new(10, 2);
        let mut buf = pool.obtain();
        buf[0] = 42;
        pool.recycle(buf);
        assert_eq!(pool.num_pooled(), 1);

        let buf = pool.obtain();
        assert_eq!(buf[0], 42);
        assert_eq!(pool.num_pooled(), 0);
    }

    #[test]
    fn test_pool_bound() {
        let pool = BufferPool::new(10, 3);
        for _ in 0..10 {
            pool.recycle(vec![0; 10]);
            assert!(pool.num_pooled() <= 3);
        }
        assert_eq!(pool.num_pooled(), 3);
    }

    #[rstest]
    #[case::too_small(9)]
    #[case::too_big(11)]
    #[case::empty(0)]
    fn test_wrong_size_is_discarded(#[case] size: usize) {
        let pool = BufferPool::new(10, 3);
        pool.recycle(vec![7; size]);
        assert_eq!(pool.num_pooled(), 0);

        let buf = pool.obtain();
        assert_eq!(buf.len(), 10);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_truncated_pool_buffer_is_discarded() {
        let pool = BufferPool::new(10, 3);
        let mut buf = pool.obtain();
        buf.truncate(5);
        pool.recycle(buf);
        assert_eq!(pool.num_pooled(), 0);
    }
}

//! Bounded freelist of per-request scratch buffers.

use parking_lot::Mutex;

/// Smallest buffer handed out.
pub const MIN_BUF: usize = 4 * 1024;
/// Buffers grown past this are dropped instead of pooled.
pub const MAX_BUF: usize = 256 * 1024;
/// Capacity buffers are trimmed to before returning to the pool.
pub const TRIM_BUF: usize = 16 * 1024;

/// Reusable byte buffers for head sniffing and body chunking.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        Vec::with_capacity(MIN_BUF)
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_BUF {
            return;
        }
        buf.clear();
        buf.shrink_to(TRIM_BUF);
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(4);
        let buf = pool.get();
        pool.put(buf);
        assert_eq!(pool.pooled(), 1);
        let _ = pool.get();
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_oversize_buffer_dropped() {
        let pool = BufferPool::new(4);
        let buf = Vec::with_capacity(MAX_BUF + 1);
        pool.put(buf);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_returned_buffer_is_trimmed() {
        let pool = BufferPool::new(4);
        let mut buf = pool.get();
        buf.resize(MAX_BUF, 0);
        pool.put(buf);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() <= MAX_BUF);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(2);
        for _ in 0..5 {
            pool.put(Vec::with_capacity(MIN_BUF));
        }
        assert_eq!(pool.pooled(), 2);
    }
}

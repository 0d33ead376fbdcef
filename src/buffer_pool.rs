//! Receive-buffer reuse for the dispatcher loop.
//!
//! The dispatcher handles one datagram at a time but runs forever; recycling
//! a small set of packet-sized buffers keeps the hot loop allocation-free.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Mutex;

use crate::MAX_PACKET_SIZE;

const POOL_SIZE: usize = 32;

// One byte beyond the protocol maximum so an oversized datagram is visible
// to the codec instead of being silently truncated by recv_from.
pub(crate) const RECV_BUFFER_SIZE: usize = MAX_PACKET_SIZE + 1;

#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        let mut pool = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE / 2 {
            pool.push(BytesMut::with_capacity(RECV_BUFFER_SIZE));
        }
        Self {
            pool: Arc::new(Mutex::new(pool)),
        }
    }

    /// Take a cleared buffer from the pool, or allocate when empty.
    pub async fn acquire(&self) -> BytesMut {
        let mut pool = self.pool.lock().await;
        match pool.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => BytesMut::with_capacity(RECV_BUFFER_SIZE),
        }
    }

    /// Return a buffer to the pool; buffers beyond capacity are dropped.
    pub async fn release(&self, mut buffer: BytesMut) {
        let mut pool = self.pool.lock().await;
        if pool.len() < POOL_SIZE {
            buffer.clear();
            pool.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_release_recycles() {
        let pool = BufferPool::new();
        let mut buffer = pool.acquire().await;
        buffer.extend_from_slice(b"dirty");
        pool.release(buffer).await;

        let buffer = pool.acquire().await;
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= RECV_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn acquire_beyond_preallocation_still_works() {
        let pool = BufferPool::new();
        let mut held = Vec::new();
        for _ in 0..POOL_SIZE + 4 {
            held.push(pool.acquire().await);
        }
        for buffer in held {
            pool.release(buffer).await;
        }
    }
}

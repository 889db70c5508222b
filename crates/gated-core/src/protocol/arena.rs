//! Freelist pools for hot-path allocations.
//!
//! Two pools back the forwarding path: scratch buffers for encoding and
//! `Forward` messages themselves. Anything whose body outgrew
//! [`POOL_BODY_LIMIT`] is dropped instead of returned, so a burst of large
//! payloads cannot pin memory.

use std::sync::Mutex;

use bytes::BytesMut;

use crate::protocol::message::Forward;

/// Bodies above this size bypass the pools.
pub const POOL_BODY_LIMIT: usize = 4096;

/// Upper bound on pooled entries per freelist.
const MAX_POOLED: usize = 256;

/// Pool of encode scratch buffers.
#[derive(Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared buffer.
    pub fn get(&self) -> BytesMut {
        match self.free.lock() {
            Ok(mut free) => free.pop().unwrap_or_default(),
            Err(_) => BytesMut::new(),
        }
    }

    /// Return a buffer. Oversized or surplus buffers are dropped.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > POOL_BODY_LIMIT {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_POOLED {
                free.push(buf);
            }
        }
    }
}

/// Pool of `Forward` messages for the client → back-end hot path.
#[derive(Default)]
pub struct ForwardPool {
    free: Mutex<Vec<Forward>>,
}

impl ForwardPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared `Forward`.
    pub fn get(&self) -> Forward {
        match self.free.lock() {
            Ok(mut free) => free.pop().unwrap_or_default(),
            Err(_) => Forward::default(),
        }
    }

    /// Return a `Forward`. Messages that carried a large body are dropped.
    pub fn put(&self, mut m: Forward) {
        if m.content.len() > POOL_BODY_LIMIT {
            return;
        }
        m.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_POOLED {
                free.push(m);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    #[test]
    fn buffer_pool_reuses_and_clears() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf.put_slice(b"scratch");
        pool.put(buf);
        let buf = pool.get();
        assert!(buf.is_empty());
    }

    #[test]
    fn buffer_pool_drops_oversized() {
        let pool = BufferPool::new();
        let mut buf = BytesMut::with_capacity(POOL_BODY_LIMIT * 2);
        buf.put_slice(b"x");
        pool.put(buf);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }

    #[test]
    fn forward_pool_round_trip() {
        let pool = ForwardPool::new();
        let mut f = pool.get();
        f.uid = 42;
        f.typ = 0x200;
        f.content = Bytes::from_static(b"small");
        pool.put(f);

        let f = pool.get();
        assert_eq!(f, Forward::default());
    }

    #[test]
    fn forward_pool_drops_large_bodies() {
        let pool = ForwardPool::new();
        let mut f = pool.get();
        f.content = Bytes::from(vec![0u8; POOL_BODY_LIMIT + 1]);
        pool.put(f);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }
}

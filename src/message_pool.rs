use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::frame::FrameHeaders;
use crate::partition::SendTarget;

struct PoolShared {
    name: &'static str,
    capacity: usize,
    in_use: AtomicUsize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl PoolShared {
    fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        {
            let mut buffers = self.buffers.lock().unwrap();
            if buffers.len() < self.capacity {
                buffers.push(buffer);
            }
        }

        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "this is a bug: {} pool returned more objects than it handed out", self.name);
        trace!("returned message object to {} pool, {} still in use", self.name, previous - 1);
    }
}

/// A fixed-capacity pool of message objects. Running out of objects is a regular condition
///  that callers handle by dropping the message (and signalling the sender), so acquiring never
///  blocks and never allocates beyond the pool's capacity.
#[derive(Clone)]
pub struct MessagePool {
    shared: Arc<PoolShared>,
}

impl MessagePool {
    pub fn new(name: &'static str, capacity: usize) -> MessagePool {
        MessagePool {
            shared: Arc::new(PoolShared {
                name,
                capacity,
                in_use: AtomicUsize::new(0),
                buffers: Mutex::new(Vec::with_capacity(capacity)),
            })
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Acquire)
    }

    /// Returns `None` if all objects are in use
    pub fn acquire(&self, headers: FrameHeaders, sender: SendTarget, payload: &[u8]) -> Option<PooledMessage> {
        let capacity = self.shared.capacity;
        if self.shared.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < capacity).then_some(n + 1)).is_err() {
            debug!("{} pool is exhausted ({} objects in use)", self.shared.name, capacity);
            return None;
        }

        let buffer = self.shared.buffers.lock().unwrap().pop();
        let mut buffer = buffer.unwrap_or_else(|| {
            trace!("no buffer in {} pool: creating new buffer", self.shared.name);
            BytesMut::with_capacity(payload.len())
        });
        buffer.extend_from_slice(payload);

        Some(PooledMessage(Arc::new(PooledMessageInner {
            headers,
            sender,
            payload: buffer,
            pool: self.shared.clone(),
        })))
    }
}

struct PooledMessageInner {
    headers: FrameHeaders,
    sender: SendTarget,
    payload: BytesMut,
    pool: Arc<PoolShared>,
}
impl Drop for PooledMessageInner {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.payload));
    }
}

/// One received frame held in a pool slot. Cloning shares the slot; it goes back to its pool
///  when the last clone is dropped.
#[derive(Clone)]
pub struct PooledMessage(Arc<PooledMessageInner>);

impl PooledMessage {
    pub fn headers(&self) -> &FrameHeaders {
        &self.0.headers
    }

    pub fn sender(&self) -> SendTarget {
        self.0.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.0.payload
    }

    /// Copies the payload out of the pool slot, consuming this reference
    pub fn into_payload(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.payload)
    }
}
impl Debug for PooledMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledMessage{{{:?}, {} bytes from {:?}}}", self.0.headers.header, self.0.payload.len(), self.0.sender)
    }
}

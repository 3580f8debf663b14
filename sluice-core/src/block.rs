//! Receive block.
//!
//! One reusable byte region per connection that response bytes are read
//! into. It starts at the configured size, doubles when a response does not
//! fit, and refuses to grow past the frame size ceiling. Between response
//! cycles it is cleared, not reallocated.

use crate::error::{ConnectionError, Result};
use bytes::buf::Limit;
use bytes::{BufMut, Bytes, BytesMut};

/// Growable, reusable read region.
#[derive(Debug)]
pub struct ReceiveBlock {
    buf: BytesMut,
    /// Current usable size; grows in doubling steps.
    limit: usize,
    initial: usize,
    max_capacity: usize,
}

impl ReceiveBlock {
    /// Create a block of `initial` bytes that may grow to `max_capacity`.
    pub fn new(initial: usize, max_capacity: usize) -> Self {
        let initial = initial.max(1);
        Self {
            buf: BytesMut::with_capacity(initial),
            limit: initial,
            initial,
            max_capacity: max_capacity.max(initial),
        }
    }

    /// Usable size before the next growth step.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Growth ceiling.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Bytes received so far in this cycle.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes received so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing was received in this cycle.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Make room for the next read, doubling the block if it is full.
    ///
    /// Fails with a protocol error once the block is full at its ceiling.
    pub fn reserve_for_read(&mut self) -> Result<()> {
        if self.buf.len() < self.limit {
            return Ok(());
        }
        if self.limit >= self.max_capacity {
            return Err(ConnectionError::Protocol(format!(
                "response exceeds max frame size of {} bytes",
                self.max_capacity
            )));
        }
        self.limit = self.limit.saturating_mul(2).min(self.max_capacity);
        self.buf.reserve(self.limit - self.buf.len());
        Ok(())
    }

    /// Writable tail of the block, bounded by the current size.
    ///
    /// Call [`reserve_for_read`](Self::reserve_for_read) first.
    pub fn spare(&mut self) -> Limit<&mut BytesMut> {
        let room = self.limit.saturating_sub(self.buf.len());
        (&mut self.buf).limit(room)
    }

    /// Copy the first `len` bytes out as a frame.
    ///
    /// The block keeps its bytes until [`reset`](Self::reset).
    pub fn take_frame(&self, len: usize) -> Bytes {
        Bytes::copy_from_slice(&self.buf[..len.min(self.buf.len())])
    }

    /// Clear for the next response cycle, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Free the allocation. The block is usable again at its initial size.
    pub fn release(&mut self) {
        self.buf = BytesMut::new();
        self.limit = self.initial;
    }

    #[cfg(test)]
    fn extend(&mut self, data: &[u8]) {
        self.spare().put_slice(data);
    }
}

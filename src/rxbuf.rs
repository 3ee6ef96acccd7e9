use bytes::{Buf, BytesMut};

/// Accumulates raw transport bytes and slices out whole frames.
///
/// Owns the only copy of the inbound byte stream. A partial frame left
/// behind after draining is covered by the data-expecter timer: on fire the
/// driver calls [`RxBuffer::clear`] and the fragment is considered lost.
pub struct RxBuffer {
    buf: BytesMut,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame body (the `ALL_LEN` prefix is
    /// consumed, not returned). `None` means more bytes are needed.
    pub fn next_frame(&mut self) -> Option<BytesMut> {
        if self.buf.len() < 2 {
            self.release_if_empty();
            return None;
        }
        let all_len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < all_len + 2 {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(all_len))
    }

    /// True when a frame prefix is waiting for the rest of its bytes.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop everything buffered (data-expecter fired, or a new `authorize`
    /// makes any half-received frame meaningless).
    pub fn clear(&mut self) {
        self.buf = BytesMut::new();
    }

    fn release_if_empty(&mut self) {
        if self.buf.is_empty() && self.buf.capacity() > 0 {
            self.buf = BytesMut::new();
        }
    }
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

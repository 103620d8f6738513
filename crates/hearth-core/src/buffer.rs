//! Owned payload buffers with reserved head and tail room.
//!
//! Messages are encoded in place: the header codec prepends into the head
//! reserve and the protection engine appends its tag into the tail reserve,
//! so the payload bytes are written exactly once. Capacity is fixed at
//! construction; running out of reserve is an error, never a reallocation.

use crate::error::Error;
use crate::MSG_HEADER_MAX_SIZE;
use hearth_crypto::TAG_LEN;

/// An owned byte buffer holding one message region `[start, end)` inside a
/// fixed-capacity allocation.
pub struct PayloadBuf {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl PayloadBuf {
    /// Create a buffer with explicit head/tail reserves around `payload`.
    #[must_use]
    pub fn new(head_reserve: usize, payload: &[u8], tail_reserve: usize) -> Self {
        let mut data = vec![0u8; head_reserve + payload.len() + tail_reserve];
        data[head_reserve..head_reserve + payload.len()].copy_from_slice(payload);
        Self {
            data,
            start: head_reserve,
            end: head_reserve + payload.len(),
        }
    }

    /// Create a send buffer with room for the largest header and tag.
    #[must_use]
    pub fn for_message(payload: &[u8]) -> Self {
        Self::new(MSG_HEADER_MAX_SIZE, payload, TAG_LEN)
    }

    /// Wrap received bytes; the region covers the whole allocation.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let end = data.len();
        Self {
            data,
            start: 0,
            end,
        }
    }

    /// The current message region.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Mutable view of the current message region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.end]
    }

    /// Length of the current region.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Unused room before the region.
    #[must_use]
    pub fn head_room(&self) -> usize {
        self.start
    }

    /// Unused room after the region.
    #[must_use]
    pub fn tail_room(&self) -> usize {
        self.data.len() - self.end
    }

    /// Prepend `bytes` immediately before the region.
    ///
    /// # Errors
    ///
    /// [`Error::BufferTooSmall`] when the head reserve cannot hold `bytes`.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.start {
            return Err(Error::BufferTooSmall);
        }
        self.start -= bytes.len();
        self.data[self.start..self.start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Extend the region by `n` zeroed bytes of tail reserve.
    ///
    /// # Errors
    ///
    /// [`Error::BufferTooSmall`] when the tail reserve is short.
    pub fn grow_tail(&mut self, n: usize) -> Result<(), Error> {
        if n > self.tail_room() {
            return Err(Error::BufferTooSmall);
        }
        self.data[self.end..self.end + n].fill(0);
        self.end += n;
        Ok(())
    }

    /// Move the region start forward by `n` bytes (consume a header).
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the region length; callers validate lengths
    /// during decode before consuming.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len());
        self.start += n;
    }

    /// Shrink the region to its first `n` bytes (drop a trailing tag).
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the region length.
    pub fn truncate(&mut self, n: usize) {
        assert!(n <= self.len());
        self.end = self.start + n;
    }
}

impl std::fmt::Debug for PayloadBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadBuf")
            .field("len", &self.len())
            .field("head_room", &self.head_room())
            .field("tail_room", &self.tail_room())
            .finish()
    }
}

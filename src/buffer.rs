//! Growable byte buffer backing the rendered-history and response
//! accumulators. Grows geometrically, never shrinks, and keeps its capacity
//! across `reset` so per-turn scratch does not reallocate.
use crate::error::{EngineError, Result};

/// Allocation floor. Buffers never hold less than this once created.
pub const MIN_BUFFER_CAPACITY: usize = 4096;

/// A length-tracked byte buffer whose backing store stays fully initialized,
/// so external renderers can write into the whole capacity via [`space`]
/// followed by [`set_used`].
///
/// [`space`]: GrowableBuffer::space
/// [`set_used`]: GrowableBuffer::set_used
#[derive(Debug, Default)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    used: usize,
}

impl GrowableBuffer {
    /// Allocate a buffer with at least `min_capacity` bytes (floored to
    /// [`MIN_BUFFER_CAPACITY`]).
    pub fn with_capacity(min_capacity: usize) -> Result<Self> {
        let mut buf = Self::default();
        buf.grow_to(min_capacity.max(MIN_BUFFER_CAPACITY))?;
        Ok(buf)
    }

    /// Ensure the capacity is at least `capacity`. Never shrinks.
    pub fn grow_to(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.data.len() {
            return Ok(());
        }
        self.data
            .try_reserve_exact(capacity - self.data.len())
            .map_err(|e| EngineError::OutOfMemory(format!("buffer of {capacity} bytes: {e}")))?;
        self.data.resize(capacity, 0);
        Ok(())
    }

    /// Append bytes, growing by `used + incoming + floor` when out of room.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.used + bytes.len();
        if end > self.data.len() {
            self.grow_to(end + MIN_BUFFER_CAPACITY)?;
        }
        self.data[self.used..end].copy_from_slice(bytes);
        self.used = end;
        Ok(())
    }

    /// Forget the contents but keep the allocation.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The full capacity as a writable slice, for two-call renderers that
    /// fill the buffer from the start and report the length written.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Commit a length written through [`space`](GrowableBuffer::space).
    /// A length beyond capacity means the writer lied about its size.
    pub fn set_used(&mut self, len: usize) -> Result<()> {
        if len > self.data.len() {
            return Err(EngineError::runtime(format!(
                "writer reported {len} bytes into a {} byte buffer",
                self.data.len()
            )));
        }
        self.used = len;
        Ok(())
    }
}

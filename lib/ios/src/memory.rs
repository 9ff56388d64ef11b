//! Guest memory spans.
//!
//! A message buffer references caller memory through pointer+length pairs.
//! Here the memory is a [`SharedBuffer`] (reference counted, interior
//! mutable) and a pointer+length pair is an [`IoSpan`] into it.

use std::sync::Arc;

use spin::Mutex;

/// Reference-counted byte buffer shared between a caller and a device.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Creates a zero-filled buffer.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Wraps existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the whole buffer out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Copies up to `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.0.lock();
        let start = offset.min(data.len());
        let end = offset.saturating_add(len).min(data.len());
        data[start..end].to_vec()
    }

    /// Writes `bytes` at `offset`, clipped to the buffer. Returns bytes written.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> usize {
        let mut data = self.0.lock();
        if offset >= data.len() {
            return 0;
        }
        let count = bytes.len().min(data.len() - offset);
        data[offset..offset + count].copy_from_slice(&bytes[..count]);
        count
    }

    /// Returns true if both handles refer to the same memory.
    pub fn same_memory(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A pointer+length pair into a [`SharedBuffer`].
#[derive(Debug, Clone)]
pub struct IoSpan {
    buffer: SharedBuffer,
    offset: usize,
    len: usize,
}

impl IoSpan {
    /// Span covering `len` bytes at `offset`.
    pub fn new(buffer: SharedBuffer, offset: usize, len: usize) -> Self {
        Self {
            buffer,
            offset,
            len,
        }
    }

    /// Span covering the whole buffer.
    pub fn whole(buffer: SharedBuffer) -> Self {
        let len = buffer.len();
        Self::new(buffer, 0, len)
    }

    /// Fresh zero-filled buffer wrapped in a span.
    pub fn zeroed(len: usize) -> Self {
        Self::whole(SharedBuffer::new(len))
    }

    /// Backing buffer.
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Offset of the span within its buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the span.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero-length span.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the span contents out.
    pub fn read(&self) -> Vec<u8> {
        self.buffer.read(self.offset, self.len)
    }

    /// Writes into the span, clipped to its length. Returns bytes written.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.len);
        self.buffer.write(self.offset, &bytes[..count])
    }

    /// Span of `len` bytes starting `advance` bytes further into the buffer.
    pub fn sub_span(&self, advance: usize, len: usize) -> IoSpan {
        IoSpan::new(self.buffer.clone(), self.offset + advance, len)
    }
}

use std::sync::Arc;

// Chunks are a view over shared, immutable bytes. A payload that is split
// into blocks or reassembled from them only moves these views around, so the
// underlying bytes are never copied between the layers of a stack.

/// A contiguous piece of a [`Payload`](super::Payload).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub(super) start: usize,
    pub(super) end: usize,
    pub(super) bytes: Arc<Vec<u8>>,
}

impl Chunk {
    /// Returns a new chunk containing the given bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            start: 0,
            end: bytes.len(),
            bytes: Arc::new(bytes),
        }
    }

    /// Returns the visible bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    /// The number of visible bytes in the chunk.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the chunk contains no visible bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A view of `len` bytes starting `offset` bytes into this chunk.
    pub(super) fn narrow(&self, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= self.len());
        Self {
            start: self.start + offset,
            end: self.start + offset + len,
            bytes: self.bytes.clone(),
        }
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice().eq(other.as_slice())
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(vector: Vec<u8>) -> Self {
        Self::new(vector)
    }
}

impl From<&[u8]> for Chunk {
    fn from(slice: &[u8]) -> Self {
        slice.to_vec().into()
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(array: &[u8; N]) -> Self {
        array.as_slice().into()
    }
}

impl From<&str> for Chunk {
    fn from(string: &str) -> Self {
        string.as_bytes().into()
    }
}

impl From<String> for Chunk {
    fn from(string: String) -> Self {
        string.into_bytes().into()
    }
}

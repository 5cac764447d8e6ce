use super::Chunk;
use std::{
    collections::{vec_deque, VecDeque},
    fmt::Display,
    ops::{Bound, RangeBounds},
    slice,
};

/// The body of a CoAP message.
///
/// Blockwise transfer splits payloads into slices and glues received slices
/// back together. Both operations should be cheap, so a payload is a list of
/// shared [`Chunk`]s rather than one owned buffer. Slicing and concatenating
/// never copy bytes.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl Payload {
    /// Creates a payload holding the given bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// # use coap_stack::message::Payload;
    /// let payload = Payload::new(b"Body");
    /// assert_eq!(payload.len(), 4);
    /// ```
    pub fn new(body: impl Into<Chunk>) -> Self {
        let body = body.into();
        let len = body.len();
        let mut chunks = VecDeque::new();
        if len > 0 {
            chunks.push_back(body);
        }
        Self { chunks, len }
    }

    /// Creates an empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds the given payload to the end of this one.
    ///
    /// ```
    /// # use coap_stack::message::Payload;
    /// let mut payload = Payload::new("Hello");
    /// payload.concatenate(Payload::new(" world!"));
    /// assert_eq!(&payload.to_vec(), b"Hello world!");
    /// ```
    pub fn concatenate(&mut self, other: Payload) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Returns a new payload viewing the given range of this one. Any of the
    /// `std::ops` range types may be used.
    ///
    /// ```
    /// # use coap_stack::message::Payload;
    /// let mut payload = Payload::new("Hello, ");
    /// payload.concatenate(Payload::new("world"));
    /// assert_eq!(&payload.slice(5..9).to_vec(), b", wo");
    /// ```
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Self {
        let start = match range.start_bound() {
            Bound::Included(&start) => start,
            Bound::Excluded(&start) => start + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&end) => end + 1,
            Bound::Excluded(&end) => end,
            Bound::Unbounded => self.len,
        };
        assert!(start <= end && end <= self.len, "slice out of bounds");

        let mut chunks = VecDeque::new();
        let mut skip = start;
        let mut keep = end - start;
        for chunk in self.chunks.iter() {
            if keep == 0 {
                break;
            }
            let chunk_len = chunk.len();
            if skip >= chunk_len {
                skip -= chunk_len;
                continue;
            }
            let take = (chunk_len - skip).min(keep);
            chunks.push_back(chunk.narrow(skip, take));
            keep -= take;
            skip = 0;
        }

        Self {
            chunks,
            len: end - start,
        }
    }

    /// The number of bytes in the payload.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an iterator over the bytes of the entire payload.
    pub fn iter(&self) -> PayloadBytes {
        PayloadBytes::new(&self.chunks)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len);
        for chunk in self.chunks.iter() {
            bytes.extend_from_slice(chunk.as_slice());
        }
        bytes
    }

    /// The payload decoded as UTF-8, with invalid sequences replaced.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Payload {}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::new(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::new(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::new(text)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::new(text)
    }
}

/// An iterator over the bytes of a payload.
pub struct PayloadBytes<'a> {
    chunks: vec_deque::Iter<'a, Chunk>,
    current: slice::Iter<'a, u8>,
}

impl<'a> PayloadBytes<'a> {
    fn new(chunks: &'a VecDeque<Chunk>) -> Self {
        Self {
            chunks: chunks.iter(),
            current: [].iter(),
        }
    }
}

impl<'a> Iterator for PayloadBytes<'a> {
    type Item = u8;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(byte) = self.current.next() {
                return Some(*byte);
            }
            self.current = self.chunks.next()?.as_slice().iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_payload() {
        let body = b"body";
        let payload = Payload::new(body);
        assert_eq!(payload.len(), body.len());
        assert_eq!(&payload.to_vec(), body);
    }

    #[test]
    fn slicing() {
        let payload = Payload::new("body");
        let expected = b"dy";
        let sliced = payload.slice(2..);
        assert_eq!(sliced.len(), expected.len());
        assert_eq!(&sliced.to_vec(), expected);
    }

    #[test]
    fn slice_of_slice() {
        let payload = Payload::new(b"Things and stuff");
        let sliced = payload.slice(1..15).slice(1..13);
        assert_eq!(&sliced.to_vec(), b"ings and stu");
    }

    #[test]
    fn slice_across_chunks() {
        let mut payload = Payload::new("abc");
        payload.concatenate(Payload::new("def"));
        payload.concatenate(Payload::new("ghi"));
        assert_eq!(&payload.slice(2..7).to_vec(), b"cdefg");
        assert_eq!(&payload.slice(3..6).to_vec(), b"def");
        assert_eq!(payload.slice(9..).len(), 0);
    }

    #[test]
    fn slice_everything() {
        let payload = Payload::new(b"body");
        assert_eq!(payload.slice(4..).len(), 0);
        assert_eq!(payload.slice(..0).len(), 0);
        assert_eq!(payload.slice(..), payload);
    }

    #[test]
    fn concatenate_empty() {
        let mut payload = Payload::empty();
        payload.concatenate(Payload::new(""));
        payload.concatenate(Payload::new("x"));
        assert_eq!(&payload.to_vec(), b"x");
        assert_eq!(payload.iter().count(), 1);
    }

    #[test]
    fn equality_ignores_chunking() {
        let mut split = Payload::new("Hel");
        split.concatenate(Payload::new("lo"));
        assert_eq!(split, Payload::new("Hello"));
        assert_ne!(split, Payload::new("Hell"));
    }
}

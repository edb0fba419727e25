//! Growable byte buffer
//!
//! Small owned byte container used for package assembly and as the
//! rolling receive buffer of the framing plugins. The invariant is
//! `capacity() >= len()` at all times; growing preserves content.

/// Mutable byte sequence with explicit capacity.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// Create an empty buffer with the given capacity reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Create a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Replace the contents with a copy of `bytes`.
    pub fn store(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    /// Append `bytes`, growing as needed.
    pub fn concat(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn push(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Remove the first `n` bytes, shifting the remainder down.
    ///
    /// Panics if `n > len()`.
    pub fn drain_front(&mut self, n: usize) {
        self.data.drain(..n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_invariant() {
        let mut buf = Buffer::with_capacity(16);
        assert!(buf.capacity() >= buf.len());
        buf.concat(&[0u8; 64]);
        assert_eq!(buf.len(), 64);
        assert!(buf.capacity() >= buf.len());
    }

    #[test]
    fn test_grow_preserves_content() {
        let mut buf = Buffer::from_slice(b"hello");
        buf.concat(&[0x20; 1024]);
        assert_eq!(&buf.as_slice()[..5], b"hello");
    }

    #[test]
    fn test_store_replaces() {
        let mut buf = Buffer::from_slice(b"old contents");
        buf.store(b"new");
        assert_eq!(buf.as_slice(), b"new");
    }

    #[test]
    fn test_drain_front() {
        let mut buf = Buffer::from_slice(b"abcdef");
        buf.drain_front(2);
        assert_eq!(buf.as_slice(), b"cdef");
        buf.drain_front(4);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a = Buffer::from_slice(b"shared");
        let b = a.clone();
        a.concat(b"!");
        assert_eq!(b.as_slice(), b"shared");
        assert_eq!(a.as_slice(), b"shared!");
    }
}

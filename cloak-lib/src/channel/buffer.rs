/// Fixed-capacity byte buffer holding bytes that do not yet form a complete unit.
///
/// INVARIANT: the filled bytes always start at offset 0.
pub(crate) struct CarryBuffer {
    buffer: Box<[u8]>,
    len: usize,
}

impl CarryBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == self.buffer.len()
    }

    pub(crate) fn filled(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub(crate) fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.len]
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.len..]
    }

    // CAUTION: only call this function with the count just written into `spare_mut`.
    pub(crate) fn advance(&mut self, count: usize) {
        self.len = (self.len + count).min(self.buffer.len());
    }

    /// Appends `bytes`, returning `false` without copying anything if they do not fit.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.buffer.len() - self.len {
            return false;
        }
        self.buffer[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Keeps only the last `count` filled bytes, moved to the front.
    pub(crate) fn keep_tail(&mut self, count: usize) {
        let count = count.min(self.len);
        self.buffer.copy_within(self.len - count..self.len, 0);
        self.len = count;
    }

    pub(crate) fn tail(&self, count: usize) -> &[u8] {
        &self.buffer[self.len - count.min(self.len)..self.len]
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    /// The whole buffer, for callers that lay out a unit in place.
    ///
    /// PRECONDITION: the buffer is empty.
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Decrypted plaintext waiting to be handed to the caller.
///
/// INVARIANT: the pending bytes always start at offset 0; consuming a prefix compacts
/// the remainder to the front.
#[derive(Default)]
pub(crate) struct LeftoverBuffer {
    buffer: Vec<u8>,
}

impl LeftoverBuffer {
    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Moves up to `dst.len()` bytes into `dst`.
    pub(crate) fn consume_into(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.buffer.len());
        dst[..count].copy_from_slice(&self.buffer[..count]);
        self.buffer.drain(..count);
        count
    }

    /// Whether a request for `requested` bytes can be answered without transport I/O.
    pub(crate) fn satisfies(&self, requested: usize, allow_partial: bool) -> bool {
        self.buffer.len() >= requested || (allow_partial && !self.buffer.is_empty())
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_carry_keep_tail() {
        let mut carry = CarryBuffer::new(8);
        assert!(carry.append(b"abcdef"));
        carry.keep_tail(2);
        assert_eq!(carry.filled(), b"ef");

        carry.spare_mut()[..3].copy_from_slice(b"ghi");
        carry.advance(3);
        assert_eq!(carry.filled(), b"efghi");
        assert_eq!(carry.tail(3), b"ghi");

        carry.keep_tail(0);
        assert!(carry.is_empty());
    }

    #[test]
    fn test_carry_append_is_bounded() {
        let mut carry = CarryBuffer::new(4);
        assert!(carry.append(b"abc"));
        assert!(!carry.append(b"de"));
        assert_eq!(carry.filled(), b"abc");
        assert!(carry.append(b"d"));
        assert!(carry.is_full());
        assert_eq!(carry.spare_mut().len(), 0);
    }

    #[test]
    fn test_leftover_compacts_after_partial_consume() {
        let mut leftover = LeftoverBuffer::default();
        leftover.append(b"hello world");

        let mut dst = [0u8; 5];
        assert_eq!(leftover.consume_into(&mut dst), 5);
        assert_eq!(&dst, b"hello");
        assert_eq!(leftover.len(), 6);

        let mut dst = [0u8; 16];
        assert_eq!(leftover.consume_into(&mut dst), 6);
        assert_eq!(&dst[..6], b" world");
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_leftover_satisfies() {
        let mut leftover = LeftoverBuffer::default();
        assert!(!leftover.satisfies(1, true));

        leftover.append(b"abc");
        assert!(leftover.satisfies(3, false));
        assert!(!leftover.satisfies(4, false));
        assert!(leftover.satisfies(4, true));
    }
}

use bytes::Bytes;

/// A bitfield recording which pieces are present.
///
/// Bits are numbered from the high bit of the first byte, matching the
/// `bitfield` peer wire message. Spare bits past `piece_count` are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield from wire bytes, padding or truncating to `piece_count`.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield with the given piece indices set.
    pub fn from_indices(piece_count: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bf = Self::new(piece_count);
        for index in indices {
            bf.set(index);
        }
        bf
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets a piece. Out of range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    /// Clears a piece. Out of range indices are ignored.
    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Number of pieces set.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Total number of pieces this bitfield describes.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Iterates over the indices of set pieces in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has(i))
    }

    /// Sets every piece that is set in `other`.
    pub fn union_with(&mut self, other: &Bitfield) {
        for (dst, src) in self.bits.iter_mut().zip(other.bits.iter()) {
            *dst |= *src;
        }
        self.clear_spare_bits();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 && spare < 8 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let mut bf = Bitfield::new(100);
        assert!(!bf.has(0));

        bf.set(0);
        bf.set(99);
        assert!(bf.has(0));
        assert!(bf.has(99));

        bf.clear(0);
        assert!(!bf.has(0));
        assert_eq!(bf.count_ones(), 1);

        bf.set(100);
        assert!(!bf.has(100));
        assert_eq!(bf.count_ones(), 1);
    }

    #[test]
    fn test_from_bytes_clears_spare_bits() {
        let bf = Bitfield::from_bytes(&[0xFF, 0xFF], 10);
        assert_eq!(bf.count_ones(), 10);
        assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);
        assert!(bf.is_complete());
    }

    #[test]
    fn test_full_and_iter_ones() {
        let bf = Bitfield::full(11);
        assert_eq!(bf.iter_ones().count(), 11);

        let sparse = Bitfield::from_indices(20, [3, 7, 19]);
        assert_eq!(sparse.iter_ones().collect::<Vec<_>>(), vec![3, 7, 19]);
    }

    #[test]
    fn test_union() {
        let mut a = Bitfield::from_indices(12, [0, 5]);
        let b = Bitfield::from_indices(12, [5, 11]);
        a.union_with(&b);
        assert_eq!(a.iter_ones().collect::<Vec<_>>(), vec![0, 5, 11]);
    }
}

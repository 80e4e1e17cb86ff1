use bytes::Bytes;
use rand::Rng;

use super::error::PeerError;

/// A packed set of piece indices.
///
/// Piece 0 sits in the most significant bit of byte 0. Bits past the
/// piece count are always zero, and the cardinality is cached so that
/// `count` is O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
    ones: usize,
}

impl Bitfield {
    /// An empty bitfield over `len` pieces.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
            ones: 0,
        }
    }

    /// A bitfield with every piece set.
    pub fn full(len: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xff; len.div_ceil(8)],
            len,
            ones: len,
        };
        bf.zero_spare_bits();
        bf
    }

    /// Decodes the wire form of a bitfield over `len` pieces.
    ///
    /// A payload with fewer than `len` bits is malformed. Nonzero
    /// padding bits are tolerated but cleared.
    pub fn from_wire(payload: Bytes, len: usize) -> Result<Self, PeerError> {
        if payload.len() * 8 < len {
            return Err(PeerError::Decoding(format!(
                "bitfield of {} bits for {} pieces",
                payload.len() * 8,
                len
            )));
        }
        let mut bits = payload.to_vec();
        bits.truncate(len.div_ceil(8));
        let mut bf = Self { bits, len, ones: 0 };
        if bf.zero_spare_bits() {
            tracing::warn!("bitfield with nonzero padding bits");
        }
        bf.ones = bf.bits.iter().map(|b| b.count_ones() as usize).sum();
        Ok(bf)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & Self::mask(index) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.len {
            return;
        }
        let byte = &mut self.bits[index / 8];
        if *byte & Self::mask(index) == 0 {
            *byte |= Self::mask(index);
            self.ones += 1;
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index >= self.len {
            return;
        }
        let byte = &mut self.bits[index / 8];
        if *byte & Self::mask(index) != 0 {
            *byte &= !Self::mask(index);
            self.ones -= 1;
        }
    }

    /// Cached cardinality.
    pub fn count(&self) -> usize {
        self.ones
    }

    pub fn is_complete(&self) -> bool {
        self.ones == self.len
    }

    pub fn is_empty(&self) -> bool {
        self.ones == 0
    }

    /// Number of pieces the set ranges over, not the cardinality.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// The wire form.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    pub fn union(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a | b)
    }

    pub fn intersect(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a & b)
    }

    /// Pieces in `self` but not in `other`.
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a & !b)
    }

    /// Every piece not in `self`.
    pub fn complement(&self) -> Bitfield {
        let mut out = self.combine(self, |a, _| !a);
        out.zero_spare_bits();
        out.ones = self.len - self.ones;
        out
    }

    /// Indices of set pieces, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.has(i))
    }

    /// Uniform sample from `mask \ self`, or `None` if that set is empty.
    pub fn random_missing<R: Rng>(&self, mask: &Bitfield, rng: &mut R) -> Option<usize> {
        debug_assert_eq!(self.len, mask.len);
        let candidates = mask.difference(self);
        if candidates.is_empty() {
            return None;
        }
        let pick = rng.random_range(0..candidates.count());
        let result = candidates.ones().nth(pick);
        result
    }

    /// The piece in `mask \ self` with the smallest swarm count.
    ///
    /// Ties go to the lowest index.
    pub fn rarest(&self, mask: &Bitfield, counts: &[u32]) -> Option<usize> {
        debug_assert_eq!(self.len, mask.len);
        debug_assert_eq!(self.len, counts.len());
        let mut best: Option<usize> = None;
        for i in 0..self.len {
            if !mask.has(i) || self.has(i) {
                continue;
            }
            match best {
                Some(b) if counts[b] <= counts[i] => {}
                _ => best = Some(i),
            }
        }
        best
    }

    fn combine(&self, other: &Bitfield, op: impl Fn(u8, u8) -> u8) -> Bitfield {
        debug_assert_eq!(self.len, other.len);
        let bits: Vec<u8> = self
            .bits
            .iter()
            .zip(&other.bits)
            .map(|(&a, &b)| op(a, b))
            .collect();
        let ones = bits.iter().map(|b| b.count_ones() as usize).sum();
        Bitfield {
            bits,
            len: self.len,
            ones,
        }
    }

    fn mask(index: usize) -> u8 {
        0x80 >> (index % 8)
    }

    // Returns true if any padding bit was set.
    fn zero_spare_bits(&mut self) -> bool {
        let spare = self.bits.len() * 8 - self.len;
        if spare == 0 || self.bits.is_empty() {
            return false;
        }
        let keep = 0xffu8 << spare;
        let last = self.bits.len() - 1;
        let dirty = self.bits[last] & !keep != 0;
        self.bits[last] &= keep;
        dirty
    }
}

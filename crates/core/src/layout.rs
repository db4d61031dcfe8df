//! Chunk/block/segment math and the persisted completion bitmap.
//!
//! Bit order is normative: bit `i` lives in byte `i/8`, bit `i mod 8` counted
//! from the least significant bit — `bitvec`'s `Lsb0` order over a `u8`
//! element matches this exactly, so the in-memory bit vector's raw storage
//! *is* the on-disk trailer representation, no repacking needed.
use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

/// The bitmap granularity. A compile-time constant; must be a power of two
/// no larger than the smallest TTH block size in use.
pub const CHUNK_SIZE: u64 = 128 * 1024;

/// Number of chunks needed to cover `size` bytes.
pub fn chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE)
}

/// Number of whole chunks covered by one TTH leaf of `block_size` bytes.
/// `block_size` is always a whole multiple of `CHUNK_SIZE`.
pub fn chunks_per_block(block_size: u64) -> u64 {
    block_size / CHUNK_SIZE
}

/// Number of bytes needed to pack `n` bits.
pub fn bit_size(n: u64) -> u64 {
    n.div_ceil(8)
}

/// Byte offset of the start of chunk `chunk_index` within the file.
pub fn chunk_offset(chunk_index: u64) -> u64 {
    chunk_index * CHUNK_SIZE
}

/// Length in bytes of `chunk_index`, accounting for a short trailing chunk.
pub fn chunk_len(chunk_index: u64, size: u64) -> u64 {
    let start = chunk_offset(chunk_index);
    (size - start).min(CHUNK_SIZE)
}

/// The completion bitmap: one bit per chunk, persisted verbatim as the
/// incoming file's trailer.
#[derive(Clone, Debug, Default)]
pub struct Bitmap {
    bits: BitVec<u8, Lsb0>,
}

impl Bitmap {
    /// A fresh, all-unset bitmap sized for a file of `size` bytes.
    pub fn zeroed(size: u64) -> Self {
        let n = chunks(size) as usize;
        Self {
            bits: BitVec::repeat(false, n),
        }
    }

    /// Reconstruct from raw trailer bytes (as read from disk), truncated or
    /// zero-extended to exactly `chunk_count` bits.
    pub fn from_raw(raw: &[u8], chunk_count: u64) -> Self {
        let mut bits: BitVec<u8, Lsb0> = BitVec::from_slice(raw);
        bits.resize(chunk_count as usize, false);
        Self { bits }
    }

    pub fn chunk_count(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn get(&self, chunk_index: u64) -> bool {
        self.bits[chunk_index as usize]
    }

    pub fn set(&mut self, chunk_index: u64) {
        self.bits.set(chunk_index as usize, true);
    }

    pub fn clear(&mut self, chunk_index: u64) {
        self.bits.set(chunk_index as usize, false);
    }

    pub fn clear_range(&mut self, from: u64, to_exclusive: u64) {
        for i in from..to_exclusive {
            self.clear(i);
        }
    }

    pub fn count_set(&self) -> u64 {
        self.bits.count_ones() as u64
    }

    /// Raw trailer bytes, byte-identical to what must be written to disk.
    pub fn as_raw_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    /// `have` per the Dl invariant: set-bit count times chunk size, minus the
    /// slack if the final (possibly short) chunk is counted as full.
    pub fn have_bytes(&self, size: u64) -> u64 {
        let full = self.count_set() * CHUNK_SIZE;
        let total_chunks = chunks(size);
        if total_chunks == 0 {
            return 0;
        }
        let last = total_chunks - 1;
        if self.get(last) {
            let slack = total_chunks * CHUNK_SIZE - size;
            full - slack
        } else {
            full
        }
    }

    /// True iff every chunk up to `chunk_count` is set.
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.chunk_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_exact_multiple() {
        assert_eq!(chunks(3 * CHUNK_SIZE), 3);
    }

    #[test]
    fn chunks_short_trailing() {
        assert_eq!(chunks(3 * CHUNK_SIZE + 1), 4);
    }

    #[test]
    fn chunks_per_block_is_ratio() {
        assert_eq!(chunks_per_block(8 * CHUNK_SIZE), 8);
    }

    #[test]
    fn bit_size_rounds_up() {
        assert_eq!(bit_size(1), 1);
        assert_eq!(bit_size(8), 1);
        assert_eq!(bit_size(9), 2);
    }

    #[test]
    fn bit_order_is_lsb_first_within_byte() {
        let mut b = Bitmap::zeroed(8 * CHUNK_SIZE);
        b.set(0);
        assert_eq!(b.as_raw_bytes()[0], 0b0000_0001);
        b.set(1);
        assert_eq!(b.as_raw_bytes()[0], 0b0000_0011);
        b.set(7);
        assert_eq!(b.as_raw_bytes()[0], 0b1000_0011);
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut b = Bitmap::zeroed(10 * CHUNK_SIZE + 1);
        b.set(0);
        b.set(5);
        b.set(9);
        let raw = b.as_raw_bytes().to_vec();
        let reloaded = Bitmap::from_raw(&raw, b.chunk_count());
        assert_eq!(reloaded.as_raw_bytes(), b.as_raw_bytes());
        assert_eq!(reloaded.count_set(), b.count_set());
    }

    #[test]
    fn have_bytes_accounts_for_trailing_slack() {
        let size = 3 * CHUNK_SIZE + 1;
        let mut b = Bitmap::zeroed(size);
        b.set(0);
        b.set(1);
        assert_eq!(b.have_bytes(size), 2 * CHUNK_SIZE);
        b.set(3);
        assert_eq!(b.have_bytes(size), 3 * CHUNK_SIZE + 1);
    }

    #[test]
    fn single_chunk_file() {
        let size = 42u64;
        assert_eq!(chunks(size), 1);
        let mut b = Bitmap::zeroed(size);
        assert!(!b.is_complete());
        b.set(0);
        assert!(b.is_complete());
        assert_eq!(b.have_bytes(size), size);
    }
}

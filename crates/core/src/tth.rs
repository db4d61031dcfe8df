//! TTH (Tiger Tree Hash) identifiers and per-block leaf hashing.
//!
//! The merkle combination of leaves into a root is out of scope here (an
//! external hash-tree database owns that); what this module provides is the
//! 24-byte leaf/root identifier type and a running hasher that finalizes one
//! block's worth of bytes into its leaf digest, per the THEX leaf prefix
//! convention (a single 0x00 byte precedes the block's content).
use crate::id::Id;
use tigerwire_hash::{ITiger, Tiger};

pub const TTH_LEN: usize = 24;
const LEAF_PREFIX: u8 = 0x00;

/// A TTH root or leaf digest, base32-displayable.
pub type Tth = Id<TTH_LEN>;

/// A running hash over the bytes of a single block, finalized into a leaf.
pub struct TthLeafHasher {
    inner: Tiger,
}

impl TthLeafHasher {
    pub fn new() -> Self {
        let mut inner = Tiger::new();
        inner.update(&[LEAF_PREFIX]);
        Self { inner }
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf);
    }

    pub fn finish(self) -> Tth {
        Tth::new(self.inner.finish())
    }
}

impl Default for TthLeafHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_leaf_matches_single_shot() {
        let mut a = TthLeafHasher::new();
        a.update(b"hello ");
        a.update(b"world");
        let mut b = TthLeafHasher::new();
        b.update(b"hello world");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn empty_block_is_stable() {
        let a = TthLeafHasher::new().finish();
        let b = TthLeafHasher::new().finish();
        assert_eq!(a, b);
    }
}

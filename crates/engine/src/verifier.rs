//! Per-block TTH verification and failure recovery.
//!
//! Verification needs the rest of the tree: for a file larger than one
//! block, the per-leaf digests live in an external hash-tree database; for
//! a file no larger than one block, the `Dl`'s own TTH root is the only
//! leaf there is. Either way this module never constructs or stores the
//! tree itself — that stays with the hash-tree database.
use tigerwire_core::layout;
use tigerwire_core::tth::Tth;

use crate::dl::{Dl, DlInner};
use crate::error::DeferredError;

/// The external hash-tree database: looks up a known TTH leaf by its block
/// index within a given root. Implemented by whatever owns the on-disk or
/// in-memory tree; the transfer pipeline only ever reads from it.
pub trait TthSource: Send + Sync {
    fn leaf(&self, tth_root: &Tth, block_index: u64) -> Option<[u8; 24]>;
}

pub enum VerifyOutcome {
    Ok,
    /// No leaf is known yet for this block — treated as "accept, nothing to
    /// check against" rather than a failure; the downstream share indexer
    /// will pick up the discrepancy on its own schedule if this was wrong.
    NoReference,
    Mismatch(DeferredError),
}

/// Compare a just-finalized block's leaf against the reference. Files no
/// larger than one block compare straight against the `Dl`'s TTH root.
pub fn verify_leaf(
    dl: &Dl,
    source: &dyn TthSource,
    block_index: u64,
    leaf: &[u8; 24],
) -> VerifyOutcome {
    let reference = if dl.size <= dl.block_size {
        match &dl.key {
            crate::dl::DlKey::Tth(root) => Some(*root.as_bytes()),
            crate::dl::DlKey::UserList(_) => None,
        }
    } else {
        source.leaf(
            match &dl.key {
                crate::dl::DlKey::Tth(root) => root,
                crate::dl::DlKey::UserList(_) => return VerifyOutcome::NoReference,
            },
            block_index,
        )
    };

    let reference = match reference {
        Some(r) => r,
        None => return VerifyOutcome::NoReference,
    };

    if &reference == leaf {
        return VerifyOutcome::Ok;
    }

    let chunks_per_block = dl.chunks_per_block();
    let chunk_start = block_index * chunks_per_block;
    let chunk_end = chunk_start + chunks_per_block;
    VerifyOutcome::Mismatch(DeferredError::Hash {
        block: block_index,
        chunk_start,
        chunk_end,
    })
}

/// Reset a mismatched block on the owning thread, under the `Dl` lock:
/// rewind `chunk`/`avail`/`allocated` to the block's start, reduce `have`,
/// clear the bitmap bits, and arm a bitmap save.
pub(crate) fn recover_mismatch(
    inner: &mut DlInner,
    dl_size: u64,
    block_size: u64,
    chunks_per_block: u64,
    thread_idx: usize,
) {
    let thread = &mut inner.threads[thread_idx];
    let block_index = (thread.chunk.saturating_sub(1)) / chunks_per_block.max(1);
    let chunk_start = block_index * chunks_per_block;

    let chunks_back = thread.chunk - chunk_start;
    thread.avail += chunks_back;
    thread.allocated += chunks_back;
    thread.chunk = chunk_start;
    thread.len_into_chunk = 0;
    thread.hasher = None;

    let block_start_byte = chunk_start * layout::CHUNK_SIZE;
    let reduced = block_size.min(dl_size.saturating_sub(block_start_byte));
    inner.have = inner.have.saturating_sub(reduced);

    inner.bitmap.clear_range(chunk_start, chunk_start + chunks_per_block);
    inner.save_armed = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dl::{Dl, DlKey, Thread};
    use std::sync::Arc;
    use tigerwire_core::cid::CID_LEN;
    use tigerwire_core::id::Id;

    struct FakeSource(Option<[u8; 24]>);
    impl TthSource for FakeSource {
        fn leaf(&self, _root: &Tth, _block: u64) -> Option<[u8; 24]> {
            self.0
        }
    }

    fn dummy_dl(size: u64, block_size: u64) -> Dl {
        let root: Tth = Id::new([7u8; CID_LEN]);
        let file = Arc::new(tempfile::tempfile().unwrap());
        Dl::new_whole_file(
            DlKey::Tth(root),
            "/tmp/dest".into(),
            "/tmp/inc".into(),
            size,
            block_size,
            false,
            0,
            file,
        )
    }

    #[test]
    fn small_file_verifies_against_root_directly() {
        let root_bytes = [7u8; 24];
        let dl = dummy_dl(100, layout::CHUNK_SIZE);
        let source = FakeSource(None);
        match verify_leaf(&dl, &source, 0, &root_bytes) {
            VerifyOutcome::Ok => {}
            _ => panic!("expected match against dl root"),
        }
    }

    #[test]
    fn mismatch_is_reported_with_block_and_chunk_range() {
        let dl = dummy_dl(8 * layout::CHUNK_SIZE, 8 * layout::CHUNK_SIZE);
        let source = FakeSource(Some([1u8; 24]));
        match verify_leaf(&dl, &source, 0, &[2u8; 24]) {
            VerifyOutcome::Mismatch(DeferredError::Hash {
                block,
                chunk_start,
                chunk_end,
            }) => {
                assert_eq!(block, 0);
                assert_eq!(chunk_start, 0);
                assert_eq!(chunk_end, 8);
            }
            _ => panic!("expected mismatch"),
        }
    }

    #[test]
    fn recover_mismatch_rewinds_thread_and_clears_bitmap() {
        let dl = dummy_dl(32 * layout::CHUNK_SIZE, 8 * layout::CHUNK_SIZE);
        {
            let mut inner = dl.inner.lock();
            inner.threads[0] = Thread {
                chunk: 8,
                len_into_chunk: 0,
                allocated: 0,
                avail: 24,
                busy: true,
                peer: None,
                hasher: None,
                deferred_error: None,
                retired: false,
            };
            for c in 0..8 {
                inner.bitmap.set(c);
            }
            inner.have = 8 * layout::CHUNK_SIZE;
        }
        {
            let mut inner = dl.inner.lock();
            recover_mismatch(&mut inner, dl.size, dl.block_size, dl.chunks_per_block(), 0);
            assert_eq!(inner.threads[0].chunk, 0);
            assert_eq!(inner.threads[0].avail, 32);
            assert_eq!(inner.have, 0);
            assert!(!inner.bitmap.get(0));
            assert!(inner.save_armed);
        }
    }
}

//! The `Dl` and `Thread` data model. A `Dl` is the unit of queued
//! download work; a `Thread` is a contiguous, owned-by-at-most-one-peer
//! range of its undownloaded chunks.
//!
//! Everything that must be observed together — the bitmap, `have`, the
//! thread list, the active-thread count, and the incoming file descriptor —
//! lives behind one lock. The hot-path `pwrite` itself runs outside the
//! lock; only chunk-completion bookkeeping takes it.
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tigerwire_core::cid::Uid;
use tigerwire_core::layout::{self, Bitmap, CHUNK_SIZE};
use tigerwire_core::tth::{Tth, TthLeafHasher};

use crate::error::DlError;

/// What a `Dl` is keyed by — a TTH root for ordinary files, or the owning
/// user for a file-list download (file lists have no content hash).
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub enum DlKey {
    Tth(Tth),
    UserList(Uid),
}

/// A contiguous, currently-allocatable-or-allocated range of undownloaded
/// chunks.
pub struct Thread {
    pub chunk: u64,
    pub len_into_chunk: u64,
    pub allocated: u64,
    pub avail: u64,
    pub busy: bool,
    pub peer: Option<Uid>,
    pub hasher: Option<TthLeafHasher>,
    pub deferred_error: Option<crate::error::DeferredError>,
    /// Set once this thread is fully drained and retired. Retired threads
    /// stay in `DlInner::threads` rather than being removed, because a
    /// `CC` may be holding the index of some *other* thread at the same
    /// time — `Vec::remove` would shift it onto the wrong `Thread`.
    pub retired: bool,
}

impl Thread {
    pub fn whole_file(chunk_count: u64) -> Self {
        Self {
            chunk: 0,
            len_into_chunk: 0,
            allocated: 0,
            avail: chunk_count,
            busy: false,
            peer: None,
            hasher: None,
            deferred_error: None,
            retired: false,
        }
    }

    /// True iff this thread still has an unallocated block that could be
    /// split off for another peer.
    pub fn has_free_block(&self, chunks_per_block: u64, total_chunks: u64) -> bool {
        if self.retired {
            return false;
        }
        let unallocated = self.avail.saturating_sub(self.allocated);
        if unallocated > chunks_per_block {
            return true;
        }
        // The last, possibly short, block is eligible even once `allocated`
        // nominally covers it — it can still be under-requested relative to
        // a full block, so a second peer may join it.
        let covers_last_block = self.chunk + self.avail >= total_chunks;
        covers_last_block && self.allocated < self.avail
    }
}

pub(crate) struct DlInner {
    pub bitmap: Bitmap,
    pub have: u64,
    pub threads: Vec<Thread>,
    pub file: Option<Arc<std::fs::File>>,
    pub save_armed: bool,
    pub error: Option<DlError>,
    pub pending_removal: bool,
}

pub struct Dl {
    pub key: DlKey,
    pub destination: PathBuf,
    pub incoming_path: PathBuf,
    pub size: u64,
    pub block_size: u64,
    pub is_list: bool,
    pub priority: i32,
    pub(crate) inner: Mutex<DlInner>,
}

impl Dl {
    pub fn chunk_count(&self) -> u64 {
        layout::chunks(self.size)
    }

    pub fn chunks_per_block(&self) -> u64 {
        layout::chunks_per_block(self.block_size)
    }

    /// Block index covering `chunk` — `0` unless the file is larger than
    /// one block.
    pub fn block_index_of_chunk(&self, chunk: u64) -> u64 {
        chunk / self.chunks_per_block().max(1)
    }

    pub fn new_whole_file(
        key: DlKey,
        destination: PathBuf,
        incoming_path: PathBuf,
        size: u64,
        block_size: u64,
        is_list: bool,
        priority: i32,
        file: Arc<std::fs::File>,
    ) -> Self {
        let chunk_count = layout::chunks(size);
        let thread = Thread::whole_file(chunk_count);
        Dl {
            key,
            destination,
            incoming_path,
            size,
            block_size,
            is_list,
            priority,
            inner: Mutex::new(DlInner {
                bitmap: Bitmap::zeroed(size),
                have: 0,
                threads: vec![thread],
                file: Some(file),
                save_armed: false,
                error: None,
                pending_removal: false,
            }),
        }
    }

    pub fn have(&self) -> u64 {
        self.inner.lock().have
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        !self.is_list && inner.have == self.size
    }

    pub fn active_thread_count(&self) -> usize {
        self.inner.lock().threads.iter().filter(|t| t.busy).count()
    }

    /// Mark this `Dl` for deferred removal (the user closed it while
    /// transfers were in flight). Returns `true` if no thread is currently
    /// busy — the caller should invoke the queue's remove hook right away;
    /// otherwise the `recv_done` that drains the last active thread will
    /// report `RecvDoneOutcome::ReadyForRemoval` and the caller does it then.
    pub fn mark_pending_removal(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.pending_removal = true;
        !inner.threads.iter().any(|t| t.busy)
    }

    /// Recompute `have` from the bitmap under the lock:
    /// `have == count_set * CHUNK_SIZE - trailing slack`.
    pub(crate) fn recompute_have(inner: &mut DlInner, size: u64) {
        inner.have = inner.bitmap.have_bytes(size);
    }

    pub const CHUNK_SIZE: u64 = CHUNK_SIZE;
}

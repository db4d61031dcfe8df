//! The downloader/queue's interface to the core: the queue that decides
//! *which* `Dl` a newly idle peer should work on is an external
//! collaborator; the `CC` state machine only asks for one and reports
//! back what happened.
use std::sync::Arc;

use tigerwire_core::cid::Uid;

use crate::dl::{Dl, DlKey};

/// What the queue decided to hand a newly-`Idle`, download-capable `CC`.
pub enum NextWork {
    /// Download from this `Dl`; caller estimates this peer's throughput in
    /// bytes/sec (0 if unknown) to feed the allocator's segment sizing.
    Download {
        dl: Arc<Dl>,
        estimated_throughput: u64,
    },
    /// Nothing queued for this peer right now; the `CC` stays `Idle`.
    Nothing,
}

/// Stands in for the download queue: whatever owns the set of active
/// `Dl`s and their per-user mirror lists implements this.
pub trait DownloadDriver: Send + Sync {
    fn next_work(&self, peer: Uid) -> NextWork;

    /// True if this peer has an explicitly user-granted upload slot.
    fn has_granted_slot(&self, peer: Uid) -> bool {
        let _ = peer;
        false
    }

    /// True if this peer is a hub operator, exempting it from the
    /// mini-slot cap.
    fn is_operator(&self, peer: Uid) -> bool {
        let _ = peer;
        false
    }

    /// Tag `(peer, tth)` as unreliable after a `NoFile`/`NoPart` status so
    /// the queue stops selecting this peer for this file.
    fn mark_no_file(&self, peer: Uid, tth: tigerwire_core::tth::Tth) {
        let _ = (peer, tth);
    }

    /// A GET finished or the peer dropped mid-transfer; release the thread
    /// back to the allocator's idle pool (already done by the caller) and
    /// let the queue know this peer is free again.
    fn peer_idle(&self, peer: Uid) {
        let _ = peer;
    }

    /// The last active thread of a `Dl` closed via `Dl::mark_pending_removal`
    /// has exited; the queue should drop its own bookkeeping for `key` now.
    /// Called exactly once per closed `Dl`.
    fn dl_removed(&self, key: DlKey) {
        let _ = key;
    }
}

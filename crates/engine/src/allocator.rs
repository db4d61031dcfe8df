//! Thread/segment allocator. Operates entirely under the owning `Dl`'s
//! lock; callers pass in an estimated peer throughput and get back the
//! index of the thread now owned (`busy = true`) by that peer.
use tigerwire_core::cid::Uid;

use crate::dl::{Dl, Thread};

/// One GET's worth of work handed to a `CC`: which thread, and how many
/// chunks it covers starting at `thread.chunk` at the moment of allocation.
pub struct Allocation {
    pub thread_idx: usize,
    pub chunk: u64,
    pub allocated: u64,
}

/// Five minutes, the target segment duration used to size `allocated` from
/// estimated peer throughput.
const SEGMENT_TARGET_SECS: u64 = 300;

fn has_free_block(t: &Thread, chunks_per_block: u64, total_chunks: u64) -> bool {
    t.has_free_block(chunks_per_block, total_chunks)
}

/// Assign a thread to a peer who is ready to download from `dl`. Returns
/// `None` if every thread is busy and none has a splittable free block.
pub fn allocate(
    dl: &Dl,
    peer: Uid,
    peer_throughput_bytes_per_sec: u64,
    min_segment_bytes: u64,
) -> Option<Allocation> {
    let total_chunks = dl.chunk_count();
    let chunks_per_block = dl.chunks_per_block();
    let mut inner = dl.inner.lock();

    if dl.is_list {
        let t = inner.threads.get_mut(0)?;
        t.chunk = 0;
        t.len_into_chunk = 0;
        t.busy = true;
        t.peer = Some(peer);
        return Some(Allocation {
            thread_idx: 0,
            chunk: 0,
            allocated: 1,
        });
    }

    // Select `t`: the non-busy, non-retired thread with the largest `avail`.
    let t_idx = inner
        .threads
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.busy && !t.retired)
        .max_by_key(|(_, t)| t.avail)
        .map(|(i, _)| i);

    let t_idx = match t_idx {
        Some(i) => i,
        None => {
            // Select `tsec`: the thread with the largest `avail - allocated`
            // that still has a free block, then split it.
            let tsec_idx = inner
                .threads
                .iter()
                .enumerate()
                .filter(|(_, t)| has_free_block(t, chunks_per_block, total_chunks))
                .max_by_key(|(_, t)| t.avail.saturating_sub(t.allocated))
                .map(|(i, _)| i)?;
            split_thread(&mut inner.threads, tsec_idx, chunks_per_block, total_chunks)
        }
    };

    let avail = inner.threads[t_idx].avail;
    let allocated = if min_segment_bytes > 0 {
        let by_rate = 1 + (peer_throughput_bytes_per_sec * SEGMENT_TARGET_SECS)
            / tigerwire_core::layout::CHUNK_SIZE;
        let by_min = min_segment_bytes.div_ceil(tigerwire_core::layout::CHUNK_SIZE).max(1);
        avail.min(by_min.max(by_rate))
    } else {
        avail
    };

    let t = &mut inner.threads[t_idx];
    t.allocated = allocated;
    t.busy = true;
    t.peer = Some(peer);

    Some(Allocation {
        thread_idx: t_idx,
        chunk: t.chunk,
        allocated,
    })
}

/// Split `tsec` at a block-aligned point, inserting the new thread and
/// returning its index. The split point is the midpoint of the
/// unallocated tail, rounded down to a block boundary; if that would fall
/// inside the allocated region (only possible in the file's last block)
/// advance by one block, matching the edge case in `Thread::has_free_block`.
fn split_thread(
    threads: &mut Vec<Thread>,
    tsec_idx: usize,
    chunks_per_block: u64,
    total_chunks: u64,
) -> usize {
    let (new_chunk, new_avail) = {
        let tsec = &threads[tsec_idx];
        let unallocated_start = tsec.chunk + tsec.allocated;
        let unallocated_len = tsec.avail - tsec.allocated;
        let midpoint = unallocated_start + unallocated_len / 2;
        let mut split = (midpoint / chunks_per_block.max(1)) * chunks_per_block.max(1);
        if split < unallocated_start {
            split = unallocated_start + chunks_per_block.max(1);
        }
        let split = split.min(tsec.chunk + tsec.avail);
        let new_avail = (tsec.chunk + tsec.avail).saturating_sub(split);
        (split, new_avail)
    };

    {
        let tsec = &mut threads[tsec_idx];
        tsec.avail -= new_avail;
    }

    let _ = total_chunks;
    threads.push(Thread {
        chunk: new_chunk,
        len_into_chunk: 0,
        allocated: 0,
        avail: new_avail,
        busy: false,
        peer: None,
        hasher: None,
        deferred_error: None,
        retired: false,
    });
    threads.len() - 1
}

/// What the caller of `recv_done` should do next.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecvDoneOutcome {
    /// Nothing further to do; other threads are still active or work
    /// remains.
    Continue,
    /// Every thread is retired and no error is pending: move the finished
    /// file into place.
    ReadyToFinish,
    /// The `Dl` was marked closed (`Dl::mark_pending_removal`) and the
    /// thread that just finished was the last one active: notify the
    /// queue so it can drop its own bookkeeping exactly once.
    ReadyForRemoval,
}

/// After a GET finishes or fails: clear `busy`; if non-list and fully
/// drained, retire the thread in place (its slot stays in `threads` so
/// other threads' indices stay valid).
pub fn recv_done(dl: &Dl, thread_idx: usize) -> RecvDoneOutcome {
    let mut inner = dl.inner.lock();
    let retire = !dl.is_list && inner.threads[thread_idx].avail == 0;
    let t = &mut inner.threads[thread_idx];
    t.busy = false;
    t.peer = None;
    t.allocated = 0;
    if retire {
        t.retired = true;
    }

    let no_active = !inner.threads.iter().any(|t| t.busy);
    if inner.pending_removal {
        return if no_active {
            RecvDoneOutcome::ReadyForRemoval
        } else {
            RecvDoneOutcome::Continue
        };
    }
    if no_active && inner.threads.iter().all(|t| t.retired) && inner.error.is_none() {
        RecvDoneOutcome::ReadyToFinish
    } else {
        RecvDoneOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dl::{Dl, DlKey};
    use std::sync::Arc;
    use tigerwire_core::cid::CID_LEN;
    use tigerwire_core::id::Id;
    use tigerwire_core::layout::CHUNK_SIZE;

    fn dl_with_size(size_chunks: u64, block_chunks: u64) -> Dl {
        let root: Tth = Id::new([1u8; CID_LEN]);
        let file = Arc::new(tempfile::tempfile().unwrap());
        Dl::new_whole_file(
            DlKey::Tth(root),
            "/tmp/dest".into(),
            "/tmp/inc".into(),
            size_chunks * CHUNK_SIZE,
            block_chunks * CHUNK_SIZE,
            false,
            0,
            file,
        )
    }

    use tigerwire_core::tth::Tth;

    #[test]
    fn single_peer_whole_file_gets_everything() {
        let dl = dl_with_size(3, 1);
        let alloc = allocate(&dl, Uid(1), 1_000_000, 0).unwrap();
        assert_eq!(alloc.chunk, 0);
        assert_eq!(alloc.allocated, 3);
    }

    #[test]
    fn two_peer_split_creates_disjoint_threads() {
        // size = 10 MiB, chunk = 128 KiB -> 80 chunks; block = 1 MiB -> 8 chunks/block.
        let dl = dl_with_size(80, 8);
        let a = allocate(&dl, Uid(1), 1_000_000, 0).unwrap();
        assert_eq!(a.allocated, 80);

        // Peer A completed 10 chunks worth of its allocation, so the
        // unallocated tail starts at chunk 10 (simulate via direct mutation,
        // as a real download would do through `dlfile::recv`).
        {
            let mut inner = dl.inner.lock();
            let t = &mut inner.threads[a.thread_idx];
            t.allocated = 10; // pretend 10 of the 80 chunks remain "reserved", 70 free
            t.avail = 80;
        }

        let b = allocate(&dl, Uid(2), 1_000_000, 0).unwrap();
        {
            let inner = dl.inner.lock();
            let ta = &inner.threads[a.thread_idx];
            let tb = &inner.threads[b.thread_idx];
            assert!(tb.chunk >= 40);
            assert_eq!(ta.chunk + ta.avail, tb.chunk);
        }
    }

    #[test]
    fn recv_done_retires_exhausted_thread() {
        let dl = dl_with_size(1, 1);
        let a = allocate(&dl, Uid(1), 1, 0).unwrap();
        {
            let mut inner = dl.inner.lock();
            inner.threads[a.thread_idx].avail = 0;
        }
        let outcome = recv_done(&dl, a.thread_idx);
        assert_eq!(outcome, RecvDoneOutcome::ReadyToFinish);
        // Retired in place, not removed, so another CC's thread_idx into
        // this Vec stays valid.
        assert!(dl.inner.lock().threads[a.thread_idx].retired);
    }

    #[test]
    fn recv_done_retire_does_not_shift_other_thread_indices() {
        let dl = dl_with_size(80, 8);
        let a = allocate(&dl, Uid(1), 1_000_000, 0).unwrap();
        {
            let mut inner = dl.inner.lock();
            let t = &mut inner.threads[a.thread_idx];
            t.allocated = 10;
            t.avail = 80;
        }
        let b = allocate(&dl, Uid(2), 1_000_000, 0).unwrap();
        assert_ne!(a.thread_idx, b.thread_idx);
        {
            let mut inner = dl.inner.lock();
            inner.threads[a.thread_idx].avail = 0;
        }
        recv_done(&dl, a.thread_idx);
        // b's index must still refer to b's thread after a retires.
        let inner = dl.inner.lock();
        assert_eq!(inner.threads[b.thread_idx].chunk, b.chunk);
        assert!(inner.threads[a.thread_idx].retired);
    }

    #[test]
    fn recv_done_resets_non_exhausted_thread_to_idle() {
        let dl = dl_with_size(4, 1);
        let a = allocate(&dl, Uid(1), 1, 0).unwrap();
        {
            let mut inner = dl.inner.lock();
            inner.threads[a.thread_idx].avail = 2;
        }
        let outcome = recv_done(&dl, a.thread_idx);
        assert_eq!(outcome, RecvDoneOutcome::Continue);
        let inner = dl.inner.lock();
        assert!(!inner.threads[0].busy);
        assert_eq!(inner.threads[0].allocated, 0);
    }

    #[test]
    fn recv_done_reports_ready_for_removal_once_closed_and_drained() {
        let dl = dl_with_size(4, 1);
        let a = allocate(&dl, Uid(1), 1, 0).unwrap();
        let ready_now = dl.mark_pending_removal();
        assert!(!ready_now, "a thread is still busy");
        let outcome = recv_done(&dl, a.thread_idx);
        assert_eq!(outcome, RecvDoneOutcome::ReadyForRemoval);
    }

    #[test]
    fn mark_pending_removal_reports_ready_immediately_when_idle() {
        let dl = dl_with_size(4, 1);
        assert!(dl.mark_pending_removal());
    }
}

//! The incoming-file store: create/resume a sparse file with a bitmap
//! trailer, the `recv` write path, deferred bitmap saving, startup
//! reconstruction, and the finish/move-to-destination step.
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use tigerwire_core::layout::{self, Bitmap, CHUNK_SIZE};
use tigerwire_core::tth::TthLeafHasher;

use crate::dl::{Dl, DlKey, Thread};
use crate::error::{DeferredError, DlError};
use crate::verifier::{self, TthSource, VerifyOutcome};

/// How long after the first dirty event the bitmap trailer is flushed.
pub const BITMAP_SAVE_COALESCE: Duration = Duration::from_secs(5);

#[cfg(unix)]
fn pwrite(file: &std::fs::File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &std::fs::File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(unix)]
fn pread(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

fn pwrite_all(file: &std::fs::File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = pwrite(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short pwrite"));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

fn pread_exact(file: &std::fs::File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = pread(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short pread"));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

/// Open (or create) the incoming file, write a zeroed bitmap trailer, and
/// build a `Dl` with a single whole-file thread.
pub fn create(
    key: DlKey,
    destination: PathBuf,
    incoming_path: PathBuf,
    size: u64,
    block_size: u64,
    is_list: bool,
    priority: i32,
) -> Result<Dl, DlError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&incoming_path)?;
    file.set_len(size)?;
    if !is_list {
        let bitmap = Bitmap::zeroed(size);
        pwrite_all(&file, size, bitmap.as_raw_bytes())?;
    }
    Ok(Dl::new_whole_file(
        key,
        destination,
        incoming_path,
        size,
        block_size,
        is_list,
        priority,
        Arc::new(file),
    ))
}

pub struct RecvOutcome {
    pub bytes_written: usize,
    pub block_error: Option<DeferredError>,
    pub save_armed: bool,
}

/// The write path. `thread_idx` must be a thread this
/// caller currently owns (`busy == true`). Safe to call from a worker
/// thread via `spawn_blocking`; the pwrite itself runs without holding the
/// `Dl` lock, only the per-chunk bookkeeping does.
pub fn recv(
    dl: &Dl,
    thread_idx: usize,
    mut data: &[u8],
    source: &dyn TthSource,
) -> Result<RecvOutcome, DlError> {
    let total_len = data.len();
    let (file, mut chunk, mut len_into_chunk, mut hasher) = {
        let mut inner = dl.inner.lock();
        let file = inner.file.clone().expect("recv on a Dl with no open file");
        let t = &mut inner.threads[thread_idx];
        let hasher = t.hasher.take();
        (file, t.chunk, t.len_into_chunk, hasher)
    };

    let mut offset = chunk * CHUNK_SIZE + len_into_chunk;
    pwrite_all(&file, offset, data)?;

    let mut block_error = None;
    let mut save_armed = false;
    let chunks_per_block = dl.chunks_per_block();
    let total_chunks = dl.chunk_count();

    while !data.is_empty() {
        let remaining_in_chunk = CHUNK_SIZE - len_into_chunk;
        let inchunk = (data.len() as u64).min(remaining_in_chunk) as usize;
        let slice = &data[..inchunk];

        let h = hasher.get_or_insert_with(TthLeafHasher::new);
        h.update(slice);

        len_into_chunk += inchunk as u64;
        offset += inchunk as u64;
        data = &data[inchunk..];

        let at_chunk_boundary = len_into_chunk == CHUNK_SIZE;
        let at_file_end = chunk * CHUNK_SIZE + len_into_chunk == dl.size;

        if at_chunk_boundary || at_file_end {
            let finished_chunk = chunk;
            chunk += 1;
            len_into_chunk = 0;

            let at_block_boundary = dl.is_list
                || chunk % chunks_per_block.max(1) == 0
                || chunk == total_chunks;

            let finalized_leaf = if at_block_boundary && !dl.is_list {
                hasher.take().map(|h| h.finish())
            } else {
                None
            };

            let mut inner = dl.inner.lock();
            inner.bitmap.set(finished_chunk);
            inner.save_armed = true;
            save_armed = true;
            let have = inner.bitmap.have_bytes(dl.size);
            inner.have = have;

            let t = &mut inner.threads[thread_idx];
            t.chunk = chunk;
            t.len_into_chunk = 0;
            t.allocated = t.allocated.saturating_sub(1);
            t.avail = t.avail.saturating_sub(1);

            if let Some(leaf) = finalized_leaf {
                let block_index = dl.block_index_of_chunk(finished_chunk);
                match verifier::verify_leaf(dl, source, block_index, leaf.as_bytes()) {
                    VerifyOutcome::Ok | VerifyOutcome::NoReference => {}
                    VerifyOutcome::Mismatch(err) => {
                        verifier::recover_mismatch(
                            &mut inner,
                            dl.size,
                            dl.block_size,
                            chunks_per_block,
                            thread_idx,
                        );
                        inner.threads[thread_idx].deferred_error = Some(err.clone());
                        block_error = Some(err);
                        // Reload local state: the mismatch rewound the thread.
                        chunk = inner.threads[thread_idx].chunk;
                        len_into_chunk = inner.threads[thread_idx].len_into_chunk;
                    }
                }
            }
        }
    }

    {
        let mut inner = dl.inner.lock();
        let t = &mut inner.threads[thread_idx];
        t.hasher = hasher;
    }

    let _ = offset;
    Ok(RecvOutcome {
        bytes_written: total_len,
        block_error,
        save_armed,
    })
}

/// Flush the in-memory bitmap to the trailer. Idempotent; safe to call
/// concurrently with `recv` writing content bytes, since it never seeks a
/// shared cursor.
pub fn save_bitmap(dl: &Dl) -> Result<(), DlError> {
    let (file, raw, close_after) = {
        let mut inner = dl.inner.lock();
        inner.save_armed = false;
        let file = match &inner.file {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        let raw = inner.bitmap.as_raw_bytes().to_vec();
        let no_active = inner.threads.iter().all(|t| !t.busy);
        (file, raw, no_active)
    };
    if let Err(e) = pwrite_all(&file, dl.size, &raw) {
        dl.inner.lock().error = Some(DlError::Io(io::Error::new(e.kind(), e.to_string())));
        return Err(DlError::Io(e));
    }
    if close_after {
        dl.inner.lock().file = None;
    }
    Ok(())
}

/// Arm the coalescing save timer if it isn't already armed. The caller is
/// expected to hold an `Arc<Dl>`; this spawns a one-shot task that fires
/// after `BITMAP_SAVE_COALESCE`.
pub fn arm_save(dl: Arc<Dl>) {
    let already_armed = {
        let inner = dl.inner.lock();
        inner.save_armed
    };
    if already_armed {
        return;
    }
    dl.inner.lock().save_armed = true;
    tokio::spawn(async move {
        tokio::time::sleep(BITMAP_SAVE_COALESCE).await;
        let dl = dl.clone();
        let res = tokio::task::spawn_blocking(move || save_bitmap(&dl)).await;
        if let Ok(Err(e)) = res {
            warn!(error = %e, "bitmap save failed");
        }
    });
}

/// Startup reconstruction.
pub fn load(
    key: DlKey,
    destination: PathBuf,
    incoming_path: PathBuf,
    size: u64,
    block_size: u64,
    known_tthl: bool,
    priority: i32,
    legacy_confirmed: bool,
) -> Result<Option<Dl>, DlError> {
    let file = match OpenOptions::new().read(true).write(true).open(&incoming_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DlError::Io(e)),
    };

    if !known_tthl {
        drop(file);
        std::fs::remove_file(&incoming_path)?;
        return Err(DlError::NoTthlForResume);
    }

    let chunk_count = layout::chunks(size);
    let trailer_len = layout::bit_size(chunk_count);
    let mut raw = vec![0u8; trailer_len as usize];
    let bitmap = match pread_exact(&file, size, &mut raw) {
        Ok(()) => Bitmap::from_raw(&raw, chunk_count),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            if !legacy_confirmed {
                return Err(DlError::LegacyResumeNeedsConfirmation);
            }
            // Legacy pre-segmented-download file: every full chunk within
            // the existing length is marked complete.
            let mut b = Bitmap::zeroed(size);
            for c in 0..chunk_count {
                b.set(c);
            }
            b
        }
        Err(e) => return Err(DlError::Io(e)),
    };

    let chunks_per_block = layout::chunks_per_block(block_size).max(1);
    let mut threads = Vec::new();
    let mut dirty = false;
    let mut block_start = 0u64;
    while block_start < chunk_count {
        let block_end = (block_start + chunks_per_block).min(chunk_count);
        let all_set = (block_start..block_end).all(|c| bitmap.get(c));
        if !all_set {
            let mut hasher = TthLeafHasher::new();
            let mut first_unset = None;
            for c in block_start..block_end {
                if bitmap.get(c) {
                    if first_unset.is_some() {
                        // A set bit after an unset one inside this block
                        // cannot be trusted to resume mid-block; it must be
                        // re-downloaded.
                        continue;
                    }
                    let mut buf = vec![0u8; layout::chunk_len(c, size) as usize];
                    pread_exact(&file, layout::chunk_offset(c), &mut buf)?;
                    hasher.update(&buf);
                } else if first_unset.is_none() {
                    first_unset = Some(c);
                }
            }
            let resume_chunk = first_unset.unwrap_or(block_start);
            // Clear any bits at/after resume_chunk that had been (wrongly)
            // left set, marking the bitmap dirty.
            for c in resume_chunk..block_end {
                if bitmap.get(c) {
                    dirty = true;
                }
            }
            let mut bitmap = bitmap.clone();
            for c in resume_chunk..block_end {
                bitmap.clear(c);
            }
            threads.push((
                Thread {
                    chunk: resume_chunk,
                    len_into_chunk: 0,
                    allocated: 0,
                    avail: chunk_count - resume_chunk,
                    busy: false,
                    peer: None,
                    hasher: Some(hasher),
                    deferred_error: None,
                    retired: false,
                },
                bitmap,
            ));
            break; // one open thread covers the remainder; later blocks are unset too.
        }
        block_start = block_end;
    }

    let final_bitmap = threads
        .first()
        .map(|(_, b)| b.clone())
        .unwrap_or(bitmap);
    let threads: Vec<Thread> = threads.into_iter().map(|(t, _)| t).collect();

    let have = final_bitmap.have_bytes(size);
    let file = Arc::new(file);
    let dl = Dl::new_whole_file(
        key,
        destination,
        incoming_path,
        size,
        block_size,
        false,
        priority,
        file,
    );
    {
        let mut inner = dl.inner.lock();
        inner.bitmap = final_bitmap;
        inner.have = have;
        if !threads.is_empty() {
            inner.threads = threads;
        } else if have == size {
            inner.threads.clear();
        }
        inner.save_armed = dirty;
    }
    Ok(Some(dl))
}

/// Truncate off the trailer, close the file, and move it to its
/// destination, appending `.N` on collision.
pub fn finish(dl: &Dl) -> Result<PathBuf, DlError> {
    let file = {
        let mut inner = dl.inner.lock();
        inner.file.take()
    };
    if let Some(file) = file {
        file.set_len(dl.size)?;
    }
    drop(file);

    if let Some(parent) = dl.destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut dest = dl.destination.clone();
    if !dl.is_list {
        let mut n = 1u32;
        while dest.exists() {
            dest = append_suffix(&dl.destination, n);
            n += 1;
        }
    }
    std::fs::rename(&dl.incoming_path, &dest)?;
    debug!(from = ?dl.incoming_path, to = ?dest, "finished download, moved into place");
    Ok(dest)
}

fn append_suffix(path: &Path, n: u32) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{n}"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigerwire_core::cid::CID_LEN;
    use tigerwire_core::id::Id;
    use tigerwire_core::tth::Tth;

    struct NoRefSource;
    impl TthSource for NoRefSource {
        fn leaf(&self, _root: &Tth, _block: u64) -> Option<[u8; 24]> {
            None
        }
    }

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tigerwire-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn single_peer_whole_file_reaches_full_have() {
        let inc = tmp_path("whole.part");
        let dest = tmp_path("whole.dat");
        let _ = std::fs::remove_file(&inc);
        let _ = std::fs::remove_file(&dest);
        let size = 3 * CHUNK_SIZE;
        let key = DlKey::Tth(Id::new([9u8; CID_LEN]));
        let dl = create(key, dest.clone(), inc.clone(), size, CHUNK_SIZE, false, 0).unwrap();

        let data = vec![0xABu8; size as usize];
        let source = NoRefSource;
        let outcome = recv(&dl, 0, &data, &source).unwrap();
        assert_eq!(outcome.bytes_written, size as usize);
        assert!(outcome.block_error.is_none());
        assert_eq!(dl.have(), size);
        assert!(dl.is_complete());

        finish(&dl).unwrap();
        assert!(dest.exists());
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), size);
        std::fs::remove_file(&dest).ok();
    }

    #[test]
    fn short_trailing_chunk_is_tracked_correctly() {
        let inc = tmp_path("short.part");
        let dest = tmp_path("short.dat");
        let _ = std::fs::remove_file(&inc);
        let _ = std::fs::remove_file(&dest);
        let size = 2 * CHUNK_SIZE + 42;
        let key = DlKey::Tth(Id::new([3u8; CID_LEN]));
        let dl = create(key, dest, inc, size, CHUNK_SIZE, false, 0).unwrap();
        let data = vec![0x11u8; size as usize];
        let source = NoRefSource;
        recv(&dl, 0, &data, &source).unwrap();
        assert_eq!(dl.have(), size);
        assert!(dl.is_complete());
    }
}

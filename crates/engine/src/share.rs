//! The share-indexer / file-list collaborator's interface to the core.
//! The transfer pipeline never builds or walks the share itself; it only
//! resolves a virtual path or TTH to bytes it can stream, and enumerates
//! the local TTH set for the bloom responder.
use std::io;
use std::sync::Arc;

use tigerwire_core::tth::Tth;

/// A resolved share entry: enough to admit the request (the slot table
/// keys off `size`) and to open a byte source for it.
#[derive(Clone, Debug)]
pub struct ShareEntry {
    pub tth: Tth,
    pub size: u64,
}

/// Something the uploader half of the `CC` state machine can stream
/// `file`-type bytes out of, positionally (no shared cursor, matching the
/// `pread`/`pwrite` discipline used on the download side).
pub trait ShareReader: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Stands in for the share-indexer. The uploader half of `CC::run` and
/// the bloom responder are generic over this.
pub trait ShareIndex: Send + Sync {
    /// Resolve a `/`-rooted virtual path to a concrete share entry.
    fn resolve_path(&self, virtual_path: &str) -> Option<ShareEntry>;

    /// Resolve a `TTH/<base32>` addressed file.
    fn resolve_tth(&self, tth: &Tth) -> Option<ShareEntry>;

    /// Open a positional reader over a resolved entry's file bytes.
    fn open(&self, entry: &ShareEntry) -> io::Result<Box<dyn ShareReader>>;

    /// The compressed file list served for `files.xml.bz2` / `list /` GETs.
    fn file_list_bytes(&self) -> Arc<[u8]>;

    /// TTHL leaves serialized for a `tthl TTH/<base32>` GET, if known.
    fn tthl_bytes(&self, tth: &Tth) -> Option<Arc<[u8]>>;

    /// Every TTH currently in the share, for the bloom responder.
    fn tth_set(&self) -> Vec<Tth>;
}

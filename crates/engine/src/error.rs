//! The composed error type for the transfer pipeline. Each subsystem keeps
//! its own narrow error enum; this ties them together at the points where
//! they cross a component boundary (the allocator's `recv_done`, the CC
//! state machine's top-level `run` loop).

use tigerwire_core::cid::Uid;

/// Errors attributed to the local `Dl` (our fault) rather than a peer.
#[derive(thiserror::Error, Debug)]
pub enum DlError {
    #[error("I/O error on incoming file: {0}")]
    Io(#[from] std::io::Error),
    #[error("incoming file present but no TTHL known, resume aborted")]
    NoTthlForResume,
    #[error("bitmap absent, legacy file requires user confirmation before resume")]
    LegacyResumeNeedsConfirmation,
}

/// Errors attributed to the reporting peer, reported via ADC `uerr`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum PeerError {
    #[error("hash for block {block} (chunk {chunk_start}-{chunk_end}) does not match")]
    HashMismatch {
        block: u64,
        chunk_start: u64,
        chunk_end: u64,
    },
    #[error("no file")]
    NoFile,
    #[error("no part")]
    NoPart,
    #[error("slots full")]
    SlotsFull,
    #[error("too many connections")]
    TooManyConnections,
}

/// Errors that are fatal for one `CC`.
#[derive(thiserror::Error, Debug)]
pub enum ConnError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("TLS keyprint mismatch")]
    KeyprintMismatch,
    #[error("peer fault: {0}")]
    Peer(#[from] PeerError),
    #[error("local fault: {0}")]
    Local(#[from] DlError),
    #[error("throttled")]
    Throttled,
    #[error("idle timeout")]
    IdleTimeout,
}

/// The record kept on a `Thread` for an error observed off the main
/// event-loop task (e.g. inside a `spawn_blocking` write), raised once
/// `recv_done` runs. Only one error is kept per CC per transfer; later
/// ones are discarded.
#[derive(Debug, Clone)]
pub enum DeferredError {
    Io(String),
    Hash {
        block: u64,
        chunk_start: u64,
        chunk_end: u64,
    },
}

impl std::fmt::Display for DeferredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferredError::Io(msg) => write!(f, "I/O error: {msg}"),
            DeferredError::Hash {
                block,
                chunk_start,
                chunk_end,
            } => write!(
                f,
                "Hash for block {block} (chunk {chunk_start}-{chunk_end}) does not match."
            ),
        }
    }
}

/// Top-level error used by the engine's public async entry points.
#[derive(thiserror::Error, Debug)]
pub enum TigerwireError {
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Dl(#[from] DlError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("peer {0} had no outstanding expect entry")]
    Unexpected(Uid),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TigerwireError>;

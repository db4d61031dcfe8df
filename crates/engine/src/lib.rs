//! The transfer pipeline core: the incoming-file store (`dl`/`dlfile`), the
//! thread/segment allocator, the TTH leaf verifier, the client-to-client
//! connection state machine (`cc`), the expect table, upload slot admission
//! and request throttling, and the bloom filter responder.
//!
//! Everything here is generic over the host process's share indexer and
//! download queue (`share::ShareIndex`, `download::DownloadDriver`,
//! `verifier::TthSource`) so the pipeline has no dependency on how files are
//! discovered or how the hub protocol decides what to fetch next.

pub mod allocator;
pub mod bloom;
pub mod cc;
pub mod connect;
pub mod dl;
pub mod dlfile;
pub mod download;
pub mod error;
pub mod expect;
pub mod framing;
pub mod listen;
pub mod runtime;
pub mod share;
pub mod slots;
pub mod throttle;
pub mod tls;
pub mod translog;
pub mod verifier;

pub use cc::{Cc, CcDeps, CcState, PeerHint};
pub use connect::{connect, BoxAsyncRead, BoxAsyncWrite};
pub use dl::{Dl, DlKey};
pub use download::{DownloadDriver, NextWork};
pub use error::{ConnError, DeferredError, DlError, PeerError};
pub use listen::Listener;
pub use runtime::Runtime;
pub use share::{ShareEntry, ShareIndex, ShareReader};
pub use slots::{Admission, SlotCounters};
pub use throttle::{ThrottleKey, ThrottleTable};
pub use verifier::TthSource;

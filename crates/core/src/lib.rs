pub mod cid;
pub mod config;
pub mod error;
pub mod id;
pub mod layout;
pub mod ratecalc;
pub mod spawn_utils;
pub mod tth;

pub use cid::{Cid, Uid, CID_LEN};
pub use config::{Config, TlsPolicy};
pub use error::Error;
pub use id::Id;
pub use tth::{Tth, TthLeafHasher, TTH_LEN};

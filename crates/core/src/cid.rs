//! ADC client identifiers and the (hub, CID)-derived global peer UID.
use std::hash::{Hash, Hasher};

use crate::id::Id;

pub const CID_LEN: usize = 24;

/// An ADC client ID, base32-displayable like a TTH.
pub type Cid = Id<CID_LEN>;

/// The internal 64-bit derivative used to key the open-CC table and the
/// duplicate guard, computed from (hub-id, CID) so that the same physical
/// client is recognized consistently across hubs without carrying the full
/// 24-byte CID through every lookup.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Uid(pub u64);

impl Uid {
    pub fn from_hub_and_cid(hub_id: u64, cid: &Cid) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hub_id.hash(&mut hasher);
        cid.as_bytes().hash(&mut hasher);
        Uid(hasher.finish())
    }

    /// NMDC has no CID; peers are identified by nick within a hub instead.
    /// The nick is folded with the hub id the same way the ADC path folds
    /// the CID, so both dialects produce comparable `Uid`s.
    pub fn from_hub_and_nick(hub_id: u64, nick: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hub_id.hash(&mut hasher);
        nick.hash(&mut hasher);
        Uid(hasher.finish())
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_hub_and_cid_produce_same_uid() {
        let cid: Cid = Cid::new([3u8; CID_LEN]);
        let a = Uid::from_hub_and_cid(1, &cid);
        let b = Uid::from_hub_and_cid(1, &cid);
        assert_eq!(a, b);
    }

    #[test]
    fn different_hubs_produce_different_uids() {
        let cid: Cid = Cid::new([3u8; CID_LEN]);
        let a = Uid::from_hub_and_cid(1, &cid);
        let b = Uid::from_hub_and_cid(2, &cid);
        assert_ne!(a, b);
    }
}

//! Expect table and duplicate guard. A FIFO of pending invitations the hub
//! layer registers before a peer connects, matched against the first
//! identifying message the peer sends once connected.
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tigerwire_core::cid::{Cid, Uid};

pub const EXPECT_LIFETIME: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub enum ExpectIdentity {
    Adc { cid: Cid, token: String },
    Nmdc { nick: String, hub: u64 },
}

#[derive(Clone, Debug)]
pub struct ExpectEntry {
    pub hub_id: u64,
    pub identity: ExpectIdentity,
    pub expected_keyprint: Option<[u8; 32]>,
    pub want_download: bool,
    deadline: Instant,
}

/// What the matched entry hands back onto the now-identified `CC`.
pub struct Matched {
    pub want_download: bool,
    pub expected_keyprint: Option<[u8; 32]>,
}

pub struct ExpectTable {
    entries: Mutex<Vec<ExpectEntry>>,
}

impl Default for ExpectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpectTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        hub_id: u64,
        identity: ExpectIdentity,
        expected_keyprint: Option<[u8; 32]>,
        want_download: bool,
    ) {
        self.entries.lock().push(ExpectEntry {
            hub_id,
            identity,
            expected_keyprint,
            want_download,
            deadline: Instant::now() + EXPECT_LIFETIME,
        });
    }

    /// Match an inbound ADC `CINF`'s (token, uid) pair: the token must equal
    /// and the uid computed from (hub-id, CID) must equal the stored uid.
    pub fn match_adc(&self, hub_id: u64, cid: &Cid, token: &str) -> Option<Matched> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|e| e.deadline > now);
        let idx = entries.iter().position(|e| {
            e.hub_id == hub_id
                && matches!(&e.identity, ExpectIdentity::Adc { cid: c, token: t } if c == cid && t == token)
        })?;
        let e = entries.remove(idx);
        Some(Matched {
            want_download: e.want_download,
            expected_keyprint: e.expected_keyprint,
        })
    }

    /// Match an inbound NMDC `$MyNick`. `passive` is true when we accepted
    /// the connection, in which case the hub must also match.
    pub fn match_nmdc(&self, hub_id: u64, nick: &str, passive: bool) -> Option<Matched> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|e| e.deadline > now);
        let idx = entries.iter().position(|e| match &e.identity {
            ExpectIdentity::Nmdc { nick: n, hub } => {
                n == nick && (!passive || *hub == hub_id)
            }
            _ => false,
        })?;
        let e = entries.remove(idx);
        Some(Matched {
            want_download: e.want_download,
            expected_keyprint: e.expected_keyprint,
        })
    }

    /// Remove and return entries whose deadline has passed. The caller
    /// notifies the downloader for any that wanted a download, so the peer
    /// can be retried elsewhere.
    pub fn sweep_expired(&self) -> Vec<ExpectEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let (expired, kept): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.deadline <= now);
        *entries = kept;
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Uid derivation helper shared by both match paths, exposed so callers
/// (the `CC` handshake code) can compute a uid the same way the expect
/// table's ADC match path implicitly does.
pub fn adc_uid(hub_id: u64, cid: &Cid) -> Uid {
    Uid::from_hub_and_cid(hub_id, cid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigerwire_core::cid::CID_LEN;
    use tigerwire_core::id::Id;

    #[test]
    fn adc_match_requires_token_and_uid_equality() {
        let table = ExpectTable::new();
        let cid: Cid = Id::new([5u8; CID_LEN]);
        table.register(
            1,
            ExpectIdentity::Adc {
                cid,
                token: "tok".into(),
            },
            None,
            true,
        );
        assert!(table.match_adc(1, &cid, "wrong").is_none());
        let m = table.match_adc(1, &cid, "tok").unwrap();
        assert!(m.want_download);
        // Consumed on match.
        assert!(table.match_adc(1, &cid, "tok").is_none());
    }

    #[test]
    fn nmdc_passive_match_requires_hub_equality() {
        let table = ExpectTable::new();
        table.register(
            1,
            ExpectIdentity::Nmdc {
                nick: "alice".into(),
                hub: 1,
            },
            None,
            false,
        );
        assert!(table.match_nmdc(2, "alice", true).is_none());
        assert!(table.match_nmdc(1, "alice", true).is_some());
    }

    #[test]
    fn entries_expire_after_lifetime() {
        let table = ExpectTable::new();
        table.entries.lock().push(ExpectEntry {
            hub_id: 1,
            identity: ExpectIdentity::Nmdc {
                nick: "bob".into(),
                hub: 1,
            },
            expected_keyprint: None,
            want_download: true,
            deadline: Instant::now() - Duration::from_secs(1),
        });
        let expired = table.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert!(table.is_empty());
    }
}

//! The process-scoped runtime record: the open-CC table, the expect
//! queue, the ratecalc registry and the throttle table, each behind one
//! constructor/destructor, with handles (an `Arc<Runtime>`) passed into
//! component constructors rather than reached for as globals.
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tigerwire_core::cid::Uid;
use tigerwire_core::config::Config;
use tigerwire_core::ratecalc::{sweep_class_bursts, Class, Ratecalc};

use crate::expect::ExpectTable;
use crate::throttle::ThrottleTable;

/// One direction-tagged entry in the open-CC table: at most one active CC
/// per (uid, direction) outside `Disconn`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OpenCcKey {
    pub uid: Uid,
    pub downloading: bool,
}

pub struct Runtime {
    pub config: Config,
    open_cc: DashMap<OpenCcKey, ()>,
    pub expect: ExpectTable,
    pub throttle: ThrottleTable,
    hash_rc: Vec<Arc<Ratecalc>>,
    upload_rc: DashMap<u64, Arc<Ratecalc>>,
    download_rc: DashMap<u64, Arc<Ratecalc>>,
    next_rc_id: std::sync::atomic::AtomicU64,
}

impl Runtime {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            open_cc: DashMap::new(),
            expect: ExpectTable::new(),
            throttle: ThrottleTable::new(),
            hash_rc: Vec::new(),
            upload_rc: DashMap::new(),
            download_rc: DashMap::new(),
            next_rc_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// The duplicate guard: claim the (uid, direction) slot, returning
    /// `false` if another CC already holds it.
    pub fn try_claim_cc(&self, uid: Uid, downloading: bool) -> bool {
        self.open_cc
            .insert(OpenCcKey { uid, downloading }, ())
            .is_none()
    }

    pub fn release_cc(&self, uid: Uid, downloading: bool) {
        self.open_cc.remove(&OpenCcKey { uid, downloading });
    }

    pub fn register_upload_ratecalc(&self) -> (u64, Arc<Ratecalc>) {
        let id = self.next_rc_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let rc = Arc::new(Ratecalc::new(Class::Upload));
        self.upload_rc.insert(id, rc.clone());
        (id, rc)
    }

    pub fn register_download_ratecalc(&self) -> (u64, Arc<Ratecalc>) {
        let id = self.next_rc_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let rc = Arc::new(Ratecalc::new(Class::Download));
        self.download_rc.insert(id, rc.clone());
        (id, rc)
    }

    pub fn unregister_upload_ratecalc(&self, id: u64) {
        self.upload_rc.remove(&id);
    }

    pub fn unregister_download_ratecalc(&self, id: u64) {
        self.download_rc.remove(&id);
    }

    /// One sweep tick: smooth every registered ratecalc's rate, then
    /// recharge bursts per class against the configured caps.
    pub fn sweep_rates(&self) {
        let uploads: Vec<Arc<Ratecalc>> = self.upload_rc.iter().map(|e| e.value().clone()).collect();
        let downloads: Vec<Arc<Ratecalc>> =
            self.download_rc.iter().map(|e| e.value().clone()).collect();

        for rc in uploads.iter().chain(downloads.iter()).chain(self.hash_rc.iter()) {
            rc.sweep_rate();
        }

        let upload_refs: Vec<&Ratecalc> = uploads.iter().map(|a| a.as_ref()).collect();
        sweep_class_bursts(self.config.upload_rate, &upload_refs);

        let download_refs: Vec<&Ratecalc> = downloads.iter().map(|a| a.as_ref()).collect();
        sweep_class_bursts(self.config.download_rate, &download_refs);
    }
}

/// Spawn the 1 Hz rate sweep as a background task. Returns a
/// `CancellationToken` the caller should cancel on shutdown.
pub fn spawn_rate_sweeper(runtime: Arc<Runtime>) -> tokio_util::sync::CancellationToken {
    let token = tokio_util::sync::CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = child.cancelled() => return,
                _ = interval.tick() => runtime.sweep_rates(),
            }
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_guard_rejects_second_claim_same_direction() {
        let rt = Runtime::new(Config::default());
        let uid = Uid(1);
        assert!(rt.try_claim_cc(uid, true));
        assert!(!rt.try_claim_cc(uid, true));
        // Opposite direction is a distinct slot.
        assert!(rt.try_claim_cc(uid, false));
        rt.release_cc(uid, true);
        assert!(rt.try_claim_cc(uid, true));
    }
}

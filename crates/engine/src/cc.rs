//! The client-to-client connection state machine. One `Cc` drives one
//! TCP/TLS session end to end: dialect/TLS detection, handshake, the
//! `Idle`/`Transfer` request loop, slot admission and throttling on the
//! uploading side, and error classification.
//!
//! Both dialects are handled by one state machine operating on the
//! dialect-polymorphic [`tigerwire_proto::Message`]; only the handshake
//! step and the wire encoders differ.
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use tigerwire_core::cid::{Cid, Uid};
use tigerwire_core::config::Config;
use tigerwire_core::ratecalc::Ratecalc;
use tigerwire_core::tth::Tth;
use tigerwire_proto::adc::{status as adc_status, AdcMessage};
use tigerwire_proto::escape::split_tokens;
use tigerwire_proto::lock;
use tigerwire_proto::nmdc::NmdcMessage;
use tigerwire_proto::{Dialect, FileId, Message, TransferType};

use crate::allocator;
use crate::bloom::{self, BloomParams};
use crate::connect::{BoxAsyncRead, BoxAsyncWrite};
use crate::dl::{Dl, DlKey};
use crate::dlfile;
use crate::download::{DownloadDriver, NextWork};
use crate::error::{ConnError, DeferredError, PeerError};
use crate::expect::adc_uid;
use crate::framing::DelimitedCodec;
use crate::runtime::Runtime;
use crate::share::ShareIndex;
use crate::slots::{Admission, SlotCounters};
use crate::throttle::ThrottleKey;
use crate::tls::{self, Keyprint, KeyprintPolicy, PrefixedReader, TlsIdentity};
use crate::translog::{Completion, Direction, TransferLogEntry};
use crate::verifier::TthSource;

/// How long a session may sit in `Idle` with nothing requested before it
/// is disconnected, when no more specific policy applies.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// How long a torn-down session lingers (purely a bookkeeping constant
/// here; the caller owns the actual linger/removal — the state machine's
/// `run` simply returns once it reaches `Disconn`).
pub const DISCONN_LINGER: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CcState {
    Handshake,
    Idle,
    Transfer(Direction),
    Disconn,
}

struct ActiveThread {
    dl: Arc<Dl>,
    thread_idx: usize,
}

/// Metadata of the file currently (or most recently) being transferred,
/// kept for the transfer-log line and for error attribution.
#[derive(Clone, Debug, Default)]
pub struct LastFile {
    pub virtual_name: String,
    pub size: u64,
    pub offset: u64,
    pub length: u64,
    pub tth: Option<Tth>,
}

/// What the expect table (or, for an outbound dial, the invitation itself)
/// told us about who we're talking to before the socket even opened.
pub struct PeerHint {
    pub hub_id: u64,
    pub hub_name: String,
    pub peer_host: String,
    pub want_download: bool,
    pub expected_keyprint: Option<Keyprint>,
}

/// Everything the state machine needs from its host process, gathered so
/// `Cc::run` doesn't reach for globals.
pub struct CcDeps<S, T, D> {
    pub runtime: Arc<Runtime>,
    pub config: Arc<Config>,
    pub share: Arc<S>,
    pub tth_source: Arc<T>,
    pub driver: Arc<D>,
    pub slots: Arc<SlotCounters>,
    pub our_nick: String,
    pub our_cid: Cid,
}

/// Frame-at-a-time I/O over a pair of boxed halves: reads grow a buffer and
/// hand back whatever [`DelimitedCodec`] can carve off of it; raw body
/// bytes (file content, a bloom filter) drain that same buffer before
/// touching the socket again, since a delimiter search can overshoot into
/// the next message's leading bytes.
struct FrameIo {
    read: BoxAsyncRead,
    write: BoxAsyncWrite,
    codec: DelimitedCodec,
    buf: BytesMut,
}

impl FrameIo {
    fn new(read: BoxAsyncRead, write: BoxAsyncWrite, dialect: Dialect) -> Self {
        Self {
            read,
            write,
            codec: DelimitedCodec::new(dialect),
            buf: BytesMut::new(),
        }
    }

    async fn read_frame(&mut self) -> Result<String, ConnError> {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => return Err(ConnError::Protocol(e.to_string())),
            }
            let mut chunk = [0u8; 4096];
            let n = self.read.read(&mut chunk).await.map_err(ConnError::Network)?;
            if n == 0 {
                return Err(ConnError::Network(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_frame(&mut self, s: String) -> Result<(), ConnError> {
        let mut out = BytesMut::new();
        self.codec
            .encode(s, &mut out)
            .map_err(|e| ConnError::Protocol(e.to_string()))?;
        self.write.write_all(&out).await.map_err(ConnError::Network)
    }

    /// Read up to `buf.len()` raw body bytes, draining anything already
    /// pulled off the socket ahead of the next frame before reading more.
    async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if !self.buf.is_empty() {
            let n = buf.len().min(self.buf.len());
            buf[..n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Ok(n);
        }
        self.read.read(buf).await.map_err(ConnError::Network)
    }

    async fn write_body(&mut self, data: &[u8]) -> Result<(), ConnError> {
        self.write.write_all(data).await.map_err(ConnError::Network)
    }
}

pub struct Cc<S, T, D> {
    deps: CcDeps<S, T, D>,
    io: FrameIo,
    state: CcState,
    dialect: Dialect,
    tls: bool,
    active_side: bool,
    hub_id: u64,
    hub_name: String,
    peer_host: String,
    peer_uid: Option<Uid>,
    peer_nick: Option<String>,
    peer_cid: Option<Cid>,
    token: Option<String>,
    nmdc_direction_num: u16,
    observed_keyprint: Option<Keyprint>,
    expected_keyprint: Option<Keyprint>,
    want_download: bool,
    active_thread: Option<ActiveThread>,
    admission: Option<Admission>,
    /// The registered ratecalc for whichever transfer is currently in
    /// flight (`Some` only while `state` is `Transfer(_)`), along with the
    /// id `Runtime` needs to unregister it.
    active_rc: Option<(u64, Arc<Ratecalc>)>,
    pub last_file: Option<LastFile>,
    pub error: Option<ConnError>,
}

/// Peek the TLS-record discriminant byte on a freshly accepted socket,
/// start a server-side TLS handshake if it's one, then peek the first
/// protocol byte to tell ADC from NMDC.
pub async fn accept_and_detect(
    mut read: BoxAsyncRead,
    write: BoxAsyncWrite,
    tls_identity: Option<Arc<TlsIdentity>>,
) -> anyhow::Result<(BoxAsyncRead, BoxAsyncWrite, Dialect, bool, Option<Keyprint>)> {
    let mut first = [0u8; 1];
    read.read_exact(&mut first).await?;

    if tls::looks_like_tls_record(first[0]) {
        let identity = tls_identity
            .ok_or_else(|| anyhow::anyhow!("peer attempted TLS but no identity is configured"))?;
        let prefixed: BoxAsyncRead = Box::new(PrefixedReader::new(vec![first[0]], read));
        let joined = tokio::io::join(prefixed, write);
        let tls_stream = identity.acceptor.accept(joined).await?;
        let keyprint = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(tls::keyprint_of);
        let (mut r, w) = tokio::io::split(tls_stream);

        let mut dialect_byte = [0u8; 1];
        r.read_exact(&mut dialect_byte).await?;
        let dialect = detect_dialect(dialect_byte[0])?;
        let prefixed_inner: BoxAsyncRead = Box::new(PrefixedReader::new(vec![dialect_byte[0]], r));
        return Ok((prefixed_inner, Box::new(w), dialect, true, keyprint));
    }

    let dialect = detect_dialect(first[0])?;
    let prefixed: BoxAsyncRead = Box::new(PrefixedReader::new(vec![first[0]], read));
    Ok((prefixed, write, dialect, false, None))
}

fn detect_dialect(byte: u8) -> anyhow::Result<Dialect> {
    tigerwire_proto::dialect::detect(byte)
        .ok_or_else(|| anyhow::anyhow!("unrecognized first byte {byte:#x}, not ADC or NMDC"))
}

impl<S, T, D> Cc<S, T, D>
where
    S: ShareIndex,
    T: TthSource,
    D: DownloadDriver,
{
    /// Build a `Cc` sitting in `Handshake`, for a connection whose dialect
    /// and TLS status are already known (inbound, via [`accept_and_detect`],
    /// or outbound, where we chose the dialect ourselves per the invitation
    /// we're fulfilling).
    pub fn new(
        deps: CcDeps<S, T, D>,
        read: BoxAsyncRead,
        write: BoxAsyncWrite,
        dialect: Dialect,
        tls: bool,
        observed_keyprint: Option<Keyprint>,
        active_side: bool,
        hint: PeerHint,
    ) -> Self {
        Self {
            deps,
            io: FrameIo::new(read, write, dialect),
            state: CcState::Handshake,
            dialect,
            tls,
            active_side,
            hub_id: hint.hub_id,
            hub_name: hint.hub_name,
            peer_host: hint.peer_host,
            peer_uid: None,
            peer_nick: None,
            peer_cid: None,
            token: None,
            nmdc_direction_num: rand::Rng::random(&mut rand::rng()),
            observed_keyprint,
            expected_keyprint: hint.expected_keyprint,
            want_download: hint.want_download,
            active_thread: None,
            admission: None,
            active_rc: None,
            last_file: None,
            error: None,
        }
    }

    /// Register a ratecalc for a transfer about to start and stash it as
    /// the one currently in flight.
    fn begin_upload_metering(&mut self) {
        let (id, rc) = self.deps.runtime.register_upload_ratecalc();
        self.active_rc = Some((id, rc));
    }

    fn begin_download_metering(&mut self) {
        let (id, rc) = self.deps.runtime.register_download_ratecalc();
        self.active_rc = Some((id, rc));
    }

    /// Meter `n` bytes against whichever ratecalc is currently registered.
    fn record_transfer_bytes(&self, n: u64) {
        if let Some((_, rc)) = &self.active_rc {
            rc.add(n);
        }
    }

    /// Unregister the in-flight transfer's ratecalc once it ends, however
    /// it ends (success, error, or disconnect).
    fn end_upload_metering(&mut self) {
        if let Some((id, _)) = self.active_rc.take() {
            self.deps.runtime.unregister_upload_ratecalc(id);
        }
    }

    fn end_download_metering(&mut self) {
        if let Some((id, _)) = self.active_rc.take() {
            self.deps.runtime.unregister_download_ratecalc(id);
        }
    }

    fn parse_frame(&self, frame: &str) -> Result<Message, ConnError> {
        match self.dialect {
            Dialect::Adc => {
                Message::parse_adc(frame).map_err(|e| ConnError::Protocol(e.to_string()))
            }
            Dialect::Nmdc => {
                Message::parse_nmdc(frame).map_err(|e| ConnError::Protocol(e.to_string()))
            }
        }
    }

    async fn send(&mut self, msg: Message) -> Result<(), ConnError> {
        self.io.write_frame(msg.encode()).await
    }

    async fn send_raw(&mut self, line: String) -> Result<(), ConnError> {
        self.io.write_frame(line).await
    }

    async fn recv_message(&mut self) -> Result<Message, ConnError> {
        let frame = self.io.read_frame().await?;
        self.parse_frame(&frame)
    }

    /// Drive the whole session to completion. Runs `Handshake` then loops
    /// `Idle`/`Transfer` until a fatal error or clean shutdown, at which
    /// point the state is `Disconn` and `self.error` (if any) is set.
    pub async fn run(mut self) -> CcState {
        if let Err(e) = self.handshake().await {
            self.fail(e);
            self.teardown();
            return self.state;
        }

        if !self.claim_duplicate_guard() {
            self.fail(ConnError::Peer(PeerError::TooManyConnections));
            self.teardown();
            return self.state;
        }

        self.state = CcState::Idle;
        if let Err(e) = self.idle_loop().await {
            self.fail(e);
        }
        self.teardown();
        self.state
    }

    fn fail(&mut self, e: ConnError) {
        warn!(peer = ?self.peer_nick, error = %e, "connection failed");
        self.error = Some(e);
        self.state = CcState::Disconn;
    }

    fn teardown(&mut self) {
        if let Some(uid) = self.peer_uid {
            self.deps.runtime.release_cc(uid, self.want_download);
        }
        if let Some(admission) = self.admission.take() {
            self.deps.slots.release(admission);
        }
        if let Some(active) = self.active_thread.take() {
            // Mid-GET disconnect: hand the thread back to the idle pool so
            // another peer (or this one, reconnecting) can resume the range.
            let outcome = allocator::recv_done(&active.dl, active.thread_idx);
            if let Some(peer) = self.peer_uid {
                self.deps.driver.peer_idle(peer);
            }
            self.handle_recv_done_outcome(&active.dl, outcome);
        }
        self.state = CcState::Disconn;
    }

    /// Act on what `allocator::recv_done` says to do: move the file into
    /// place, or tell the queue a closed `Dl`'s last thread just exited.
    fn handle_recv_done_outcome(&self, dl: &Dl, outcome: allocator::RecvDoneOutcome) {
        match outcome {
            allocator::RecvDoneOutcome::Continue => {}
            allocator::RecvDoneOutcome::ReadyToFinish => {
                if let Err(e) = dlfile::finish(dl) {
                    warn!(error = %e, "failed to finish completed download");
                }
            }
            allocator::RecvDoneOutcome::ReadyForRemoval => {
                self.deps.driver.dl_removed(dl.key.clone());
            }
        }
    }

    fn claim_duplicate_guard(&mut self) -> bool {
        match self.peer_uid {
            Some(uid) => self.deps.runtime.try_claim_cc(uid, self.want_download),
            None => true,
        }
    }

    // ---- Handshake ----

    async fn handshake(&mut self) -> Result<(), ConnError> {
        match self.dialect {
            Dialect::Adc => self.handshake_adc().await,
            Dialect::Nmdc => self.handshake_nmdc().await,
        }
    }

    async fn handshake_adc(&mut self) -> Result<(), ConnError> {
        self.send(Message::Adc(AdcMessage::Sup {
            features: vec!["ADBASE".into(), "ADTIGR".into()],
        }))
        .await?;

        let our_token = self.active_side.then(generate_token);
        self.send(Message::Adc(AdcMessage::Inf {
            id: self.deps.our_cid,
            token: our_token.clone(),
        }))
        .await?;

        loop {
            match self.recv_message().await? {
                Message::Adc(AdcMessage::Sup { .. }) => continue,
                Message::Adc(AdcMessage::Inf { id, token }) => {
                    self.peer_cid = Some(id);
                    let uid = adc_uid(self.hub_id, &id);
                    self.peer_uid = Some(uid);

                    let presented = token.as_deref().or(our_token.as_deref()).unwrap_or("");
                    if let Some(matched) = self.deps.runtime.expect.match_adc(self.hub_id, &id, presented)
                    {
                        self.want_download = matched.want_download;
                        self.expected_keyprint = matched.expected_keyprint;
                    } else if !self.active_side {
                        return Err(ConnError::Protocol(
                            "no outstanding expect entry for this peer".into(),
                        ));
                    }

                    if self.tls {
                        let observed = self.observed_keyprint.ok_or(ConnError::KeyprintMismatch)?;
                        if !tls::check_keyprint(
                            KeyprintPolicy::Strict,
                            &observed,
                            self.expected_keyprint.as_ref(),
                        ) {
                            return Err(ConnError::KeyprintMismatch);
                        }
                    }
                    self.token = token.or(our_token);
                    return Ok(());
                }
                _ => return Err(ConnError::Protocol("unexpected message in handshake".into())),
            }
        }
    }

    async fn handshake_nmdc(&mut self) -> Result<(), ConnError> {
        let our_lock = lock::generate_lock();
        self.send_raw(format!("$MyNick {}|", self.deps.our_nick)).await?;
        self.send_raw(format!("$Lock {our_lock} Pk=tigerwire|")).await?;

        let mut peer_nick = None;
        let mut peer_wants_download = None;

        loop {
            match self.recv_message().await? {
                Message::Nmdc(NmdcMessage::MyNick { nick }) => peer_nick = Some(nick),
                Message::Nmdc(NmdcMessage::Lock { lock: peer_lock, .. }) => {
                    let key = lock::lock_to_key(&peer_lock);
                    self.send_raw(format!("$Key {key}|")).await?;
                }
                Message::Nmdc(NmdcMessage::Supports { .. }) => {
                    self.send(Message::Nmdc(NmdcMessage::Direction {
                        download: self.want_download,
                        num: self.nmdc_direction_num,
                    }))
                    .await?;
                }
                Message::Nmdc(NmdcMessage::Direction { download, num }) => {
                    peer_wants_download = Some((download, num));
                }
                Message::Nmdc(NmdcMessage::Key { .. }) => {
                    let nick = peer_nick
                        .clone()
                        .ok_or_else(|| ConnError::Protocol("no $MyNick before $Key".into()))?;
                    self.peer_nick = Some(nick.clone());
                    let uid = Uid::from_hub_and_nick(self.hub_id, &nick);
                    self.peer_uid = Some(uid);

                    if let Some(matched) =
                        self.deps.runtime.expect.match_nmdc(self.hub_id, &nick, !self.active_side)
                    {
                        self.want_download = matched.want_download;
                        self.expected_keyprint = matched.expected_keyprint;
                    } else if !self.active_side {
                        return Err(ConnError::Protocol(
                            "no outstanding expect entry for this peer".into(),
                        ));
                    }

                    // Larger direction number wins when both sides want to
                    // download.
                    if let Some((their_download, their_num)) = peer_wants_download {
                        if their_download && self.want_download {
                            self.want_download = self.nmdc_direction_num > their_num;
                        }
                    }

                    if self.tls {
                        let observed = self.observed_keyprint.ok_or(ConnError::KeyprintMismatch)?;
                        if !tls::check_keyprint(
                            KeyprintPolicy::Strict,
                            &observed,
                            self.expected_keyprint.as_ref(),
                        ) {
                            return Err(ConnError::KeyprintMismatch);
                        }
                    }
                    return Ok(());
                }
                _ => return Err(ConnError::Protocol("unexpected message in handshake".into())),
            }
        }
    }

    // ---- Idle / Transfer loop ----

    async fn idle_loop(&mut self) -> Result<(), ConnError> {
        loop {
            self.state = CcState::Idle;

            if self.want_download {
                if let Some(uid) = self.peer_uid {
                    if let NextWork::Download {
                        dl,
                        estimated_throughput,
                    } = self.deps.driver.next_work(uid)
                    {
                        self.start_download(dl, estimated_throughput).await?;
                        continue;
                    }
                }
            }

            let frame = match tokio::time::timeout(DEFAULT_IDLE_TIMEOUT, self.io.read_frame()).await
            {
                Ok(res) => res?,
                Err(_) => return Err(ConnError::IdleTimeout),
            };

            // `blom` requests don't parse as a `GetRequest` (no such
            // `TransferType`); sniff them from the raw frame before handing
            // it to the generic parser.
            if let Some(params) = sniff_bloom(&frame) {
                self.serve_bloom(params).await?;
                continue;
            }

            let msg = self.parse_frame(&frame)?;
            match msg.as_get() {
                Some(get) => self.serve_upload(get).await?,
                None => debug!(?msg, "ignored message while idle"),
            }
        }
    }

    async fn start_download(&mut self, dl: Arc<Dl>, throughput: u64) -> Result<(), ConnError> {
        let min_segment = self.deps.config.download_segment;
        let peer = self.peer_uid.expect("download-capable CC always has a peer uid");
        let allocation = match allocator::allocate(&dl, peer, throughput, min_segment) {
            Some(a) => a,
            None => return Ok(()), // nothing currently allocatable from this Dl
        };

        let (typ, id, start, bytes) = if dl.is_list {
            (TransferType::List, FileId::FileList, 0u64, -1i64)
        } else {
            let tth = match &dl.key {
                DlKey::Tth(t) => *t,
                DlKey::UserList(_) => unreachable!("file list Dls are always is_list"),
            };
            let start = allocation.chunk * tigerwire_core::layout::CHUNK_SIZE;
            let end =
                (start + allocation.allocated * tigerwire_core::layout::CHUNK_SIZE).min(dl.size);
            (TransferType::File, FileId::Tth(tth), start, (end - start) as i64)
        };

        let get = tigerwire_proto::GetRequest {
            typ,
            id: id.clone(),
            start,
            bytes,
        };
        self.send(match self.dialect {
            Dialect::Adc => Message::Adc(AdcMessage::Get(get)),
            Dialect::Nmdc => Message::Nmdc(NmdcMessage::AdcGet(get)),
        })
        .await?;

        self.state = CcState::Transfer(Direction::Download);
        let response = self.recv_message().await?;
        let snd = match response.as_snd() {
            Some(s) => s,
            None => {
                let outcome = allocator::recv_done(&dl, allocation.thread_idx);
                self.handle_recv_done_outcome(&dl, outcome);
                self.handle_download_refusal(&dl, &response);
                self.state = CcState::Idle;
                return Ok(());
            }
        };

        self.active_thread = Some(ActiveThread {
            dl: dl.clone(),
            thread_idx: allocation.thread_idx,
        });
        self.begin_download_metering();

        let started = Instant::now();
        let (transferred, result) = self
            .receive_transfer_body(&dl, allocation.thread_idx, snd.bytes)
            .await;

        self.active_thread = None;
        self.end_download_metering();
        let outcome = allocator::recv_done(&dl, allocation.thread_idx);
        self.deps.driver.peer_idle(peer);
        self.handle_recv_done_outcome(&dl, outcome);

        let tth = match &dl.key {
            DlKey::Tth(t) => Some(*t),
            DlKey::UserList(_) => None,
        };
        self.last_file = Some(LastFile {
            virtual_name: snd.id.encode(),
            size: dl.size,
            offset: snd.start,
            length: snd.bytes,
            tth,
        });
        self.log_transfer(
            Direction::Download,
            tth.unwrap_or(Tth::new([0u8; 24])),
            dl.size,
            snd.start,
            transferred,
            &snd.id.encode(),
            started.elapsed(),
            result.is_ok(),
        );

        result?;
        self.state = CcState::Idle;
        Ok(())
    }

    fn log_transfer(
        &self,
        direction: Direction,
        tth: Tth,
        size: u64,
        offset: u64,
        bytes_transferred: u64,
        virtual_path: &str,
        duration: Duration,
        complete: bool,
    ) {
        let enabled = match direction {
            Direction::Download => self.deps.config.log_downloads,
            Direction::Upload => self.deps.config.log_uploads,
        };
        if !enabled {
            return;
        }
        let cid_str = self.peer_cid.map(|c| c.to_string());
        let entry = TransferLogEntry {
            hub_name: &self.hub_name,
            cid: cid_str.as_deref(),
            nick: self.peer_nick.as_deref().unwrap_or("-"),
            host: &self.peer_host,
            direction,
            completion: if complete {
                Completion::Complete
            } else {
                Completion::Incomplete
            },
            tth,
            duration,
            size,
            offset,
            bytes_transferred,
            virtual_path,
        };
        tracing::info!(target: "tigerwire::translog", "{entry}");
    }

    /// The remote side declined our GET (no file, no part, slots full, or
    /// — NMDC only — an unstructured `$Error`). Not fatal for the
    /// connection; let the downloader know and stay `Idle`.
    fn handle_download_refusal(&self, dl: &Arc<Dl>, msg: &Message) {
        let no_file = matches!(
            msg,
            Message::Adc(AdcMessage::Sta { code, .. })
                if *code == adc_status::NO_FILE || *code == adc_status::NO_PART
        ) || matches!(msg, Message::Nmdc(NmdcMessage::Error { .. }));

        if no_file {
            if let (Some(peer), DlKey::Tth(tth)) = (self.peer_uid, &dl.key) {
                self.deps.driver.mark_no_file(peer, *tth);
            }
        }
        if let Some(peer) = self.peer_uid {
            self.deps.driver.peer_idle(peer);
        }
    }

    /// Returns bytes actually received so far even when cut short by an
    /// error, so the transfer log can record a partial transfer accurately.
    async fn receive_transfer_body(
        &mut self,
        dl: &Arc<Dl>,
        thread_idx: usize,
        total: u64,
    ) -> (u64, Result<(), ConnError>) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = total;
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = match self.io.read_body(&mut buf[..want]).await {
                Ok(n) => n,
                Err(e) => return (total - remaining, Err(e)),
            };
            if n == 0 {
                let err = ConnError::Network(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-transfer",
                ));
                return (total - remaining, Err(err));
            }
            self.record_transfer_bytes(n as u64);

            let dl_clone = dl.clone();
            let data = buf[..n].to_vec();
            let source = self.deps.tth_source.clone();
            let outcome = match tokio::task::spawn_blocking(move || {
                dlfile::recv(&dl_clone, thread_idx, &data, source.as_ref())
            })
            .await
            {
                Ok(Ok(o)) => o,
                Ok(Err(e)) => return (total - remaining, Err(ConnError::Local(e))),
                Err(e) => {
                    return (total - remaining, Err(ConnError::Network(std::io::Error::other(e))))
                }
            };

            if outcome.save_armed {
                dlfile::arm_save(dl.clone());
            }
            remaining -= n as u64;
            if let Some(DeferredError::Hash {
                block,
                chunk_start,
                chunk_end,
            }) = outcome.block_error
            {
                return (
                    total - remaining,
                    Err(ConnError::Peer(PeerError::HashMismatch {
                        block,
                        chunk_start,
                        chunk_end,
                    })),
                );
            }
        }
        (total, Ok(()))
    }

    // ---- Upload side (slot admission / throttling) ----

    async fn serve_upload(&mut self, get: tigerwire_proto::GetRequest) -> Result<(), ConnError> {
        if get.typ == TransferType::Tthl {
            return self.serve_tthl(get).await;
        }

        let entry = match &get.id {
            FileId::FileList => None,
            FileId::Path(p) => self.deps.share.resolve_path(p),
            FileId::Tth(tth) => self.deps.share.resolve_tth(tth),
        };

        let size = entry.as_ref().map(|e| e.size).unwrap_or(0);
        let is_small = matches!(get.id, FileId::FileList);
        let uid = self.peer_uid.ok_or_else(|| ConnError::Protocol("no peer identity".into()))?;
        let granted = self.deps.driver.has_granted_slot(uid);
        let is_op = self.deps.driver.is_operator(uid);

        // Decide slot admission before touching the throttle bucket: a
        // slots-full refusal must leave the peer's throttle entry
        // untouched (spec scenario: 11 throttled requests without a
        // granted slot still count toward the same bucket that a 153
        // response must not consume).
        let admission = self
            .deps
            .slots
            .try_admit(&self.deps.config, size, is_small, granted, is_op);
        if admission == Admission::Refused {
            return self.send_refusal(adc_status::SLOTS_FULL, "No Slots Available").await;
        }

        if !granted {
            let tth = match &get.id {
                FileId::Tth(t) => *t,
                _ => Tth::new([0u8; 24]),
            };
            let key = ThrottleKey::File {
                uid,
                tth,
                offset: get.start,
            };
            if !self.deps.runtime.throttle.check(key) {
                self.deps.slots.release(admission);
                return self.send_refusal(adc_status::THROTTLED, "Action throttled").await;
            }
        }

        let (bytes, mut reader) = match &get.id {
            FileId::FileList => {
                let list = self.deps.share.file_list_bytes();
                (list.len() as u64, None)
            }
            _ => {
                let entry = match entry {
                    Some(e) => e,
                    None => {
                        self.deps.slots.release(admission);
                        return self.send_refusal(adc_status::NO_FILE, "File Not Available").await;
                    }
                };
                if get.start > entry.size {
                    self.deps.slots.release(admission);
                    return self.send_refusal(adc_status::NO_PART, "Invalid part").await;
                }
                let avail = entry.size - get.start;
                let requested = if get.bytes < 0 {
                    avail
                } else {
                    (get.bytes as u64).min(avail)
                };
                match self.deps.share.open(&entry) {
                    Ok(r) => (requested, Some(r)),
                    Err(e) => {
                        self.deps.slots.release(admission);
                        return Err(ConnError::Network(e));
                    }
                }
            }
        };

        self.admission = Some(admission);
        let snd = tigerwire_proto::SndHeader {
            typ: get.typ,
            id: get.id.clone(),
            start: get.start,
            bytes,
        };
        self.send(match self.dialect {
            Dialect::Adc => Message::Adc(AdcMessage::Snd(snd.clone())),
            Dialect::Nmdc => Message::Nmdc(NmdcMessage::AdcSnd(snd.clone())),
        })
        .await?;

        self.state = CcState::Transfer(Direction::Upload);
        self.begin_upload_metering();
        let started = Instant::now();
        let (transferred, result) = match &mut reader {
            Some(r) => self.stream_file_bytes(r.as_mut(), get.start, bytes).await,
            None => {
                let list = self.deps.share.file_list_bytes();
                match self.io.write_body(&list[..bytes as usize]).await {
                    Ok(()) => {
                        self.record_transfer_bytes(bytes);
                        (bytes, Ok(()))
                    }
                    Err(e) => (0, Err(e)),
                }
            }
        };
        self.end_upload_metering();
        if let Some(a) = self.admission.take() {
            self.deps.slots.release(a);
        }
        let tth = match &get.id {
            FileId::Tth(t) => Some(*t),
            _ => None,
        };
        self.last_file = Some(LastFile {
            virtual_name: get.id.encode(),
            size,
            offset: get.start,
            length: bytes,
            tth,
        });
        self.log_transfer(
            Direction::Upload,
            tth.unwrap_or(Tth::new([0u8; 24])),
            size,
            get.start,
            transferred,
            &get.id.encode(),
            started.elapsed(),
            result.is_ok(),
        );
        result?;
        self.state = CcState::Idle;
        Ok(())
    }

    async fn serve_tthl(&mut self, get: tigerwire_proto::GetRequest) -> Result<(), ConnError> {
        let tth = match &get.id {
            FileId::Tth(t) => *t,
            _ => return self.send_refusal(adc_status::NO_FILE, "File Not Available").await,
        };
        if let Some(uid) = self.peer_uid {
            if !self.deps.driver.has_granted_slot(uid)
                && !self.deps.runtime.throttle.check(ThrottleKey::Tthl { uid, tth })
            {
                return self.send_refusal(adc_status::THROTTLED, "Action throttled").await;
            }
        }
        let bytes = match self.deps.share.tthl_bytes(&tth) {
            Some(b) => b,
            None => return self.send_refusal(adc_status::NO_FILE, "File Not Available").await,
        };
        let snd = tigerwire_proto::SndHeader {
            typ: TransferType::Tthl,
            id: get.id.clone(),
            start: 0,
            bytes: bytes.len() as u64,
        };
        self.send(match self.dialect {
            Dialect::Adc => Message::Adc(AdcMessage::Snd(snd.clone())),
            Dialect::Nmdc => Message::Nmdc(NmdcMessage::AdcSnd(snd.clone())),
        })
        .await?;
        self.state = CcState::Transfer(Direction::Upload);
        self.begin_upload_metering();
        let result = self.io.write_body(&bytes).await;
        if result.is_ok() {
            self.record_transfer_bytes(bytes.len() as u64);
        }
        self.end_upload_metering();
        self.state = CcState::Idle;
        result
    }

    async fn send_refusal(&mut self, code: u16, msg: &str) -> Result<(), ConnError> {
        match self.dialect {
            Dialect::Adc => {
                self.send(Message::Adc(AdcMessage::Sta {
                    code,
                    msg: msg.to_string(),
                }))
                .await
            }
            Dialect::Nmdc if code == adc_status::SLOTS_FULL => {
                self.send(Message::Nmdc(NmdcMessage::MaxedOut)).await
            }
            Dialect::Nmdc => {
                self.send(Message::Nmdc(NmdcMessage::Error {
                    msg: msg.to_string(),
                }))
                .await
            }
        }
    }

    /// Returns bytes actually streamed so far even when cut short by an
    /// error, so the transfer log can record a partial upload accurately.
    async fn stream_file_bytes(
        &mut self,
        reader: &mut dyn crate::share::ShareReader,
        start: u64,
        total: u64,
    ) -> (u64, Result<(), ConnError>) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = start;
        let mut remaining = total;
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = match reader.read_at(offset, &mut buf[..want]) {
                Ok(n) => n,
                Err(e) => return (total - remaining, Err(ConnError::Network(e))),
            };
            if n == 0 {
                break;
            }
            if let Err(e) = self.io.write_body(&buf[..n]).await {
                return (total - remaining, Err(e));
            }
            self.record_transfer_bytes(n as u64);
            offset += n as u64;
            remaining -= n as u64;
        }
        (total - remaining, Ok(()))
    }

    async fn serve_bloom(&mut self, params: BloomParams) -> Result<(), ConnError> {
        let tths = self.deps.share.tth_set();
        let filter = bloom::build(params, tths.into_iter());
        self.send_raw(match self.dialect {
            Dialect::Adc => format!("CSND blom / 0 {}\n", filter.len()),
            Dialect::Nmdc => format!("$ADCSND blom / 0 {}|", filter.len()),
        })
        .await?;
        self.state = CcState::Transfer(Direction::Upload);
        self.begin_upload_metering();
        let result = self.io.write_body(filter.as_bytes()).await;
        if result.is_ok() {
            self.record_transfer_bytes(filter.as_bytes().len() as u64);
        }
        self.end_upload_metering();
        self.state = CcState::Idle;
        result
    }
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..8)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}

/// Recognize a raw `blom` GET line before generic message parsing, since
/// `TransferType`/`GetRequest` can't represent its `BK`/`BH` tokens.
/// `raw` is one already-delimited frame with its `$ADCGET`/`CGET` prefix
/// still attached.
pub fn sniff_bloom(raw: &str) -> Option<BloomParams> {
    let rest = raw.strip_prefix("CGET ").or_else(|| raw.strip_prefix("$ADCGET "))?;
    let tokens = split_tokens(rest);
    if tokens.first().map(String::as_str) != Some("blom") {
        return None;
    }
    let m: u32 = tokens.get(2)?.parse().ok()?;
    let k: u32 = tokens.iter().find_map(|t| t.strip_prefix("BK"))?.parse().ok()?;
    let h: u32 = tokens.iter().find_map(|t| t.strip_prefix("BH"))?.parse().ok()?;
    BloomParams::validate(m, k, h).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_bloom_request_from_adc_get_line() {
        let params = sniff_bloom("CGET blom / 0 64 BK4 BH12").unwrap();
        assert_eq!(params.m, 64);
        assert_eq!(params.k, 4);
        assert_eq!(params.h, 12);
    }

    #[test]
    fn sniffs_bloom_request_from_nmdc_adcget_line() {
        let params = sniff_bloom("$ADCGET blom / 0 64 BK4 BH12").unwrap();
        assert_eq!(params.m, 64);
    }

    #[test]
    fn non_bloom_get_is_not_sniffed() {
        assert!(sniff_bloom("CGET file TTH/ABC 0 -1").is_none());
    }

    #[test]
    fn invalid_bloom_params_are_rejected() {
        assert!(sniff_bloom("CGET blom / 0 9 BK4 BH12").is_none());
    }
}

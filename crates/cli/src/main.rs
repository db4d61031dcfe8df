//! A small standalone driver for the tigerwire transfer engine.
//!
//! A real deployment sits behind a hub client: the hub tells it who to
//! expect, the share indexer tells it what bytes exist, and the download
//! queue tells it what to fetch next. This binary plays all three roles
//! itself with the smallest implementation that can actually move bytes,
//! so the engine can be exercised end to end from a shell. `get` dials a
//! peer and pulls one file (or its file list) by TTH; `serve` accepts
//! inbound connections and answers GETs out of a directory described by a
//! small JSON manifest.
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tigerwire_core::cid::{Cid, Uid, CID_LEN};
use tigerwire_core::config::{Config, TlsPolicy};
use tigerwire_core::layout::CHUNK_SIZE;
use tigerwire_core::tth::Tth;
use tigerwire_engine::{
    dlfile, Cc, CcDeps, CcState, Dl, DlKey, DownloadDriver, Listener, NextWork, PeerHint,
    ShareEntry, ShareIndex, ShareReader, SlotCounters, TthSource,
};
use tigerwire_proto::Dialect;

#[derive(Parser)]
#[command(name = "tigerwire", version, about = "Direct Connect peer-to-peer file transfer, minus the hub")]
struct Opts {
    /// Filter passed to `tracing_subscriber::EnvFilter` (e.g. "debug", "tigerwire_engine=trace").
    #[arg(long, global = true, default_value = "info", env = "TIGERWIRE_LOG")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dial a peer and fetch one file, or its file list, by TTH.
    Get(GetArgs),
    /// Accept inbound connections and serve files out of a share manifest.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct GetArgs {
    /// Address of the peer to dial.
    peer: SocketAddr,

    /// TTH root of the file to fetch. Required unless `--list` is set.
    #[arg(long, value_parser = parse_tth)]
    tth: Option<Tth>,

    /// Total size of the file in bytes. Required unless `--list` is set.
    #[arg(long)]
    size: Option<u64>,

    /// TTH leaf block size in bytes. Defaults to the chunk size, which is
    /// correct whenever the file fits in a single block.
    #[arg(long)]
    block_size: Option<u64>,

    /// Fetch the peer's file list instead of a single file.
    #[arg(long)]
    list: bool,

    /// Where to place the finished file (or file list).
    #[arg(long)]
    out: PathBuf,

    /// Directory for the sparse in-progress file and its bitmap trailer.
    #[arg(long, default_value = "./incoming")]
    incoming_dir: PathBuf,

    /// Our own nick, announced during the handshake.
    #[arg(long, default_value = "tigerwire")]
    nick: String,

    /// Our own CID. A random one is generated if omitted.
    #[arg(long, value_parser = parse_cid)]
    cid: Option<Cid>,

    /// Dialect to announce to the peer.
    #[arg(long, value_enum, default_value = "adc")]
    dialect: DialectArg,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Local address to accept connections on.
    #[arg(long, default_value = "0.0.0.0:1511")]
    listen: SocketAddr,

    /// Directory the manifest's relative paths are resolved against.
    #[arg(long)]
    share_dir: PathBuf,

    /// JSON array of `{"tth": "<base32>", "path": "<relative path>", "size": <bytes>}`.
    #[arg(long)]
    manifest: PathBuf,

    /// Our own nick, announced during the handshake.
    #[arg(long, default_value = "tigerwire")]
    nick: String,

    /// Our own CID. A random one is generated if omitted.
    #[arg(long, value_parser = parse_cid)]
    cid: Option<Cid>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(clap::Args)]
struct ConfigArgs {
    #[arg(long, default_value_t = 3)]
    slots: u32,
    #[arg(long, default_value_t = 3)]
    minislots: u32,
    #[arg(long, default_value_t = 64 * 1024)]
    minislot_size: u64,
    /// Minimum GET segment size in bytes; `0` requests the whole remaining
    /// thread in one GET. This driver only ever offers one `Dl` per peer
    /// and stops offering it once an allocation has been handed out, so a
    /// nonzero value here will leave a download stuck after its first
    /// segment — use the default unless you're exercising the allocator's
    /// segmentation directly.
    #[arg(long, default_value_t = 0)]
    download_segment: u64,
    #[arg(long)]
    upload_rate: Option<u64>,
    #[arg(long)]
    download_rate: Option<u64>,
    #[arg(long)]
    hash_rate: Option<u64>,
    #[arg(long, value_enum, default_value = "allowed")]
    tls_policy: TlsPolicyArg,
    #[arg(long, default_value_t = true)]
    disconnect_offline: bool,
}

impl ConfigArgs {
    fn into_config(self) -> Config {
        Config {
            slots: self.slots,
            minislots: self.minislots,
            minislot_size: self.minislot_size,
            download_segment: self.download_segment,
            upload_rate: self.upload_rate,
            download_rate: self.download_rate,
            hash_rate: self.hash_rate,
            tls_policy: self.tls_policy.into(),
            disconnect_offline: self.disconnect_offline,
            log_downloads: true,
            log_uploads: true,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum TlsPolicyArg {
    Disabled,
    Allowed,
    Preferred,
}

impl From<TlsPolicyArg> for TlsPolicy {
    fn from(v: TlsPolicyArg) -> Self {
        match v {
            TlsPolicyArg::Disabled => TlsPolicy::Disabled,
            TlsPolicyArg::Allowed => TlsPolicy::Allowed,
            TlsPolicyArg::Preferred => TlsPolicy::Preferred,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum DialectArg {
    Adc,
    Nmdc,
}

impl From<DialectArg> for Dialect {
    fn from(v: DialectArg) -> Self {
        match v {
            DialectArg::Adc => Dialect::Adc,
            DialectArg::Nmdc => Dialect::Nmdc,
        }
    }
}

#[derive(Debug)]
struct CliParseError(String);

impl std::fmt::Display for CliParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CliParseError {}

fn parse_cid(s: &str) -> Result<Cid, CliParseError> {
    s.parse().map_err(|e: anyhow::Error| CliParseError(e.to_string()))
}

fn parse_tth(s: &str) -> Result<Tth, CliParseError> {
    s.parse().map_err(|e: anyhow::Error| CliParseError(e.to_string()))
}

fn random_cid() -> Cid {
    use rand::RngCore;
    let mut bytes = [0u8; CID_LEN];
    rand::rng().fill_bytes(&mut bytes);
    Cid::new(bytes)
}

/// Hands a single, already-built `Dl` to the first `next_work` poll and
/// nothing after. Correct as long as a GET drains the whole `Dl` in one
/// shot, which is the default (`download_segment == 0`).
struct SingleShotDriver {
    dl: Mutex<Option<Arc<Dl>>>,
}

impl SingleShotDriver {
    fn new(dl: Arc<Dl>) -> Self {
        Self { dl: Mutex::new(Some(dl)) }
    }
}

impl DownloadDriver for SingleShotDriver {
    fn next_work(&self, _peer: Uid) -> NextWork {
        match self.dl.lock().take() {
            Some(dl) => NextWork::Download { dl, estimated_throughput: 0 },
            None => NextWork::Nothing,
        }
    }
}

/// A driver with nothing queued, ever. Used on the serve side, where the
/// peer does the asking.
struct NullDriver;

impl DownloadDriver for NullDriver {
    fn next_work(&self, _peer: Uid) -> NextWork {
        NextWork::Nothing
    }
}

/// A share with nothing in it. Used on the get side, where we have
/// nothing to offer a peer that turns around and issues us a GET.
struct EmptyShare;

impl ShareIndex for EmptyShare {
    fn resolve_path(&self, _virtual_path: &str) -> Option<ShareEntry> {
        None
    }

    fn resolve_tth(&self, _tth: &Tth) -> Option<ShareEntry> {
        None
    }

    fn open(&self, _entry: &ShareEntry) -> io::Result<Box<dyn ShareReader>> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no share configured"))
    }

    fn file_list_bytes(&self) -> Arc<[u8]> {
        Arc::from(&b""[..])
    }

    fn tthl_bytes(&self, _tth: &Tth) -> Option<Arc<[u8]>> {
        None
    }

    fn tth_set(&self) -> Vec<Tth> {
        Vec::new()
    }
}

/// A source with no leaves on hand. Incoming blocks are written but never
/// independently verified against a hash tree; root-level verification
/// (files that fit in one block) still runs, since it needs no source.
struct NullTthSource;

impl TthSource for NullTthSource {
    fn leaf(&self, _tth_root: &Tth, _block_index: u64) -> Option<[u8; 24]> {
        None
    }
}

#[derive(serde::Deserialize)]
struct ManifestEntry {
    tth: String,
    path: String,
    size: u64,
}

struct FileReader(std::fs::File);

impl ShareReader for FileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.0.read_at(buf, offset)
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            self.0.seek_read(buf, offset)
        }
    }
}

/// A share index over one directory, described by a manifest file. Walking
/// a real share directory, hashing its contents, and building the
/// compressed XML file list are an indexer's job and live outside this
/// engine; this is the smallest thing that can stand in for one.
struct FsShareIndex {
    root: PathBuf,
    by_tth: HashMap<Tth, (PathBuf, u64)>,
}

impl FsShareIndex {
    fn load(root: PathBuf, manifest_path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(manifest_path)
            .with_context(|| format!("reading manifest {}", manifest_path.display()))?;
        let entries: Vec<ManifestEntry> =
            serde_json::from_str(&raw).context("parsing manifest JSON")?;
        let mut by_tth = HashMap::with_capacity(entries.len());
        for entry in entries {
            let tth: Tth = entry
                .tth
                .parse()
                .with_context(|| format!("invalid TTH in manifest: {}", entry.tth))?;
            by_tth.insert(tth, (PathBuf::from(entry.path), entry.size));
        }
        Ok(Self { root, by_tth })
    }
}

impl ShareIndex for FsShareIndex {
    fn resolve_path(&self, _virtual_path: &str) -> Option<ShareEntry> {
        // This stand-in index only answers TTH-addressed lookups.
        None
    }

    fn resolve_tth(&self, tth: &Tth) -> Option<ShareEntry> {
        self.by_tth.get(tth).map(|(_, size)| ShareEntry { tth: *tth, size: *size })
    }

    fn open(&self, entry: &ShareEntry) -> io::Result<Box<dyn ShareReader>> {
        let (path, _) = self
            .by_tth
            .get(&entry.tth)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown tth"))?;
        let file = std::fs::File::open(self.root.join(path))?;
        Ok(Box::new(FileReader(file)))
    }

    fn file_list_bytes(&self) -> Arc<[u8]> {
        Arc::from(&b""[..])
    }

    fn tthl_bytes(&self, _tth: &Tth) -> Option<Arc<[u8]>> {
        None
    }

    fn tth_set(&self) -> Vec<Tth> {
        self.by_tth.keys().copied().collect()
    }
}

/// Placeholder size for a file-list download's sparse backing file: a
/// compressed DC file list is normally well under this, and the real byte
/// count comes from the peer's SND header rather than from anything we
/// declare up front.
const LIST_SIZE_PLACEHOLDER: u64 = 4 * 1024 * 1024;

fn incoming_file_name(key: &DlKey) -> String {
    match key {
        DlKey::Tth(tth) => format!("{}.part", tth.as_base32()),
        DlKey::UserList(uid) => format!("filelist-{uid}.part"),
    }
}

async fn run_get(args: GetArgs) -> anyhow::Result<()> {
    let config_val = args.config.into_config();
    let runtime = tigerwire_engine::runtime::Runtime::new(config_val.clone());
    let config = Arc::new(config_val);

    std::fs::create_dir_all(&args.incoming_dir)
        .with_context(|| format!("creating {}", args.incoming_dir.display()))?;

    let our_cid = args.cid.unwrap_or_else(random_cid);

    let (dl_key, size, block_size) = if args.list {
        (DlKey::UserList(Uid(0)), LIST_SIZE_PLACEHOLDER, CHUNK_SIZE)
    } else {
        let tth = args.tth.context("--tth is required unless --list is set")?;
        let size = args.size.context("--size is required unless --list is set")?;
        let block_size = args.block_size.unwrap_or(CHUNK_SIZE);
        (DlKey::Tth(tth), size, block_size)
    };

    let incoming_path = args.incoming_dir.join(incoming_file_name(&dl_key));
    let dl = Arc::new(
        dlfile::create(dl_key, args.out.clone(), incoming_path, size, block_size, args.list, 0)
            .context("creating incoming file")?,
    );

    let driver = Arc::new(SingleShotDriver::new(dl.clone()));
    let share = Arc::new(EmptyShare);
    let tth_source = Arc::new(NullTthSource);
    let slots = Arc::new(SlotCounters::new());
    let sweeper = tigerwire_engine::runtime::spawn_rate_sweeper(runtime.clone());

    let (read, write, tls_used, _keyprint) =
        tigerwire_engine::connect(args.peer, None, TlsPolicy::Disabled)
            .await
            .with_context(|| format!("connecting to {}", args.peer))?;

    let deps = CcDeps {
        runtime,
        config,
        share,
        tth_source,
        driver,
        slots,
        our_nick: args.nick.clone(),
        our_cid,
    };
    let hint = PeerHint {
        hub_id: 0,
        hub_name: "standalone".to_string(),
        peer_host: args.peer.to_string(),
        want_download: true,
        expected_keyprint: None,
    };

    let cc = Cc::new(deps, read, write, args.dialect.into(), tls_used, None, true, hint);
    let final_state = cc.run().await;
    sweeper.cancel();

    match final_state {
        CcState::Disconn if dl.is_complete() || args.list => {
            info!(have = dl.have(), size = dl.size, "transfer finished");
        }
        CcState::Disconn => {
            warn!(have = dl.have(), size = dl.size, "peer disconnected before the transfer finished");
        }
        other => warn!(?other, "session ended in an unexpected state"),
    }
    Ok(())
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config_val = args.config.into_config();
    let runtime = tigerwire_engine::runtime::Runtime::new(config_val.clone());
    let config = Arc::new(config_val);
    let sweeper = tigerwire_engine::runtime::spawn_rate_sweeper(runtime.clone());

    let share = Arc::new(FsShareIndex::load(args.share_dir.clone(), &args.manifest)?);
    let slots = Arc::new(SlotCounters::new());
    let our_cid = args.cid.unwrap_or_else(random_cid);
    let our_nick = args.nick.clone();

    let listener = Listener::bind(args.listen).await.context("binding listener")?;
    info!(addr = %listener.local_addr, "serving uploads");

    listener
        .serve(tokio_util::sync::CancellationToken::new(), move |peer_addr, read, write| {
            let runtime = runtime.clone();
            let config = config.clone();
            let share = share.clone();
            let slots = slots.clone();
            let our_nick = our_nick.clone();
            tokio::spawn(async move {
                let (read, write, dialect, tls_used, keyprint) =
                    match tigerwire_engine::cc::accept_and_detect(read, write, None).await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(%peer_addr, error = %e, "rejected inbound connection");
                            return;
                        }
                    };
                let deps = CcDeps {
                    runtime,
                    config,
                    share,
                    tth_source: Arc::new(NullTthSource),
                    driver: Arc::new(NullDriver),
                    slots,
                    our_nick,
                    our_cid,
                };
                let hint = PeerHint {
                    hub_id: 0,
                    hub_name: "standalone".to_string(),
                    peer_host: peer_addr.to_string(),
                    want_download: false,
                    expected_keyprint: None,
                };
                let cc = Cc::new(deps, read, write, dialect, tls_used, keyprint, false, hint);
                let state = cc.run().await;
                info!(%peer_addr, ?state, "connection closed");
            });
        })
        .await;

    sweeper.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&opts.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match opts.command {
        Command::Get(args) => run_get(args).await,
        Command::Serve(args) => run_serve(args).await,
    }
}

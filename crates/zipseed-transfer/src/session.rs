//! Fetch session: download content from compressed web seeds
//!
//! One connection per web-seed URL, all running concurrently on tokio:
//!
//! ```text
//!   WorkQueue --take--> connection task --read_range--> seed
//!       ^                    |  feed -> DecompressPool -> complete_offloaded
//!       |                    v
//!       +--requeue--  piece store task (verify + write, blocking thread)
//! ```
//!
//! Pieces held by a connection that fails go back to the queue for the
//! surviving connections. A piece failing hash verification is fetched again
//! up to `max_retries` times. The session fails only when no connection is
//! left while pieces are still missing.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use opendal::Operator;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use zipseed_chunks::{codec_for, Metainfo, PieceCodec};
use zipseed_core::config::TransferConfig;
use zipseed_core::{PieceIndex, ZipseedError, ZipseedResult};
use zipseed_storage::{check_blob, open_seed, read_range};

use crate::connection::{WebSeedPeer, ZipSeedConnection};
use crate::mapper::RangeMapper;
use crate::pool::DecompressPool;
use crate::reassembly::ReassembledBlock;
use crate::scheduler::{PendingPieceRequest, TransferGate};
use crate::sink::{PieceOutcome, PieceStore};

/// Progress callback type (pieces_verified, pieces_total)
pub type SessionProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

const BLOCK_CHANNEL_DEPTH: usize = 256;
const IDLE_POLL: Duration = Duration::from_millis(250);

/// One web seed: a label plus the operator and path serving the blob.
#[derive(Debug, Clone)]
pub struct Seed {
    pub url: String,
    pub op: Operator,
    pub path: String,
}

impl Seed {
    pub fn open(url: &str, max_retries: usize) -> ZipseedResult<Self> {
        let (op, location) = open_seed(url, max_retries)?;
        Ok(Self {
            url: url.to_string(),
            op,
            path: location.path,
        })
    }

    pub fn with_operator(url: impl Into<String>, op: Operator, path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            op,
            path: path.into(),
        }
    }
}

/// Outcome of a completed session
#[derive(Debug, Default)]
pub struct FetchReport {
    pub pieces: usize,
    pub plain_bytes: u64,
    pub compressed_bytes: u64,
    pub hash_failures: u64,
    /// (url, reason) for every seed that was dropped
    pub failed_seeds: Vec<(String, String)>,
    pub files: Vec<PathBuf>,
}

pub struct FetchSession {
    meta: Arc<Metainfo>,
    seeds: Vec<Seed>,
    config: TransferConfig,
    out_dir: PathBuf,
}

impl FetchSession {
    pub fn new(
        meta: Metainfo,
        seeds: Vec<Seed>,
        config: TransferConfig,
        out_dir: &Path,
    ) -> ZipseedResult<Self> {
        if meta.zipinfo.is_none() {
            return Err(ZipseedError::Metadata(
                "metadata carries no zipinfo record".into(),
            ));
        }
        if seeds.is_empty() {
            return Err(ZipseedError::Config("no web seeds to fetch from".into()));
        }
        Ok(Self {
            meta: Arc::new(meta),
            seeds,
            config,
            out_dir: out_dir.to_path_buf(),
        })
    }

    /// Open every URL of the metadata's `url-list` plus `extra_urls`.
    pub fn from_metainfo(
        meta: Metainfo,
        extra_urls: &[String],
        config: TransferConfig,
        out_dir: &Path,
    ) -> ZipseedResult<Self> {
        let mut urls: Vec<String> = meta
            .zipinfo
            .as_ref()
            .map(|z| z.url_list.urls().into_iter().map(String::from).collect())
            .unwrap_or_default();
        for url in extra_urls {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }

        let seeds = urls
            .iter()
            .map(|u| Seed::open(u, config.max_retries))
            .collect::<ZipseedResult<Vec<_>>>()?;
        Self::new(meta, seeds, config, out_dir)
    }

    pub async fn run(self, progress: Option<SessionProgressFn>) -> ZipseedResult<FetchReport> {
        let zip = self
            .meta
            .zipinfo
            .as_ref()
            .ok_or_else(|| ZipseedError::Metadata("metadata carries no zipinfo record".into()))?;
        let layout = self.meta.layout();
        let codec = codec_for(zip.codec, zip.level);
        let mapper = Arc::new(RangeMapper::new(
            Arc::new(zip.pieces_size.clone()),
            layout.piece_length,
            layout.total_length(),
        ));
        let pool = DecompressPool::new(
            codec.clone(),
            self.config.effective_workers(),
            self.config.block_size,
        );

        let mut report = FetchReport::default();
        let mut live = Vec::new();
        for seed in self.seeds {
            match check_blob(&seed.op, &seed.path, zip.total_size).await {
                Ok(()) => live.push(seed),
                Err(e) => {
                    warn!(url = %seed.url, error = %e, "web seed unusable, skipping");
                    report.failed_seeds.push((seed.url, e.to_string()));
                }
            }
        }
        if live.is_empty() {
            return Err(ZipseedError::Transport("no usable web seed".into()));
        }

        let store = PieceStore::create(&self.meta, &self.out_dir)?;
        let total = store.num_pieces();
        report.files = store.file_paths();
        info!(
            name = %self.meta.name,
            pieces = total,
            seeds = live.len(),
            codec = %zip.codec,
            "fetch starting"
        );

        let shared = Arc::new(Shared {
            mapper,
            codec,
            pool,
            queue: WorkQueue::new(store.missing_pieces()),
            config: self.config.clone(),
        });

        let (tx, rx) = mpsc::channel::<ReassembledBlock>(BLOCK_CHANNEL_DEPTH);
        let writer = {
            let shared = shared.clone();
            let max_failures = self.config.max_retries as u32;
            tokio::task::spawn_blocking(move || {
                store_loop(store, rx, &shared.queue, progress, max_failures)
            })
        };

        let mut set = JoinSet::new();
        for seed in live {
            let shared = shared.clone();
            let tx = tx.clone();
            set.spawn(async move { run_connection(seed, shared, tx).await });
        }
        drop(tx);

        while let Some(joined) = set.join_next().await {
            let conn = joined.map_err(|e| {
                ZipseedError::Other(anyhow::anyhow!("connection task failed: {e}"))
            })?;
            report.compressed_bytes += conn.compressed_bytes;
            if let Some(reason) = conn.error {
                report.failed_seeds.push((conn.url, reason));
            }
        }
        // Nobody is left to fetch; release anyone still waiting on the queue.
        shared.queue.close();

        let summary = writer
            .await
            .map_err(|e| ZipseedError::Other(anyhow::anyhow!("piece store task failed: {e}")))??;
        report.pieces = summary.verified;
        report.plain_bytes = summary.plain_bytes;
        report.hash_failures = summary.hash_failures;

        if !summary.abandoned.is_empty() {
            return Err(ZipseedError::Metadata(format!(
                "pieces {:?} failed hash verification too many times",
                summary.abandoned
            )));
        }
        if summary.verified < total {
            return Err(ZipseedError::Transport(format!(
                "all web seeds failed with {} of {total} pieces missing",
                total - summary.verified
            )));
        }

        info!(
            pieces = report.pieces,
            plain_bytes = report.plain_bytes,
            compressed_bytes = report.compressed_bytes,
            "fetch complete"
        );
        Ok(report)
    }
}

struct Shared {
    mapper: Arc<RangeMapper>,
    codec: Arc<dyn PieceCodec>,
    pool: DecompressPool,
    queue: WorkQueue,
    config: TransferConfig,
}

// ── Work queue ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<PieceIndex>,
    /// Pieces not yet verified or abandoned
    remaining: usize,
    closed: bool,
}

/// Pieces waiting for a connection, shared by all connection tasks.
struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

enum Wait {
    Work,
    Done,
}

impl WorkQueue {
    fn new(pieces: Vec<PieceIndex>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                remaining: pieces.len(),
                pending: pieces.into(),
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, n: usize) -> Vec<PieceIndex> {
        let mut st = self.lock();
        let n = n.min(st.pending.len());
        st.pending.drain(..n).collect()
    }

    fn requeue(&self, pieces: Vec<PieceIndex>) {
        if pieces.is_empty() {
            return;
        }
        debug!(pieces = ?pieces, "returning pieces to the work queue");
        self.lock().pending.extend(pieces);
        self.changed.notify_waiters();
    }

    /// A piece left the download set, verified or abandoned.
    fn settle(&self) {
        let done = {
            let mut st = self.lock();
            st.remaining = st.remaining.saturating_sub(1);
            st.remaining == 0
        };
        if done {
            self.changed.notify_waiters();
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    async fn wait_for_work(&self) -> Wait {
        loop {
            let notified = self.changed.notified();
            {
                let st = self.lock();
                if st.closed || st.remaining == 0 {
                    return Wait::Done;
                }
                if !st.pending.is_empty() {
                    return Wait::Work;
                }
            }
            let _ = tokio::time::timeout(IDLE_POLL, notified).await;
        }
    }
}

// ── Connection task ───────────────────────────────────────────────────────

/// Peer capability for a session connection: collects requests and blocks
/// for the task loop to act on.
#[derive(Default)]
struct SessionPeer {
    requests: Vec<PendingPieceRequest>,
    blocks: Vec<ReassembledBlock>,
    delivered: u64,
}

impl WebSeedPeer for SessionPeer {
    fn send_range_request(&mut self, request: &PendingPieceRequest) {
        self.requests.push(*request);
    }

    fn incoming_block(&mut self, block: ReassembledBlock) {
        self.blocks.push(block);
    }

    fn on_progress(&mut self, bytes: u64) {
        self.delivered += bytes;
    }
}

struct ConnectionReport {
    url: String,
    compressed_bytes: u64,
    error: Option<String>,
}

async fn run_connection(
    seed: Seed,
    shared: Arc<Shared>,
    tx: mpsc::Sender<ReassembledBlock>,
) -> ConnectionReport {
    let depth = shared.config.desired_queue_size.max(1);
    let timeout = Duration::from_secs(shared.config.request_timeout_secs.max(1));
    let mut conn = ZipSeedConnection::new(
        SessionPeer::default(),
        shared.mapper.clone(),
        shared.codec.clone(),
        TransferGate::downloading(depth),
        shared.config.block_size,
    );
    let mut report = ConnectionReport {
        url: seed.url.clone(),
        compressed_bytes: 0,
        error: None,
    };

    loop {
        let held = conn.scheduler().in_flight_len() + conn.scheduler().desired_len();
        for piece in shared.queue.take(depth.saturating_sub(held)) {
            conn.enqueue(piece);
        }
        if let Err(e) = conn.pump() {
            return abort(conn, &shared.queue, report, e);
        }

        let requests = std::mem::take(&mut conn.peer_mut().requests);
        if requests.is_empty() {
            match shared.queue.wait_for_work().await {
                Wait::Work => continue,
                Wait::Done => break,
            }
        }

        for request in requests {
            let range = request.range();
            let fetched =
                tokio::time::timeout(timeout, read_range(&seed.op, &seed.path, range.as_range()))
                    .await;
            let bytes = match fetched {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => return abort(conn, &shared.queue, report, e),
                Err(_) => {
                    let e = ZipseedError::Transport(format!(
                        "{} timed out after {}s",
                        range.header_value(),
                        timeout.as_secs()
                    ));
                    return abort(conn, &shared.queue, report, e);
                }
            };
            report.compressed_bytes += bytes.len() as u64;

            let bodies = match conn.feed(&bytes) {
                Ok(bodies) => bodies,
                Err(e) => return abort(conn, &shared.queue, report, e),
            };
            let mut bodies = bodies.into_iter();
            while let Some(body) = bodies.next() {
                let req = body.request;
                let decoded = shared.pool.decode(body).await;
                if let Err(e) = conn.complete_offloaded(&req, decoded) {
                    shared.queue.requeue(bodies.map(|b| b.request.piece).collect());
                    return abort(conn, &shared.queue, report, e);
                }
            }

            let blocks = std::mem::take(&mut conn.peer_mut().blocks);
            for block in blocks {
                if tx.send(block).await.is_err() {
                    let e = ZipseedError::Other(anyhow::anyhow!("piece store stopped"));
                    return abort(conn, &shared.queue, report, e);
                }
            }
        }
    }

    debug!(
        url = %report.url,
        compressed_bytes = report.compressed_bytes,
        plain_bytes = conn.peer().delivered,
        "web seed connection finished"
    );
    report
}

/// Tear the connection down and hand everything it held back to the queue.
fn abort(
    mut conn: ZipSeedConnection<SessionPeer>,
    queue: &WorkQueue,
    mut report: ConnectionReport,
    error: ZipseedError,
) -> ConnectionReport {
    warn!(url = %report.url, error = %error, "web seed connection failed");
    let mut lost = conn.take_dropped();
    lost.extend(conn.disconnect(ZipseedError::Disconnected(error.to_string())));
    // Decoded blocks that never reached the store
    let peer = conn.peer_mut();
    let mut undelivered: Vec<PieceIndex> = peer.blocks.drain(..).map(|b| b.piece).collect();
    undelivered.dedup();
    lost.extend(undelivered);
    lost.extend(peer.requests.drain(..).map(|r| r.piece));
    lost.sort_unstable();
    lost.dedup();
    queue.requeue(lost);

    report.error = Some(error.to_string());
    report
}

// ── Piece store task ──────────────────────────────────────────────────────

struct StoreSummary {
    verified: usize,
    plain_bytes: u64,
    hash_failures: u64,
    abandoned: Vec<PieceIndex>,
}

fn store_loop(
    mut store: PieceStore,
    mut rx: mpsc::Receiver<ReassembledBlock>,
    queue: &WorkQueue,
    progress: Option<SessionProgressFn>,
    max_failures: u32,
) -> ZipseedResult<StoreSummary> {
    let total = store.num_pieces() as u64;
    let mut plain_bytes = 0u64;
    let mut failures: HashMap<PieceIndex, u32> = HashMap::new();
    let mut abandoned = Vec::new();

    while let Some(block) = rx.blocking_recv() {
        let piece = block.piece;
        let outcome = match store.ingest(block) {
            Ok(outcome) => outcome,
            Err(e) => {
                queue.close();
                return Err(e);
            }
        };
        match outcome {
            PieceOutcome::Partial | PieceOutcome::Duplicate => {}
            PieceOutcome::Verified => {
                plain_bytes += store.piece_size(piece);
                queue.settle();
                if let Some(cb) = &progress {
                    cb(store.verified_pieces() as u64, total);
                }
            }
            PieceOutcome::HashMismatch => {
                let count = failures.entry(piece).or_insert(0);
                *count += 1;
                if *count > max_failures {
                    warn!(piece, attempts = *count, "giving up on piece");
                    abandoned.push(piece);
                    queue.settle();
                } else {
                    queue.requeue(vec![piece]);
                }
            }
        }
    }

    if let Err(e) = store.sync_all() {
        queue.close();
        return Err(e);
    }
    Ok(StoreSummary {
        verified: store.verified_pieces(),
        plain_bytes,
        hash_failures: store.hash_failures(),
        abandoned,
    })
}

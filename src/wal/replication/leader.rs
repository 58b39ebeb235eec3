//! The leader side of replication: a gRPC service streaming log entries to
//! followers. One background thread per connected client bridges the
//! blocking [`crate::wal::reader::Reader`] onto the async response stream.
//! See `SPEC_FULL.md` §4.6.
//!
//! The hot path tails the shared, live [`Log`] directly. The moment a
//! client's next index has aged out of that log's in-memory cache, the
//! session reopens the segment directory through a caller-supplied
//! [`ColdLogOpener`] — a second, independent `Log` handle with its own
//! segment cache — streams everything up to that handle's `last_index()`
//! snapshot, and returns. Ending the stream there (rather than looping
//! forever on the cold handle) forces the client to reconnect, at which
//! point it re-enters this same decision with an up-to-date `last_index`
//! and, typically, lands back in the hot path.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::wal::error::{Error, Result};
use crate::wal::framing;
use crate::wal::log::{Entry, Log};
use crate::wal::metrics::Gauge;
use crate::wal::replication::pb;

/// Reopens the replicated log read-only (typically `Log::open_read_only`
/// against the same directory, with its own segment cache) for the cold
/// replay path. See `SPEC_FULL.md` §4.6.
pub type ColdLogOpener = Arc<dyn Fn() -> Result<Arc<Log>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LeaderOptions {
    /// Entries per batch when the client's request doesn't specify one.
    pub batch_limit: usize,
    /// Lag (in entries) above which a throttled warning is logged.
    pub lag_warn_threshold: u64,
    /// Only warn on indices that are a multiple of this, so a lagging client
    /// doesn't spam the log once per entry.
    pub lag_warn_every_n_index: u64,
    /// Channel depth between the session thread and the gRPC response stream.
    pub channel_capacity: usize,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        Self {
            batch_limit: 256,
            lag_warn_threshold: 100_000,
            lag_warn_every_n_index: 500,
            channel_capacity: 16,
        }
    }
}

/// `Replicator` gRPC service backed by a single [`Log`].
pub struct ReplicatorService {
    log: Arc<Log>,
    cold_log_opener: ColdLogOpener,
    options: LeaderOptions,
    next_client_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    lag_gauges: Mutex<HashMap<u64, Arc<Gauge>>>,
}

impl ReplicatorService {
    pub fn new(log: Arc<Log>, cold_log_opener: ColdLogOpener, options: LeaderOptions) -> Arc<Self> {
        Arc::new(Self {
            log,
            cold_log_opener,
            options,
            next_client_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            lag_gauges: Mutex::new(HashMap::new()),
        })
    }

    /// Current replication lag reported by a given client, if it's connected.
    pub fn lag_gauge(&self, client_id: u64) -> Option<Arc<Gauge>> {
        self.lag_gauges.lock().unwrap().get(&client_id).cloned()
    }

    /// Cancels a connected client's session; its stream closes on the next
    /// batch attempt.
    pub fn cancel_session(&self, client_id: u64) {
        if let Some(flag) = self.sessions.lock().unwrap().get(&client_id) {
            flag.store(true, Ordering::Release);
        }
    }

    fn register_session(&self) -> (u64, Arc<AtomicBool>, Arc<Gauge>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let gauge = Gauge::new();
        self.sessions
            .lock()
            .unwrap()
            .insert(client_id, Arc::clone(&cancel));
        self.lag_gauges
            .lock()
            .unwrap()
            .insert(client_id, Arc::clone(&gauge));
        (client_id, cancel, gauge)
    }
}

/// Binds and serves the `Replicator` service on `listener`, optionally over
/// mutual TLS. Blocks until the server shuts down.
pub async fn serve(
    listener: tokio::net::TcpListener,
    service: Arc<ReplicatorService>,
    tls: Option<ServerTlsConfig>,
) -> Result<()> {
    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder
            .tls_config(tls)
            .map_err(|e| Error::Transport(e.to_string()))?;
    }
    builder
        .add_service(pb::replicator_server::ReplicatorServer::from_arc(service))
        .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

type EntriesResult = std::result::Result<pb::Entries, Status>;

/// Sends batches for one client session until the cold phase catches up to
/// its snapshot (then returns, ending the stream) or the hot phase hits an
/// unrecoverable read error / cancellation.
fn run_session(
    log: Arc<Log>,
    cold_log_opener: ColdLogOpener,
    client_id: u64,
    cancel: Arc<AtomicBool>,
    lag_gauge: Arc<Gauge>,
    tx: tokio::sync::mpsc::Sender<EntriesResult>,
    filters: Vec<String>,
    limit: usize,
    options: LeaderOptions,
    start_index: u64,
) {
    let mut next_index = start_index;

    loop {
        if cancel.load(Ordering::Acquire) {
            return;
        }

        if log.is_in_memory(next_index) || next_index > log.last_index() {
            // Hot: tail the shared, live log.
            let mut reader = log.open_reader(next_index.saturating_sub(1));
            loop {
                if cancel.load(Ordering::Acquire) {
                    reader.close();
                    return;
                }
                if !log.is_in_memory(next_index) && next_index <= log.last_index() {
                    // Aged out from under us while tailing; drop to the cold
                    // branch on the next outer iteration.
                    reader.close();
                    break;
                }
                let batch = match reader.read_at_most(limit) {
                    Ok(batch) => batch,
                    Err(Error::LogClosed) => {
                        reader.close();
                        return;
                    }
                    Err(e) => {
                        warn!("wal: replication session {client_id} read error: {e}");
                        let _ = tx.blocking_send(Err(Status::internal(e.to_string())));
                        reader.close();
                        return;
                    }
                };
                if batch.is_empty() {
                    continue;
                }
                next_index = batch.last().unwrap().index + 1;
                if !send_batch(
                    &log, client_id, &lag_gauge, &tx, &filters, &options, &batch,
                ) {
                    reader.close();
                    return;
                }
            }
        } else {
            // Cold: a separate handle/cache, bounded to its own snapshot of
            // last_index. Returning at the end of this block forces a
            // reconnect rather than looping on the cold handle forever.
            let cold_log = match cold_log_opener() {
                Ok(opened) => opened,
                Err(e) => {
                    warn!("wal: replication session {client_id} cold reopen failed: {e}");
                    let _ = tx.blocking_send(Err(Status::internal(e.to_string())));
                    return;
                }
            };
            let snapshot = cold_log.last_index();
            if next_index > snapshot {
                // Nothing to replay cold after all; let the outer loop
                // re-evaluate against the live log.
                continue;
            }
            let mut reader = cold_log.open_reader(next_index.saturating_sub(1));
            while next_index <= snapshot {
                if cancel.load(Ordering::Acquire) {
                    reader.close();
                    return;
                }
                let batch = match reader.read_at_most(limit.min((snapshot - next_index + 1) as usize)) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("wal: replication session {client_id} cold read error: {e}");
                        let _ = tx.blocking_send(Err(Status::internal(e.to_string())));
                        reader.close();
                        return;
                    }
                };
                if batch.is_empty() {
                    break;
                }
                next_index = batch.last().unwrap().index + 1;
                if !send_batch(
                    &cold_log, client_id, &lag_gauge, &tx, &filters, &options, &batch,
                ) {
                    reader.close();
                    return;
                }
            }
            reader.close();
            return;
        }
    }
}

/// Frames and sends one batch; returns `false` if the client disconnected.
fn send_batch(
    log: &Log,
    client_id: u64,
    lag_gauge: &Gauge,
    tx: &tokio::sync::mpsc::Sender<EntriesResult>,
    filters: &[String],
    options: &LeaderOptions,
    batch: &[Entry],
) -> bool {
    let last_idx = batch.last().map(|e| e.index).unwrap_or(0);
    let lag = log.last_index().saturating_sub(last_idx);
    lag_gauge.set(lag as i64);
    if lag > options.lag_warn_threshold && last_idx % options.lag_warn_every_n_index == 0 {
        warn!("wal: replication client {client_id} lagging by {lag} entries at index {last_idx}");
    }

    let mut entries = Vec::with_capacity(batch.len());
    for entry in batch {
        let name = match framing::unpack(&entry.data) {
            Ok((name, _)) => name,
            Err(e) => {
                warn!(
                    "wal: replication session {client_id} unpack error at index {}: {e}",
                    entry.index
                );
                continue;
            }
        };
        let data = if framing::match_any(name, filters) {
            entry.data.to_vec()
        } else {
            Vec::new()
        };
        entries.push(pb::Entry {
            index: entry.index,
            data,
        });
    }
    tx.blocking_send(Ok(pb::Entries { entries })).is_ok()
}

#[tonic::async_trait]
impl pb::replicator_server::Replicator for ReplicatorService {
    type BeginReplicationStream = Pin<Box<dyn Stream<Item = EntriesResult> + Send + 'static>>;

    async fn begin_replication(
        &self,
        request: Request<pb::ReplicationRequest>,
    ) -> std::result::Result<Response<Self::BeginReplicationStream>, Status> {
        let req = request.into_inner();
        let limit = if req.limit > 0 {
            req.limit as usize
        } else {
            self.options.batch_limit
        };
        let filters = req.filtered_streams;
        let (client_id, cancel, lag_gauge) = self.register_session();
        let log = Arc::clone(&self.log);
        let cold_log_opener = Arc::clone(&self.cold_log_opener);
        let options = self.options.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<EntriesResult>(options.channel_capacity);
        let start_index = req.last_index + 1;

        std::thread::spawn(move || {
            run_session(
                log,
                cold_log_opener,
                client_id,
                cancel,
                lag_gauge,
                tx,
                filters,
                limit,
                options,
                start_index,
            );
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn debug_write(
        &self,
        request: Request<pb::DebugWriteRequest>,
    ) -> std::result::Result<Response<pb::DebugWriteResponse>, Status> {
        let req = request.into_inner();
        let index = self
            .log
            .write(&req.data, |_| {})
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(pb::DebugWriteResponse { index }))
    }
}

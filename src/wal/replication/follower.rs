//! The follower side of replication: dials a leader, streams entries into a
//! local [`Log`], and reconnects with backoff when the stream drops. See
//! `SPEC_FULL.md` §4.7.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::wal::error::{Error, Result};
use crate::wal::log::Log;
use crate::wal::replication::pb;

#[derive(Debug, Clone)]
pub struct FollowerOptions {
    pub filtered_streams: Vec<String>,
    pub reconnect_backoff: Duration,
    pub progress_log_interval: Duration,
    pub progress_log_every_n_index: u64,
    /// Set to dial the leader over mutual TLS; `None` dials in plaintext.
    pub tls: Option<ClientTlsConfig>,
}

impl Default for FollowerOptions {
    fn default() -> Self {
        Self {
            filtered_streams: Vec::new(),
            reconnect_backoff: Duration::from_secs(1),
            progress_log_interval: Duration::from_secs(5),
            progress_log_every_n_index: 500,
            tls: None,
        }
    }
}

/// Keeps a local [`Log`] caught up with a remote leader. Entries the leader
/// filtered out of the stream still arrive (as an empty-payload record) so the
/// follower's index space always stays contiguous with the leader's.
pub struct Follower {
    log: Arc<Log>,
    options: FollowerOptions,
    closed: Arc<AtomicBool>,
}

impl Follower {
    pub fn new(log: Arc<Log>, options: FollowerOptions) -> Arc<Self> {
        Arc::new(Self {
            log,
            options,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs until `close()` is called, reconnecting to `endpoint` whenever the
    /// replication stream ends or errors out.
    pub async fn run(self: &Arc<Self>, endpoint: String) {
        while !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.replicate_once(&endpoint).await {
                warn!("wal: follower lost connection to {endpoint}: {e}");
            }
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            tokio::time::sleep(self.options.reconnect_backoff).await;
        }
    }

    async fn dial(&self, endpoint: &str) -> Result<Channel> {
        let mut builder =
            Endpoint::from_shared(endpoint.to_string()).map_err(|e| Error::Transport(e.to_string()))?;
        if let Some(tls) = &self.options.tls {
            builder = builder
                .tls_config(tls.clone())
                .map_err(|e| Error::Transport(e.to_string()))?;
        }
        builder
            .connect()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn replicate_once(&self, endpoint: &str) -> Result<()> {
        let channel = self.dial(endpoint).await?;
        let mut client = pb::replicator_client::ReplicatorClient::new(channel);

        let request = pb::ReplicationRequest {
            last_index: self.log.last_index(),
            filtered_streams: self.options.filtered_streams.clone(),
            limit: 0,
        };
        let mut stream = client
            .begin_replication(request)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .into_inner();

        info!(
            "wal: follower connected to {endpoint} at index {}",
            self.log.last_index()
        );
        let mut last_logged = Instant::now();

        while let Some(batch) = stream
            .message()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
        {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            if batch.entries.is_empty() {
                continue;
            }
            let last_index = batch.entries.last().map(|e| e.index).unwrap_or(0);
            let entries: Vec<(u64, Vec<u8>)> =
                batch.entries.into_iter().map(|e| (e.index, e.data)).collect();
            self.log.write_batch(&entries)?;

            let now = Instant::now();
            if now.duration_since(last_logged) >= self.options.progress_log_interval
                || last_index % self.options.progress_log_every_n_index == 0
            {
                info!("wal: follower caught up to index {last_index}");
                last_logged = now;
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

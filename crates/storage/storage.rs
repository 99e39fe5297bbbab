pub mod metrics;
pub mod ops;

use chrono::Utc;
use ethereum_types::{H256, H512};
use ragno_common::types::{
    AttemptStatus, ConnectionAttempt, DiscoveredRecord, HostInfo, IpInfo, NodeInfo,
    parse_user_agent,
};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use ops::{
    ActivePeersRow, AttemptRow, ChainRow, EnrRow, HostRow, IpInfoRow, NodeInfoRow, StoreOp,
};

/// Aggregate reads scope to nodes seen within this many days.
pub const DEFAULT_ACTIVITY_WINDOW_DAYS: i64 = 180;

const WRITE_CHANNEL_CAPACITY: usize = 4096;
const MAX_BATCH_SIZE: usize = 512;
const BATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const BATCH_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FLUSH_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupted row: {0}")]
    InvalidRow(String),
}

/// Durable catalogue of everything the crawler learns. Writes are batched
/// through a worker pool; reads go straight to the pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    write_tx: mpsc::Sender<StoreOp>,
    writers: TaskTracker,
    shutdown: CancellationToken,
    activity_window_days: i64,
}

impl Store {
    /// Connects, applies pending migrations and spawns the writer pool.
    pub async fn connect(url: &str, persisters: usize) -> Result<Self, StoreError> {
        info!(persisters, "connecting to the database");
        let pool = PgPoolOptions::new()
            .max_connections((persisters + 4) as u32)
            .connect(url)
            .await?;

        info!("applying database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let write_rx = Arc::new(Mutex::new(write_rx));
        let writers = TaskTracker::new();
        let shutdown = CancellationToken::new();

        for writer_id in 0..persisters.max(1) {
            writers.spawn(run_writer(
                writer_id,
                pool.clone(),
                write_rx.clone(),
                shutdown.clone(),
            ));
        }
        writers.close();

        Ok(Self {
            pool,
            write_tx,
            writers,
            shutdown,
            activity_window_days: DEFAULT_ACTIVITY_WINDOW_DAYS,
        })
    }

    pub fn with_activity_window(mut self, days: i64) -> Self {
        self.activity_window_days = days;
        self
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn activity_window_days(&self) -> i64 {
        self.activity_window_days
    }

    /// Flushes the pending batches and closes the pool. Producers must be
    /// stopped before calling this.
    pub async fn shutdown(&self) {
        info!("flushing store write queue");
        self.shutdown.cancel();
        self.writers.wait().await;
        self.pool.close().await;
        info!("store closed");
    }

    async fn enqueue(&self, op: StoreOp) {
        if self.write_tx.send(op).await.is_err() {
            error!("store write channel closed, dropping write");
        }
    }

    /// Upserts a discovered record and makes sure the node has an
    /// identification row waiting for the dialers.
    pub async fn persist_record(&self, record: &DiscoveredRecord) {
        let node = &record.node;
        self.enqueue(StoreOp::UpsertEnr(EnrRow {
            node_id: format!("{:x}", node.node_id()),
            seen_at: record.last_seen,
            ip: node.ip.to_string(),
            tcp: node.tcp_port as i32,
            udp: node.udp_port as i32,
            seq: record.seq as i64,
            pubkey: hex::encode(node.public_key),
            record: record.enr.clone(),
        }))
        .await;
        self.enqueue(StoreOp::EnsureNodeInfo(HostRow {
            node_id: format!("{:x}", node.node_id()),
            pubkey: hex::encode(node.public_key),
            ip: node.ip.to_string(),
            tcp: node.tcp_port as i32,
        }))
        .await;
    }

    /// Records a dial outcome: always the attempt, plus the identification
    /// and chain columns when the dial succeeded.
    pub async fn persist_attempt_and_info(
        &self,
        attempt: &ConnectionAttempt,
        node_info: &NodeInfo,
        same_network: bool,
    ) {
        let node_id = format!("{:x}", attempt.node_id);
        self.enqueue(StoreOp::InsertAttempt(AttemptRow {
            node_id: node_id.clone(),
            timestamp: attempt.timestamp,
            status: attempt.status.as_str().to_string(),
            error: attempt.error.as_str().to_string(),
            latency_ms: attempt.latency.map(|latency| latency.as_millis() as i64),
            deprecable: attempt.deprecable,
        }))
        .await;

        if attempt.status != AttemptStatus::Succeeded {
            return;
        }

        let client = parse_user_agent(&node_info.handshake.client_name);
        self.enqueue(StoreOp::UpsertNodeInfo(NodeInfoRow {
            node_id: node_id.clone(),
            pubkey: hex::encode(node_info.host.public_key),
            ip: node_info.host.ip.to_string(),
            tcp: node_info.host.tcp as i32,
            connected_at: node_info.timestamp,
            raw_user_agent: client.raw,
            client_name: client.name,
            client_raw_version: client.raw_version,
            client_clean_version: client.clean_version,
            client_os: client.os,
            client_arch: client.arch,
            client_language: client.language,
            capabilities: node_info
                .handshake
                .capabilities
                .iter()
                .map(|cap| cap.to_string())
                .collect(),
            software_info: node_info.handshake.software_info as i64,
            // a peer on another network was identified, but is of no use
            deprecated: !same_network,
        }))
        .await;

        if node_info.chain.is_empty() {
            return;
        }
        self.enqueue(StoreOp::UpdateChainDetails(ChainRow {
            node_id,
            fork_id: node_info.chain.fork_id.to_string(),
            protocol_version: node_info.chain.protocol_version as i64,
            head_hash: format!("{:x}", node_info.chain.head_hash),
            network_id: node_info.chain.network_id as i64,
            total_difficulty: node_info.chain.total_difficulty.to_string(),
        }))
        .await;
    }

    pub async fn persist_ip_info(&self, info: IpInfo) {
        let msg = info.msg;
        self.enqueue(StoreOp::UpsertIpInfo(IpInfoRow {
            ip: msg.ip,
            continent: msg.continent,
            continent_code: msg.continent_code,
            country: msg.country,
            country_code: msg.country_code,
            region: msg.region,
            region_name: msg.region_name,
            city: msg.city,
            zip: msg.zip,
            lat: msg.lat,
            lon: msg.lon,
            isp: msg.isp,
            org: msg.org,
            asn: msg.asn,
            asn_name: msg.asn_name,
            mobile: msg.mobile,
            proxy: msg.proxy,
            hosting: msg.hosting,
            expiration_time: info.expiration_time,
        }))
        .await;
    }

    /// Snapshots the ids of the currently active identified nodes.
    pub async fn persist_active_peer_snapshot(&self) -> Result<(), StoreError> {
        let peers = self.get_active_peer_ids().await?;
        if peers.is_empty() {
            debug!("no active peers to snapshot");
            return Ok(());
        }
        debug!(count = peers.len(), "snapshotting active peers");
        self.enqueue(StoreOp::InsertActivePeers(ActivePeersRow {
            timestamp: Utc::now(),
            peers,
        }))
        .await;
        Ok(())
    }

    async fn get_active_peer_ids(&self) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM node_info
            WHERE deprecated = FALSE AND
                first_connected IS NOT NULL AND
                client_name IS NOT NULL AND
                last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            "#,
        )
        .bind(self.activity_window_days)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<i64, _>("id"))
            .collect())
    }

    /// Candidates for the dial queue: everything not deprecated whose
    /// network is either ours or still unknown.
    pub async fn get_non_deprecated_nodes(
        &self,
        network_id: u64,
    ) -> Result<Vec<HostInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT node_id, pubkey, ip, tcp
            FROM node_info
            WHERE deprecated = FALSE AND (network_id = $1 OR network_id IS NULL)
            "#,
        )
        .bind(network_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let node_id: String = row.get("node_id");
                let pubkey: String = row.get("pubkey");
                let ip: String = row.get("ip");
                let tcp: i32 = row.get("tcp");
                Ok(HostInfo {
                    node_id: H256::from_str(&node_id)
                        .map_err(|e| StoreError::InvalidRow(format!("node_id: {e}")))?,
                    public_key: H512::from_str(&pubkey)
                        .map_err(|e| StoreError::InvalidRow(format!("pubkey: {e}")))?,
                    ip: ip
                        .parse()
                        .map_err(|e| StoreError::InvalidRow(format!("ip: {e}")))?,
                    tcp: tcp as u16,
                })
            })
            .collect()
    }

    /// Whether an IP has a record and whether that record expired.
    pub async fn check_ip_records(&self, ip: &str) -> Result<(bool, bool), StoreError> {
        let row = sqlx::query("SELECT expiration_time FROM ip_info WHERE ip = $1")
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok((false, false)),
            Some(row) => {
                let expiration: chrono::DateTime<Utc> = row.get("expiration_time");
                Ok((true, expiration < Utc::now()))
            }
        }
    }
}

/// One writer of the pool: accumulates ops into a batch, flushing on a full
/// batch, on an idle tick with pending work, or on shutdown.
async fn run_writer(
    writer_id: usize,
    pool: PgPool,
    write_rx: Arc<Mutex<mpsc::Receiver<StoreOp>>>,
    shutdown: CancellationToken,
) {
    debug!(writer_id, "store writer started");
    let mut batch: Vec<StoreOp> = Vec::with_capacity(MAX_BATCH_SIZE);
    let mut ticker = tokio::time::interval(BATCH_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            op = recv_next(&write_rx) => {
                match op {
                    Some(op) => {
                        batch.push(op);
                        if batch.len() >= MAX_BATCH_SIZE {
                            flush_batch(writer_id, &pool, &mut batch).await;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    trace!(writer_id, "idle tick, flushing batch");
                    flush_batch(writer_id, &pool, &mut batch).await;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    // drain whatever is still queued, then flush one last time
    loop {
        let op = { write_rx.lock().await.try_recv() };
        match op {
            Ok(op) => {
                batch.push(op);
                if batch.len() >= MAX_BATCH_SIZE {
                    flush_batch(writer_id, &pool, &mut batch).await;
                }
            }
            Err(_) => break,
        }
    }
    flush_batch(writer_id, &pool, &mut batch).await;
    debug!(writer_id, "store writer finished");
}

async fn recv_next(write_rx: &Arc<Mutex<mpsc::Receiver<StoreOp>>>) -> Option<StoreOp> {
    write_rx.lock().await.recv().await
}

/// Executes the whole batch in one transaction. Retried a fixed number of
/// times and then dropped; the pipeline never wedges on a failing flush.
async fn flush_batch(writer_id: usize, pool: &PgPool, batch: &mut Vec<StoreOp>) {
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    for attempt in 1..=MAX_FLUSH_RETRIES {
        match tokio::time::timeout(BATCH_FLUSH_TIMEOUT, persist_batch(pool, batch)).await {
            Ok(Ok(())) => {
                trace!(writer_id, size, "batch persisted");
                batch.clear();
                return;
            }
            Ok(Err(e)) => {
                warn!(writer_id, attempt, err = %e, "batch flush failed");
            }
            Err(_) => {
                warn!(writer_id, attempt, "batch flush timed out");
            }
        }
    }
    error!(writer_id, size, "dropping batch after repeated flush failures");
    batch.clear();
}

async fn persist_batch(pool: &PgPool, batch: &[StoreOp]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for op in batch {
        op.execute(&mut *tx).await?;
    }
    tx.commit().await
}

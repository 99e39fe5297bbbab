pub mod config;
pub mod dial_state;
pub mod discovery;
pub mod ip_locator;
pub mod metrics;
pub mod peering;
pub mod queue;

use chrono::Duration as ChronoDuration;
use ragno_common::types::{ChainStatus, NodeError};
use ragno_p2p::{
    discv4::server::{Discv4Server, DiscoveryError},
    host::Host,
};
use ragno_storage::{Store, StoreError};
use rand::rngs::OsRng;
use secp256k1::SecretKey;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

use crate::{
    config::CrawlerConfig, ip_locator::IpLocator, metrics::Metrics, peering::Peering,
};

pub use config::CrawlerConfig as RunConfig;

pub const CLIENT_VERSION: &str = concat!("ragno/v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("store initialization failed: {0}")]
    Store(#[from] StoreError),
    #[error("discovery initialization failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("invalid bootnode: {0}")]
    Bootnode(#[from] NodeError),
}

/// The assembled crawler: owns every subsystem and tears them down in
/// dependency order.
pub struct Crawler {
    config: CrawlerConfig,
    store: Store,
    host: Arc<Host>,
    peering: Peering,
    locator: IpLocator,
    discovery_token: CancellationToken,
    discovery_tracker: TaskTracker,
    locator_token: CancellationToken,
    locator_tracker: TaskTracker,
    metrics_token: CancellationToken,
    metrics_tracker: TaskTracker,
}

impl Crawler {
    /// Builds every subsystem. Only the store connection and the discovery
    /// socket can fail the process; everything downstream swallows its own
    /// errors.
    pub async fn new(config: CrawlerConfig) -> Result<Self, CrawlerError> {
        let store = Store::connect(&config.db_endpoint, config.persisters).await?;

        // a fresh identity every run
        let signer = SecretKey::new(&mut OsRng);
        let host = Arc::new(Host::new(
            signer,
            CLIENT_VERSION.to_string(),
            config.conn_timeout,
            ChainStatus::mainnet(),
        ));

        let locator_token = CancellationToken::new();
        let locator = IpLocator::new(
            store.clone(),
            config.ip_api_url.clone(),
            locator_token.clone(),
        );

        let peering = Peering::new(
            store.clone(),
            host.clone(),
            locator.clone(),
            config.dialers,
            ChronoDuration::from_std(config.deprecation_time)
                .unwrap_or_else(|_| ChronoDuration::hours(48)),
            CancellationToken::new(),
        );

        Ok(Self {
            config,
            store,
            host,
            peering,
            locator,
            discovery_token: CancellationToken::new(),
            discovery_tracker: TaskTracker::new(),
            locator_token,
            locator_tracker: TaskTracker::new(),
            metrics_token: CancellationToken::new(),
            metrics_tracker: TaskTracker::new(),
        })
    }

    /// Starts every task. Returns once the crawler is running; the caller
    /// decides when to call [`Crawler::close`].
    pub async fn run(&self) -> Result<(), CrawlerError> {
        info!(client = CLIENT_VERSION, "starting ragno");

        // discovery feeds the record consumer, which feeds the store
        let (record_tx, record_rx) = mpsc::channel(discovery::RECORD_CHANNEL_CAPACITY);
        let discovery = Discv4Server::try_new(
            self.config.host_ip,
            self.config.host_port,
            SecretKey::new(&mut OsRng),
            record_tx,
            self.discovery_token.clone(),
        )
        .await?;
        discovery
            .start(discovery::mainnet_bootnodes()?, &self.discovery_tracker)
            .await;
        self.discovery_tracker.spawn(discovery::run_record_consumer(
            self.store.clone(),
            record_rx,
            self.discovery_token.clone(),
        ));
        self.discovery_tracker.close();

        self.locator.start(&self.locator_tracker);
        self.locator_tracker.close();

        self.peering.start().await;

        let metrics = Metrics::new(self.store.clone());
        metrics.start(
            SocketAddr::new(self.config.metrics_ip, self.config.metrics_port),
            self.config.metrics_endpoint.clone(),
            &self.metrics_tracker,
            self.metrics_token.clone(),
        );
        self.metrics_tracker.spawn(run_snapshot_ticker(
            self.store.clone(),
            self.config.snapshot_interval,
            self.metrics_token.clone(),
        ));
        self.metrics_tracker.close();

        info!("ragno is up");
        Ok(())
    }

    /// Leaf-last teardown: stop producing dials, drain the workers, stop the
    /// feeders, then flush the store.
    pub async fn close(&self) {
        info!("closing ragno");

        // 1-3: the orchestrator stops enqueueing, the dial channel closes
        // and the workers drain
        self.peering.stop().await;

        // 4: discovery and the ip locator stop
        self.discovery_token.cancel();
        self.discovery_tracker.wait().await;
        self.locator_token.cancel();
        self.locator_tracker.wait().await;

        // 5: nothing keeps sockets open once the dialers drained; stop the
        // store readers before the flush
        self.metrics_token.cancel();
        self.metrics_tracker.wait().await;

        // 6: flush pending batches and close the pool
        self.store.shutdown().await;

        info!("ragno closing routine done, see you!");
    }

    pub fn host(&self) -> Arc<Host> {
        self.host.clone()
    }
}

/// Records the active-peer set on a fixed interval.
async fn run_snapshot_ticker(
    store: Store,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick fires immediately and would snapshot an empty run
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = store.persist_active_peer_snapshot().await {
                    tracing::warn!(err = %e, "active peer snapshot failed");
                }
            }
        }
    }
}

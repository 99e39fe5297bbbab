use axum::{Router, routing::get};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use ragno_storage::Store;
use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

const NAMESPACE: &str = "crawler";
const UPDATE_INTERVAL: Duration = Duration::from_secs(15);

static CLIENT_DISTRIBUTION: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("client_distribution", "Number of peers per client seen").namespace(NAMESPACE),
        &["client"],
    )
    .expect("Failed to create client_distribution metric")
});

static VERSION_DISTRIBUTION: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "observed_client_version_distribution",
            "Number of peers per client version",
        )
        .namespace(NAMESPACE),
        &["client_version"],
    )
    .expect("Failed to create version_distribution metric")
});

static GEO_DISTRIBUTION: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("geographical_distribution", "Number of peers per country").namespace(NAMESPACE),
        &["country"],
    )
    .expect("Failed to create geo_distribution metric")
});

static OS_DISTRIBUTION: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("os_distribution", "OS distribution of active peers").namespace(NAMESPACE),
        &["os"],
    )
    .expect("Failed to create os_distribution metric")
});

static ARCH_DISTRIBUTION: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "arch_distribution",
            "Architecture distribution of active peers",
        )
        .namespace(NAMESPACE),
        &["arch"],
    )
    .expect("Failed to create arch_distribution metric")
});

static HOSTED_PEERS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "hosted_peers_distribution",
            "Peers hosted on non-residential networks",
        )
        .namespace(NAMESPACE),
        &["ip_host"],
    )
    .expect("Failed to create hosted_peers metric")
});

static IP_DISTRIBUTION: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "observed_ip_distribution",
            "Number of IPs hosting the given number of nodes",
        )
        .namespace(NAMESPACE),
        &["numbernodes"],
    )
    .expect("Failed to create ip_distribution metric")
});

static RTT_DISTRIBUTION: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "observed_rtt_distribution",
            "Handshake round-trip-time buckets",
        )
        .namespace(NAMESPACE),
        &["range"],
    )
    .expect("Failed to create rtt_distribution metric")
});

static DEPRECATED_NODES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::with_opts(
        Opts::new("deprecated_nodes", "Total number of deprecated peers").namespace(NAMESPACE),
    )
    .expect("Failed to create deprecated_nodes metric")
});

static NODE_DISTRIBUTION: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::with_opts(
        Opts::new("node_distribution", "Number of candidate (non-deprecated) nodes")
            .namespace(NAMESPACE),
    )
    .expect("Failed to create node_distribution metric")
});

/// Periodically refreshes the crawler gauges from the store aggregates and
/// serves the scrape endpoint.
pub struct Metrics {
    store: Store,
    registry: Registry,
}

impl Metrics {
    pub fn new(store: Store) -> Self {
        let registry = Registry::new();
        let collectors: [Box<dyn prometheus::core::Collector>; 10] = [
            Box::new(CLIENT_DISTRIBUTION.clone()),
            Box::new(VERSION_DISTRIBUTION.clone()),
            Box::new(GEO_DISTRIBUTION.clone()),
            Box::new(OS_DISTRIBUTION.clone()),
            Box::new(ARCH_DISTRIBUTION.clone()),
            Box::new(HOSTED_PEERS.clone()),
            Box::new(IP_DISTRIBUTION.clone()),
            Box::new(RTT_DISTRIBUTION.clone()),
            Box::new(DEPRECATED_NODES.clone()),
            Box::new(NODE_DISTRIBUTION.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("Failed to register crawler metric");
        }
        Self { store, registry }
    }

    pub fn start(
        &self,
        addr: SocketAddr,
        endpoint: String,
        tracker: &TaskTracker,
        token: CancellationToken,
    ) {
        tracker.spawn(run_update_loop(self.store.clone(), token.clone()));
        tracker.spawn(serve_scrape_endpoint(
            self.registry.clone(),
            addr,
            endpoint,
            token,
        ));
    }
}

async fn run_update_loop(store: Store, token: CancellationToken) {
    let mut ticker = tokio::time::interval(UPDATE_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("metrics update loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = update_gauges(&store).await {
                    warn!(err = %e, "failed to refresh metrics");
                }
            }
        }
    }
}

async fn update_gauges(store: &Store) -> Result<(), ragno_storage::StoreError> {
    for (client, count) in store.get_client_distribution().await? {
        CLIENT_DISTRIBUTION.with_label_values(&[&client]).set(count);
    }
    for (version, count) in store.get_version_distribution().await? {
        VERSION_DISTRIBUTION
            .with_label_values(&[&version])
            .set(count);
    }
    for (country, count) in store.get_geo_distribution().await? {
        GEO_DISTRIBUTION.with_label_values(&[&country]).set(count);
    }
    for (os, count) in store.get_os_distribution().await? {
        OS_DISTRIBUTION.with_label_values(&[&os]).set(count);
    }
    for (arch, count) in store.get_arch_distribution().await? {
        ARCH_DISTRIBUTION.with_label_values(&[&arch]).set(count);
    }
    let hosting = store.get_hosting_distribution().await?;
    HOSTED_PEERS
        .with_label_values(&["mobile_ips"])
        .set(hosting.mobile);
    HOSTED_PEERS
        .with_label_values(&["under_proxy"])
        .set(hosting.under_proxy);
    HOSTED_PEERS
        .with_label_values(&["hosted_ips"])
        .set(hosting.hosted);
    for (nodes_per_ip, count) in store.get_ip_distribution().await? {
        IP_DISTRIBUTION
            .with_label_values(&[&nodes_per_ip])
            .set(count);
    }
    for (range, count) in store.get_rtt_distribution().await? {
        RTT_DISTRIBUTION.with_label_values(&[&range]).set(count);
    }
    DEPRECATED_NODES.set(store.get_deprecated_count().await?);
    NODE_DISTRIBUTION.set(store.get_non_deprecated_count().await?);
    Ok(())
}

async fn serve_scrape_endpoint(
    registry: Registry,
    addr: SocketAddr,
    endpoint: String,
    token: CancellationToken,
) {
    let endpoint = if endpoint.starts_with('/') {
        endpoint
    } else {
        format!("/{endpoint}")
    };
    let app = Router::new()
        .route(
            &endpoint,
            get(move || {
                let registry = registry.clone();
                async move { gather_metrics(&registry) }
            }),
        )
        .route("/health", get(|| async { "Service Up" }));

    info!(%addr, endpoint, "starting metrics server");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(err = %e, "could not bind the metrics endpoint");
            return;
        }
    };
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await });
    if let Err(e) = served.await {
        error!(err = %e, "metrics server stopped with an error");
    }
}

fn gather_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(err = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

use clap::{Parser, Subcommand};
use ragno_common::types::{ChainStatus, ErrorKind, HostInfo, Node};
use ragno_crawler::{
    CLIENT_VERSION, Crawler,
    config::{
        CrawlerConfig, DEFAULT_DB_ENDPOINT, DEFAULT_DIALERS, DEFAULT_HOST_IP, DEFAULT_HOST_PORT,
        DEFAULT_METRICS_ENDPOINT, DEFAULT_METRICS_IP, DEFAULT_METRICS_PORT, DEFAULT_PERSISTERS,
    },
    discovery::mainnet_bootnodes,
    ip_locator::DEFAULT_IP_API_URL,
};
use ragno_p2p::{discv4::server::Discv4Server, host::Host};
use rand::rngs::OsRng;
use secp256k1::SecretKey;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, filter::Directive};

use crate::export::RecordSet;

#[derive(Parser)]
#[command(
    name = "ragno",
    version,
    about = "Ethereum execution-layer p2p network crawler"
)]
pub struct CLI {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full crawler: discovery, dialing and persistence.
    Run(RunOptions),
    /// Dial a single node and print what its handshake reveals.
    Connect(ConnectOptions),
    /// Run discovery only, flushing the found records to a CSV file.
    Discv4(Discv4Options),
}

#[derive(Parser)]
struct RunOptions {
    #[arg(long = "log-level", env = "RAGNO_LOG_LEVEL", default_value = "info")]
    log_level: Level,
    #[arg(
        long = "db-endpoint",
        env = "RAGNO_DB_ENDPOINT",
        default_value = DEFAULT_DB_ENDPOINT,
        help = "Endpoint of the postgres database where crawl results are stored"
    )]
    db_endpoint: String,
    #[arg(long = "ip", env = "RAGNO_HOST_IP", default_value = DEFAULT_HOST_IP)]
    ip: IpAddr,
    #[arg(long = "port", env = "RAGNO_HOST_PORT", default_value_t = DEFAULT_HOST_PORT)]
    port: u16,
    #[arg(long = "metrics-ip", env = "RAGNO_METRICS_IP", default_value = DEFAULT_METRICS_IP)]
    metrics_ip: IpAddr,
    #[arg(
        long = "metrics-port",
        env = "RAGNO_METRICS_PORT",
        default_value_t = DEFAULT_METRICS_PORT
    )]
    metrics_port: u16,
    #[arg(
        long = "metrics-endpoint",
        env = "RAGNO_METRICS_ENDPOINT",
        default_value = DEFAULT_METRICS_ENDPOINT
    )]
    metrics_endpoint: String,
    #[arg(long = "dialers", env = "RAGNO_DIALERS", default_value_t = DEFAULT_DIALERS)]
    dialers: usize,
    #[arg(
        long = "persisters",
        env = "RAGNO_PERSISTERS",
        default_value_t = DEFAULT_PERSISTERS
    )]
    persisters: usize,
    #[arg(
        long = "conn-timeout",
        env = "RAGNO_CONN_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    conn_timeout: Duration,
    #[arg(
        long = "snapshot-interval",
        env = "RAGNO_SNAPSHOT_INTERVAL",
        default_value = "10m",
        value_parser = humantime::parse_duration
    )]
    snapshot_interval: Duration,
    #[arg(long = "ip-api-url", env = "RAGNO_IP_API_URL", default_value = DEFAULT_IP_API_URL)]
    ip_api_url: String,
    #[arg(
        long = "deprecation-time",
        env = "RAGNO_DEPRECATION_TIME",
        default_value = "48h",
        value_parser = humantime::parse_duration,
        help = "How long a failure streak lasts before a node is deprecated"
    )]
    deprecation_time: Duration,
}

#[derive(Parser)]
struct ConnectOptions {
    #[arg(long = "enr", help = "Node to dial, as an enode:// or enr: URL")]
    enr: String,
    #[arg(long = "host-ip", help = "Override the IP carried in the record")]
    host_ip: Option<IpAddr>,
    #[arg(long = "host-port", help = "Override the TCP port carried in the record")]
    host_port: Option<u16>,
    #[arg(
        long = "conn-timeout",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    conn_timeout: Duration,
    #[arg(long = "log-level", env = "RAGNO_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

#[derive(Parser)]
struct Discv4Options {
    #[arg(long = "port", env = "RAGNO_HOST_PORT", default_value_t = DEFAULT_HOST_PORT)]
    port: u16,
    #[arg(long = "output", help = "CSV file the record set is flushed to")]
    output: PathBuf,
    #[arg(long = "log-level", env = "RAGNO_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

pub async fn run(cli: CLI) -> eyre::Result<()> {
    match cli.command {
        Command::Run(opts) => run_crawler(opts).await,
        Command::Connect(opts) => connect_node(opts).await,
        Command::Discv4(opts) => run_discv4(opts).await,
    }
}

fn init_tracing(log_level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(Directive::from(log_level))
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The store endpoint can also come in pieces through the conventional
/// `POSTGRES_*` variables; an explicit flag or `RAGNO_DB_ENDPOINT` wins.
fn resolve_db_endpoint(flag_value: String) -> String {
    if flag_value != DEFAULT_DB_ENDPOINT {
        return flag_value;
    }
    let Ok(host) = std::env::var("POSTGRES_HOST") else {
        return flag_value;
    };
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "ragno".to_string());
    format!("postgresql://{user}:{password}@{host}:{port}/{db}")
}

async fn run_crawler(opts: RunOptions) -> eyre::Result<()> {
    init_tracing(opts.log_level);

    let config = CrawlerConfig {
        db_endpoint: resolve_db_endpoint(opts.db_endpoint),
        host_ip: opts.ip,
        host_port: opts.port,
        metrics_ip: opts.metrics_ip,
        metrics_port: opts.metrics_port,
        metrics_endpoint: opts.metrics_endpoint,
        dialers: opts.dialers,
        persisters: opts.persisters,
        conn_timeout: opts.conn_timeout,
        snapshot_interval: opts.snapshot_interval,
        ip_api_url: opts.ip_api_url,
        deprecation_time: opts.deprecation_time,
    };

    let crawler = Crawler::new(config).await?;
    crawler.run().await?;

    wait_for_shutdown_signal().await;
    crawler.close().await;
    Ok(())
}

/// Dials once and prints the outcome. The process exits 0 even when the
/// dial fails; the failure itself is the answer.
async fn connect_node(opts: ConnectOptions) -> eyre::Result<()> {
    init_tracing(opts.log_level);

    let node = Node::from_str(&opts.enr)?;
    let mut host_info = HostInfo::from_node(&node);
    if let Some(ip) = opts.host_ip {
        host_info.ip = ip;
    }
    if let Some(port) = opts.host_port {
        host_info.tcp = port;
    }

    let host = Host::new(
        SecretKey::new(&mut OsRng),
        CLIENT_VERSION.to_string(),
        opts.conn_timeout,
        ChainStatus::mainnet(),
    );

    println!("dialing {}:{} ...", host_info.ip, host_info.tcp);
    match host.connect(&host_info).await {
        Ok((details, chain, rtt)) => {
            println!("connection succeeded in {} ms", rtt.as_millis());
            println!("  client:       {}", details.client_name);
            println!(
                "  capabilities: {}",
                details
                    .capabilities
                    .iter()
                    .map(|cap| cap.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!("  eth version:  {}", details.negotiated_eth_version);
            if chain.is_empty() {
                println!("  chain:        no status exchanged");
            } else {
                println!("  network id:   {}", chain.network_id);
                println!("  fork id:      {}", chain.fork_id);
                println!("  head hash:    {:#x}", chain.head_hash);
                println!("  difficulty:   {}", chain.total_difficulty);
            }
        }
        Err(error) => {
            println!("connection failed: {error}");
            println!("  classified as: {}", ErrorKind::classify(&error.to_string()));
        }
    }
    Ok(())
}

/// Discovery-only mode: collect records and dump them to CSV every 10 s.
async fn run_discv4(opts: Discv4Options) -> eyre::Result<()> {
    init_tracing(opts.log_level);

    const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (record_tx, mut record_rx) = mpsc::channel(256);

    let discovery = Discv4Server::try_new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        opts.port,
        SecretKey::new(&mut OsRng),
        record_tx,
        token.clone(),
    )
    .await?;
    discovery.start(mainnet_bootnodes()?, &tracker).await;
    tracker.close();

    let mut records = RecordSet::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            record = record_rx.recv() => {
                match record {
                    Some(record) => records.insert(record),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                records.flush_csv(&opts.output)?;
                info!(records = records.len(), output = %opts.output.display(), "record set flushed");
            }
        }
    }

    token.cancel();
    tracker.wait().await;
    records.flush_csv(&opts.output)?;
    info!(records = records.len(), "final record set flushed");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(err = %e, "could not install the SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, stopping ragno with control"),
        _ = sigterm.recv() => info!("received SIGTERM, stopping ragno with control"),
    }
}

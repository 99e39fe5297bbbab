use chrono::Duration as ChronoDuration;
use ragno_common::types::{ConnectionAttempt, ErrorKind, HostInfo, NodeInfo, is_ip_public};
use ragno_p2p::host::Host;
use ragno_storage::Store;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{ip_locator::IpLocator, queue::NodeOrderedSet};

/// Grace period before the first store reload and between reload cycles.
const INIT_DELAY: Duration = Duration::from_secs(2);

/// The dial channel stays tiny so the orchestrator blocks as soon as every
/// dialer is busy.
const DIAL_CHANNEL_CAPACITY: usize = 1;

/// The peering engine: one orchestrator feeding a pool of dial workers from
/// the node queue.
pub struct Peering {
    store: Store,
    host: Arc<Host>,
    locator: IpLocator,
    queue: Arc<NodeOrderedSet>,
    dialers: usize,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Peering {
    pub fn new(
        store: Store,
        host: Arc<Host>,
        locator: IpLocator,
        dialers: usize,
        deprecation_window: ChronoDuration,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            host,
            locator,
            queue: Arc::new(NodeOrderedSet::new(deprecation_window)),
            dialers,
            token,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns the dial workers and the orchestrator.
    pub async fn start(&self) {
        info!(dialers = self.dialers, "running peering service");
        let (dial_tx, dial_rx) = mpsc::channel::<HostInfo>(DIAL_CHANNEL_CAPACITY);
        let dial_rx = Arc::new(Mutex::new(dial_rx));

        for worker_id in 0..self.dialers {
            self.tracker.spawn(run_dial_worker(
                worker_id,
                self.host.clone(),
                self.store.clone(),
                self.locator.clone(),
                self.queue.clone(),
                dial_rx.clone(),
                self.token.clone(),
            ));
        }
        self.tracker.spawn(run_orchestrator(
            self.store.clone(),
            self.host.clone(),
            self.queue.clone(),
            dial_tx,
            self.token.clone(),
        ));
        self.tracker.close();
    }

    /// Stops enqueueing, lets in-flight dials finish and joins every task.
    pub async fn stop(&self) {
        info!("stopping peering service");
        self.token.cancel();
        self.tracker.wait().await;
        info!("peering service stopped");
    }
}

/// Reloads candidates from the store, walks the ready nodes and pushes them
/// to the dialers, then sleeps and repeats.
async fn run_orchestrator(
    store: Store,
    host: Arc<Host>,
    queue: Arc<NodeOrderedSet>,
    dial_tx: mpsc::Sender<HostInfo>,
    token: CancellationToken,
) {
    info!("spawning peering orchestrator");
    let network_id = host.local_status().await.network_id;
    // node-ids already sent to the dialers in the current cycle
    let mut dialed: HashSet<ethereum_types::H256> = HashSet::new();

    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(INIT_DELAY) => {}
    }
    reload_queue(&store, &queue, network_id).await;

    loop {
        if token.is_cancelled() {
            break;
        }
        match queue.next_ready() {
            Some(host_info) => {
                if !dialed.insert(host_info.node_id) {
                    continue;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = dial_tx.send(host_info) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(INIT_DELAY) => {}
                }
                reload_queue(&store, &queue, network_id).await;
                dialed.clear();
            }
        }
    }
    info!("closing peering orchestrator");
}

/// A failed read leaves the queue as it is; the next reload cycle retries.
async fn reload_queue(store: &Store, queue: &NodeOrderedSet, network_id: u64) {
    match store.get_non_deprecated_nodes(network_id).await {
        Ok(candidates) => queue.merge_from_store(candidates),
        Err(e) => warn!(err = %e, "unable to load the candidate set from the store"),
    }
}

async fn run_dial_worker(
    worker_id: usize,
    host: Arc<Host>,
    store: Store,
    locator: IpLocator,
    queue: Arc<NodeOrderedSet>,
    dial_rx: Arc<Mutex<mpsc::Receiver<HostInfo>>>,
    token: CancellationToken,
) {
    debug!(worker_id, "spawning peering dialer");
    loop {
        let host_info = tokio::select! {
            _ = token.cancelled() => break,
            received = recv_next(&dial_rx) => match received {
                Some(host_info) => host_info,
                None => break,
            }
        };
        connect_node(&host, &store, &locator, &queue, host_info).await;
    }
    debug!(worker_id, "closing peering dialer");
}

async fn recv_next(dial_rx: &Arc<Mutex<mpsc::Receiver<HostInfo>>>) -> Option<HostInfo> {
    dial_rx.lock().await.recv().await
}

/// One full dial: handshake, queue bookkeeping, persistence and the
/// geolocation side request. Dial errors stop here.
async fn connect_node(
    host: &Host,
    store: &Store,
    locator: &IpLocator,
    queue: &NodeOrderedSet,
    host_info: HostInfo,
) {
    let node_id = host_info.node_id;
    debug!(node = %format!("{node_id:#x}"), "dialing node");

    let mut node_info = NodeInfo::new(host_info.clone());
    let local_network_id = host.local_status().await.network_id;

    let (mut attempt, same_network) = match host.connect(&host_info).await {
        Ok((details, chain, rtt)) => {
            info!(
                node = %format!("{node_id:#x}"),
                client = %details.client_name,
                network = chain.network_id,
                eth_version = details.negotiated_eth_version,
                rtt_ms = rtt.as_millis() as u64,
                "successful connection"
            );
            // a peer that never exchanged status gets the benefit of the
            // doubt; only a reported foreign network deprecates it
            let same_network =
                chain.is_empty() || chain.network_id == local_network_id;
            node_info.handshake = details;
            node_info.chain = chain;
            (ConnectionAttempt::succeeded(node_id, rtt), same_network)
        }
        Err(error) => {
            let kind = ErrorKind::classify(&error.to_string());
            debug!(
                node = %format!("{node_id:#x}"),
                error = %error,
                kind = %kind,
                "failed connection"
            );
            (ConnectionAttempt::failed(node_id, kind), true)
        }
    };

    queue.update_from_attempt(node_id, &mut attempt, same_network);
    store
        .persist_attempt_and_info(&attempt, &node_info, same_network)
        .await;

    if is_ip_public(&host_info.ip) {
        locator.request(host_info.ip).await;
    }
}

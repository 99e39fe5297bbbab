use ragno_common::types::{DiscoveredRecord, MAINNET_BOOTNODES, Node, NodeError};
use ragno_storage::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How many records may sit between discovery and the store consumer.
pub const RECORD_CHANNEL_CAPACITY: usize = 256;

pub fn mainnet_bootnodes() -> Result<Vec<Node>, NodeError> {
    MAINNET_BOOTNODES
        .iter()
        .map(|url| Node::from_enode_url(url))
        .collect()
}

/// Drains the discovery record stream into the store. Ends when discovery
/// drops its sender or on cancellation.
pub async fn run_record_consumer(
    store: Store,
    mut record_rx: mpsc::Receiver<DiscoveredRecord>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            record = record_rx.recv() => {
                let Some(record) = record else {
                    break;
                };
                trace!(node = %record.node, seq = record.seq, "persisting discovered record");
                store.persist_record(&record).await;
            }
        }
    }
    debug!("record consumer finished");
}

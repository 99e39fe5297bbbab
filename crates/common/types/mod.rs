mod attempt;
mod capability;
mod chain;
mod client_version;
mod dial_error;
mod fork_id;
mod ip_info;
mod node;
mod node_info;

pub use attempt::{AttemptStatus, ConnectionAttempt};
pub use capability::Capability;
pub use chain::{
    ChainStatus, MAINNET_BOOTNODES, MAINNET_GENESIS_HASH, MAINNET_NETWORK_ID, mainnet_fork_id,
};
pub use client_version::{ClientInfo, parse_user_agent};
pub use dial_error::ErrorKind;
pub use fork_id::ForkId;
pub use ip_info::{IP_INFO_TTL, IpApiMsg, IpInfo, is_ip_public};
pub use node::{
    DiscoveredRecord, Endpoint, Node, NodeError, NodeRecord, NodeRecordPairs, node_id,
    public_key_from_secret_key,
};
pub use node_info::{ChainDetails, HandshakeDetails, HostInfo, NodeInfo};

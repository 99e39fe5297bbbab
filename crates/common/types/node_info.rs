use chrono::{DateTime, Utc};
use ethereum_types::{H256, H512, U256};
use std::net::IpAddr;

use super::{capability::Capability, fork_id::ForkId, node::Node};

/// The minimum tuple needed to dial a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub node_id: H256,
    pub public_key: H512,
    pub ip: IpAddr,
    pub tcp: u16,
}

impl HostInfo {
    pub fn from_node(node: &Node) -> Self {
        Self {
            node_id: node.node_id(),
            public_key: node.public_key,
            ip: node.ip,
            tcp: node.tcp_port,
        }
    }

    pub fn tcp_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.tcp)
    }
}

/// What the capability (`hello`) handshake reveals about a peer.
#[derive(Debug, Clone, Default)]
pub struct HandshakeDetails {
    pub client_name: String,
    /// The remote's base-protocol version from the hello message.
    pub software_info: u64,
    pub capabilities: Vec<Capability>,
    /// Highest eth version both sides support; 0 when there is none.
    pub negotiated_eth_version: u8,
}

/// What the `status` exchange reveals about a peer's chain.
/// `network_id == 0` means the exchange never happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainDetails {
    pub fork_id: ForkId,
    pub protocol_version: u32,
    pub head_hash: H256,
    pub network_id: u64,
    pub total_difficulty: U256,
}

impl ChainDetails {
    pub fn is_empty(&self) -> bool {
        self.network_id == 0
    }
}

/// Everything learned about an identified node, populated on successful
/// attempts only.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub timestamp: DateTime<Utc>,
    pub host: HostInfo,
    pub handshake: HandshakeDetails,
    pub chain: ChainDetails,
}

impl NodeInfo {
    pub fn new(host: HostInfo) -> Self {
        Self {
            timestamp: Utc::now(),
            host,
            handshake: HandshakeDetails::default(),
            chain: ChainDetails::default(),
        }
    }

    pub fn node_id(&self) -> H256 {
        self.host.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_details() {
        assert!(ChainDetails::default().is_empty());
        let filled = ChainDetails {
            network_id: 1,
            ..Default::default()
        };
        assert!(!filled.is_empty());
    }
}

use ethereum_types::{H256, U256};
use hex_literal::hex;

use super::fork_id::ForkId;

pub const MAINNET_NETWORK_ID: u64 = 1;

pub const MAINNET_GENESIS_HASH: H256 = H256(hex!(
    "d4e56740f876aef8c010b86a40d5f56745a21dca8ca59adbf6aada33d8f8b163"
));

/// Block-number activated mainnet forks, Homestead through Gray Glacier.
const MAINNET_BLOCK_FORKS: &[u64] = &[
    1_150_000,  // Homestead
    1_920_000,  // DAO
    2_463_000,  // Tangerine Whistle
    2_675_000,  // Spurious Dragon
    4_370_000,  // Byzantium
    7_280_000,  // Constantinople & Petersburg
    9_069_000,  // Istanbul
    9_200_000,  // Muir Glacier
    12_244_000, // Berlin
    12_965_000, // London
    13_773_000, // Arrow Glacier
    15_050_000, // Gray Glacier
];

/// Timestamp activated mainnet forks, Shanghai onwards.
const MAINNET_TIME_FORKS: &[u64] = &[
    1_681_338_455, // Shanghai
    1_710_338_135, // Cancun
    1_746_612_311, // Prague
];

pub const MAINNET_BOOTNODES: &[&str] = &[
    "enode://d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666@18.138.108.67:30303",
    "enode://22a8232c3abc76a16ae9d6c3b164f98775fe226f0917b0ca871128a74a8e9630b458460865bab457221f1d448dd9791d24c4e5d88786180ac185df813a68d4de@3.209.45.79:30303",
    "enode://2b252ab6a1d0f971d9722cb839a42cb81db019ba44c08754628ab4a823487071b5695317c8ccd085219c3a03af063495b2f1da8d18218da2d6a82981b45e6ffc@65.108.70.101:30303",
    "enode://4aeb4ab6c14b23e2c4cfdce879c04b0748a20d8e9b59e25ded2a08143e265c6c25936e74cbc8e641e3312ca288673d91f2f93f8e277de3cfa444ecdaaf982052@157.90.35.166:30303",
];

/// The chain-status tuple the host advertises in `eth` status messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatus {
    pub network_id: u64,
    pub total_difficulty: U256,
    pub head_hash: H256,
    pub genesis_hash: H256,
    pub fork_id: ForkId,
}

impl ChainStatus {
    /// Mainnet status anchored at the genesis block: the crawler never
    /// follows the chain, so it presents itself as a freshly synced node.
    pub fn mainnet() -> Self {
        Self {
            network_id: MAINNET_NETWORK_ID,
            total_difficulty: U256::zero(),
            head_hash: MAINNET_GENESIS_HASH,
            genesis_hash: MAINNET_GENESIS_HASH,
            fork_id: mainnet_fork_id(0, 0),
        }
    }
}

/// Mainnet fork id for a head at the given block number and timestamp.
pub fn mainnet_fork_id(head_block_number: u64, head_timestamp: u64) -> ForkId {
    ForkId::compute(
        MAINNET_GENESIS_HASH,
        MAINNET_BLOCK_FORKS,
        MAINNET_TIME_FORKS,
        head_block_number,
        head_timestamp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H32;
    use std::str::FromStr;

    // Vectors from the EIP-2124 reference table for mainnet.
    #[test]
    fn mainnet_fork_id_at_genesis() {
        let fork_id = mainnet_fork_id(0, 0);
        assert_eq!(fork_id.fork_hash, H32::from_str("0xfc64ec04").unwrap());
        assert_eq!(fork_id.fork_next, 1_150_000);
    }

    #[test]
    fn mainnet_fork_id_at_homestead() {
        let fork_id = mainnet_fork_id(1_150_000, 0);
        assert_eq!(fork_id.fork_hash, H32::from_str("0x97c2c34c").unwrap());
        assert_eq!(fork_id.fork_next, 1_920_000);
    }

    #[test]
    fn mainnet_fork_id_after_gray_glacier() {
        let fork_id = mainnet_fork_id(15_050_000, 0);
        assert_eq!(fork_id.fork_hash, H32::from_str("0xf0afd0e3").unwrap());
        assert_eq!(fork_id.fork_next, 1_681_338_455);
    }

    #[test]
    fn bootnodes_parse() {
        for bootnode in MAINNET_BOOTNODES {
            super::super::node::Node::from_enode_url(bootnode).unwrap();
        }
    }
}

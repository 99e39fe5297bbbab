use bytes::BufMut;
use ethereum_types::{H256, U256};
use ragno_common::types::{ChainDetails, ChainStatus, ForkId};
use ragno_rlp::{
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use crate::utils::{snappy_compress, snappy_decompress};

use super::message::RLPxMessage;

/// The eth `status` handshake message.
/// https://github.com/ethereum/devp2p/blob/master/caps/eth.md#status-0x00
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub eth_version: u32,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub block_hash: H256,
    pub genesis: H256,
    pub fork_id: ForkId,
}

impl StatusMessage {
    pub fn from_status(status: &ChainStatus, eth_version: u32) -> Self {
        Self {
            eth_version,
            network_id: status.network_id,
            total_difficulty: status.total_difficulty,
            block_hash: status.head_hash,
            genesis: status.genesis_hash,
            fork_id: status.fork_id,
        }
    }

    pub fn chain_details(&self) -> ChainDetails {
        ChainDetails {
            fork_id: self.fork_id,
            protocol_version: self.eth_version,
            head_hash: self.block_hash,
            network_id: self.network_id,
            total_difficulty: self.total_difficulty,
        }
    }
}

impl RLPxMessage for StatusMessage {
    const CODE: u8 = 0x00;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        let mut encoded_data = vec![];
        Encoder::new(&mut encoded_data)
            .encode_field(&self.eth_version)
            .encode_field(&self.network_id)
            .encode_field(&self.total_difficulty)
            .encode_field(&self.block_hash)
            .encode_field(&self.genesis)
            .encode_field(&self.fork_id)
            .finish();

        let msg_data = snappy_compress(encoded_data)?;
        buf.put_slice(&msg_data);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decompressed_data = snappy_decompress(msg_data)?;
        let decoder = Decoder::new(&decompressed_data)?;
        let (eth_version, decoder): (u32, _) = decoder.decode_field("protocolVersion")?;
        let (network_id, decoder): (u64, _) = decoder.decode_field("networkId")?;
        let (total_difficulty, decoder): (U256, _) = decoder.decode_field("totalDifficulty")?;
        let (block_hash, decoder): (H256, _) = decoder.decode_field("blockHash")?;
        let (genesis, decoder): (H256, _) = decoder.decode_field("genesis")?;
        let (fork_id, decoder): (ForkId, _) = decoder.decode_field("forkId")?;
        // implementations must ignore any additional list elements
        decoder.finish_unchecked();

        Ok(Self {
            eth_version,
            network_id,
            total_difficulty,
            block_hash,
            genesis,
            fork_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragno_common::types::MAINNET_GENESIS_HASH;

    #[test]
    fn status_roundtrip() {
        let status = StatusMessage::from_status(&ChainStatus::mainnet(), 68);
        let mut buf = Vec::new();
        status.encode(&mut buf).unwrap();
        let decoded = StatusMessage::decode(&buf).unwrap();
        assert_eq!(decoded, status);
        assert_eq!(decoded.network_id, 1);
        assert_eq!(decoded.genesis, MAINNET_GENESIS_HASH);
    }

    #[test]
    fn chain_details_from_status() {
        let status = StatusMessage {
            eth_version: 68,
            network_id: 1,
            total_difficulty: U256::one(),
            block_hash: MAINNET_GENESIS_HASH,
            genesis: MAINNET_GENESIS_HASH,
            fork_id: ForkId::default(),
        };
        let details = status.chain_details();
        assert!(!details.is_empty());
        assert_eq!(details.protocol_version, 68);
    }
}

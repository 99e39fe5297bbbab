use crc32fast::Hasher;
use ethereum_types::{H32, H256};
use ragno_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

/// EIP-2124 fork identifier: a checksum of the fork activations a node has
/// passed plus the next activation it knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForkId {
    pub fork_hash: H32,
    pub fork_next: u64,
}

impl ForkId {
    /// Computes the fork id for a head at the given block number/timestamp.
    /// `block_forks` and `time_forks` are the chain's activation points in
    /// ascending order.
    pub fn compute(
        genesis_hash: H256,
        block_forks: &[u64],
        time_forks: &[u64],
        head_block_number: u64,
        head_timestamp: u64,
    ) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(genesis_hash.as_bytes());

        let fork_next = update_checksum(block_forks, &mut hasher, head_block_number);
        if fork_next > 0 {
            return Self {
                fork_hash: H32::from_slice(&hasher.finalize().to_be_bytes()),
                fork_next,
            };
        }
        let fork_next = update_checksum(time_forks, &mut hasher, head_timestamp);

        Self {
            fork_hash: H32::from_slice(&hasher.finalize().to_be_bytes()),
            fork_next,
        }
    }
}

fn update_checksum(forks: &[u64], hasher: &mut Hasher, head: u64) -> u64 {
    let mut last_included = 0;

    for activation in forks.iter().copied() {
        if activation > head {
            // fork_next found
            return activation;
        }
        if activation != last_included {
            hasher.update(&activation.to_be_bytes());
            last_included = activation;
        }
    }
    0
}

impl std::fmt::Display for ForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}/{}", self.fork_hash, self.fork_next)
    }
}

impl RLPEncode for ForkId {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.fork_hash)
            .encode_field(&self.fork_next)
            .finish();
    }
}

impl RLPDecode for ForkId {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (fork_hash, decoder) = decoder.decode_field("forkHash")?;
        let (fork_next, decoder) = decoder.decode_field("forkNext")?;
        let remaining = decoder.finish()?;
        Ok((
            ForkId {
                fork_hash,
                fork_next,
            },
            remaining,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::str::FromStr;

    #[test]
    fn encode_fork_id() {
        let fork = ForkId {
            fork_hash: H32::zero(),
            fork_next: 0,
        };
        assert_eq!(fork.encode_to_vec(), hex!("c6840000000080"));
    }

    #[test]
    fn encode_fork_id_with_next() {
        let fork = ForkId {
            fork_hash: H32::from_str("0xdeadbeef").unwrap(),
            fork_next: u64::from_str_radix("baddcafe", 16).unwrap(),
        };
        assert_eq!(fork.encode_to_vec(), hex!("ca84deadbeef84baddcafe"));
    }

    #[test]
    fn roundtrip() {
        let fork = ForkId {
            fork_hash: H32::from_low_u64_be(0xfc64ec04),
            fork_next: 1_150_000,
        };
        let encoded = fork.encode_to_vec();
        assert_eq!(ForkId::decode(&encoded).unwrap(), fork);
    }
}

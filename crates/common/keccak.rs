use ethereum_types::H256;
use sha3::{Digest, Keccak256};

pub fn keccak_hash(data: impl AsRef<[u8]>) -> [u8; 32] {
    Keccak256::digest(data.as_ref()).into()
}

pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256(keccak_hash(data))
}

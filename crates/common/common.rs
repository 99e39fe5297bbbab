pub mod base64;
pub mod keccak;
pub mod types;

pub use ethereum_types::{H32, H256, H264, H512, U256};

pub(crate) mod crypto;
pub mod error;
pub mod eth;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod p2p;

use ragno_rlp::error::{RLPDecodeError, RLPEncodeError};
use thiserror::Error;

use super::p2p::DisconnectReason;

#[derive(Debug, Error)]
pub enum RLPxError {
    #[error("bad handshake: {0}")]
    HandshakeError(String),
    #[error("cryptography error: {0}")]
    CryptographyError(String),
    #[error("invalid frame mac")]
    InvalidMac,
    #[error("invalid message length")]
    InvalidMessageLength,
    #[error("disconnect received: {0}")]
    DisconnectReceived(DisconnectReason),
    #[error("disconnect received during hello: {0}")]
    HelloDisconnect(DisconnectReason),
    /// The remote rejected the status exchange with a disconnect.
    #[error("bad status handshake code: 2: {0}")]
    StatusDisconnect(DisconnectReason),
    #[error("unexpected message: {0}")]
    MessageNotHandled(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("connection closed by remote (EOF)")]
    Disconnected,
    #[error("RLP decode error: {0}")]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("RLP encode error: {0}")]
    RLPEncodeError(#[from] RLPEncodeError),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

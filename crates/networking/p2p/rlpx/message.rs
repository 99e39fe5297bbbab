use bytes::BufMut;
use ragno_rlp::{
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
};
use std::fmt::Display;

use super::eth::StatusMessage;
use super::p2p::{DisconnectMessage, HelloMessage, PingMessage, PongMessage};

/// Message ids below this belong to the base protocol; the eth capability
/// starts right after it.
const ETH_CAPABILITY_OFFSET: u8 = 0x10;

pub trait RLPxMessage: Sized {
    const CODE: u8;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError>;

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError>;
}

/// The subset of devp2p traffic a crawler speaks: the base protocol plus the
/// eth status handshake.
#[derive(Debug)]
pub enum Message {
    Hello(HelloMessage),
    Disconnect(DisconnectMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    Status(StatusMessage),
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Hello(_) => HelloMessage::CODE,
            Message::Disconnect(_) => DisconnectMessage::CODE,
            Message::Ping(_) => PingMessage::CODE,
            Message::Pong(_) => PongMessage::CODE,
            Message::Status(_) => ETH_CAPABILITY_OFFSET + StatusMessage::CODE,
        }
    }

    pub fn decode(msg_id: u8, data: &[u8]) -> Result<Message, RLPDecodeError> {
        match msg_id {
            HelloMessage::CODE => Ok(Message::Hello(HelloMessage::decode(data)?)),
            DisconnectMessage::CODE => Ok(Message::Disconnect(DisconnectMessage::decode(data)?)),
            PingMessage::CODE => Ok(Message::Ping(PingMessage::decode(data)?)),
            PongMessage::CODE => Ok(Message::Pong(PongMessage::decode(data)?)),
            id if id == ETH_CAPABILITY_OFFSET + StatusMessage::CODE => {
                Ok(Message::Status(StatusMessage::decode(data)?))
            }
            id => Err(RLPDecodeError::Custom(format!(
                "unknown message id {id:#x}"
            ))),
        }
    }

    pub fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        self.code().encode(buf);
        match self {
            Message::Hello(msg) => msg.encode(buf),
            Message::Disconnect(msg) => msg.encode(buf),
            Message::Ping(msg) => msg.encode(buf),
            Message::Pong(msg) => msg.encode(buf),
            Message::Status(msg) => msg.encode(buf),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Hello(_) => "p2p:Hello".fmt(f),
            Message::Disconnect(_) => "p2p:Disconnect".fmt(f),
            Message::Ping(_) => "p2p:Ping".fmt(f),
            Message::Pong(_) => "p2p:Pong".fmt(f),
            Message::Status(_) => "eth:Status".fmt(f),
        }
    }
}

use bytes::BufMut;
use ethereum_types::H512;
use ragno_common::types::Capability;
use ragno_rlp::{
    decode::{RLPDecode, decode_rlp_item},
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};
use secp256k1::PublicKey;

use crate::utils::{compress_pubkey, decompress_pubkey, snappy_compress, snappy_decompress};

use super::message::RLPxMessage;

/// Base-protocol version we advertise in the hello message.
pub const SUPPORTED_P2P_VERSION: u64 = 5;

/// Capabilities offered on every dial.
pub fn supported_eth_capabilities() -> Vec<Capability> {
    vec![Capability::eth(66), Capability::eth(67), Capability::eth(68)]
}

#[derive(Debug, Clone)]
pub struct HelloMessage {
    /// The base-protocol version the remote speaks.
    pub protocol_version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub node_id: PublicKey,
}

impl HelloMessage {
    pub fn new(client_id: String, capabilities: Vec<Capability>, node_id: PublicKey) -> Self {
        Self {
            protocol_version: SUPPORTED_P2P_VERSION,
            client_id,
            capabilities,
            node_id,
        }
    }

    /// Highest eth version present both in `offered` and in the message.
    pub fn negotiate_eth_version(&self, offered: &[Capability]) -> u8 {
        self.capabilities
            .iter()
            .filter(|cap| cap.is_eth() && offered.contains(cap))
            .map(|cap| cap.version)
            .max()
            .unwrap_or(0)
    }
}

impl RLPxMessage for HelloMessage {
    const CODE: u8 = 0x00;

    fn encode(&self, mut buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(&mut buf)
            .encode_field(&self.protocol_version)
            .encode_field(&self.client_id)
            .encode_field(&self.capabilities)
            .encode_field(&0u8) // listenPort (ignored)
            .encode_field(&decompress_pubkey(&self.node_id))
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // [protocolVersion: P, clientId: B, capabilities, listenPort: P, nodeId: B_64, ...]
        let decoder = Decoder::new(msg_data)?;
        let (protocol_version, decoder): (u64, _) = decoder.decode_field("protocolVersion")?;
        let (client_id, decoder): (String, _) = decoder.decode_field("clientId")?;
        let (capabilities, decoder): (Vec<Capability>, _) = decoder.decode_field("capabilities")?;
        let (_listen_port, decoder): (u16, _) = decoder.decode_field("listenPort")?;
        let (node_id, decoder): (H512, _) = decoder.decode_field("nodeId")?;
        // implementations must ignore any additional list elements
        decoder.finish_unchecked();

        Ok(Self {
            protocol_version,
            client_id,
            capabilities,
            node_id: compress_pubkey(node_id).ok_or(RLPDecodeError::MalformedData)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    NetworkError = 0x01,
    ProtocolError = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    IncompatibleVersion = 0x06,
    InvalidIdentity = 0x07,
    ClientQuitting = 0x08,
    UnexpectedIdentity = 0x09,
    SelfIdentity = 0x0a,
    PingTimeout = 0x0b,
    SubprotocolError = 0x10,
    InvalidReason = 0xff,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DisconnectReason::DisconnectRequested => "Disconnect Requested",
            DisconnectReason::NetworkError => "TCP Subsystem Error",
            DisconnectReason::ProtocolError => "Breach of Protocol",
            DisconnectReason::UselessPeer => "Useless Peer",
            DisconnectReason::TooManyPeers => "Too Many Peers",
            DisconnectReason::AlreadyConnected => "Already Connected",
            DisconnectReason::IncompatibleVersion => "Incompatible P2P Protocol Version",
            DisconnectReason::InvalidIdentity => "Null Node Identity Received",
            DisconnectReason::ClientQuitting => "Client Quitting",
            DisconnectReason::UnexpectedIdentity => "Unexpected Identity in Handshake",
            DisconnectReason::SelfIdentity => "Identity is the Same as This Node",
            DisconnectReason::PingTimeout => "Ping Timeout",
            DisconnectReason::SubprotocolError => "Some Other Reason Specific to a Subprotocol",
            DisconnectReason::InvalidReason => "Invalid Disconnect Reason",
        };
        f.write_str(text)
    }
}

impl From<u8> for DisconnectReason {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DisconnectReason::DisconnectRequested,
            0x01 => DisconnectReason::NetworkError,
            0x02 => DisconnectReason::ProtocolError,
            0x03 => DisconnectReason::UselessPeer,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::AlreadyConnected,
            0x06 => DisconnectReason::IncompatibleVersion,
            0x07 => DisconnectReason::InvalidIdentity,
            0x08 => DisconnectReason::ClientQuitting,
            0x09 => DisconnectReason::UnexpectedIdentity,
            0x0a => DisconnectReason::SelfIdentity,
            0x0b => DisconnectReason::PingTimeout,
            0x10 => DisconnectReason::SubprotocolError,
            _ => DisconnectReason::InvalidReason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectMessage {
    pub reason: Option<DisconnectReason>,
}

impl DisconnectMessage {
    pub fn new(reason: Option<DisconnectReason>) -> Self {
        Self { reason }
    }

    /// https://github.com/ethereum/devp2p/blob/master/rlpx.md#disconnect-0x01
    pub fn reason(&self) -> DisconnectReason {
        self.reason.unwrap_or(DisconnectReason::InvalidReason)
    }
}

impl RLPxMessage for DisconnectMessage {
    const CODE: u8 = 0x01;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        let mut encoded_data = vec![];
        match self.reason.map(|reason| reason as u8) {
            Some(value) => Encoder::new(&mut encoded_data)
                .encode_field(&value)
                .finish(),
            None => Vec::<u8>::new().encode(&mut encoded_data),
        }
        let msg_data = snappy_compress(encoded_data)?;
        buf.put_slice(&msg_data);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // the reason may arrive compressed or not, and encoded either as a
        // bare u8 or as a single-element list
        let msg_data = match snappy_decompress(msg_data) {
            Ok(decompressed) => decompressed,
            Err(_) => msg_data.to_vec(),
        };
        let reason = match msg_data.len() {
            0 => None,
            1 => Some(msg_data[0]),
            _ => {
                let decoder = Decoder::new(&msg_data)?;
                let (reason, _): (Option<u8>, _) = decoder.decode_optional_field();
                reason
            }
        };
        Ok(Self::new(reason.map(DisconnectReason::from)))
    }
}

#[derive(Debug, Clone)]
pub struct PingMessage {}

impl RLPxMessage for PingMessage {
    const CODE: u8 = 0x02;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        let mut encoded_data = vec![];
        Vec::<u8>::new().encode(&mut encoded_data);
        let msg_data = snappy_compress(encoded_data)?;
        buf.put_slice(&msg_data);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decompressed = snappy_decompress(msg_data)?;
        decode_rlp_item(&decompressed)?;
        Ok(Self {})
    }
}

#[derive(Debug, Clone)]
pub struct PongMessage {}

impl RLPxMessage for PongMessage {
    const CODE: u8 = 0x03;

    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        let mut encoded_data = vec![];
        Vec::<u8>::new().encode(&mut encoded_data);
        let msg_data = snappy_compress(encoded_data)?;
        buf.put_slice(&msg_data);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        let decompressed = snappy_decompress(msg_data)?;
        decode_rlp_item(&decompressed)?;
        Ok(Self {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use secp256k1::SecretKey;

    #[test]
    fn hello_message_roundtrip() {
        let sk = SecretKey::new(&mut OsRng);
        let hello = HelloMessage::new(
            "ragno/v0.1.0".to_string(),
            supported_eth_capabilities(),
            PublicKey::from_secret_key(secp256k1::SECP256K1, &sk),
        );
        let mut buf = Vec::new();
        hello.encode(&mut buf).unwrap();
        let decoded = HelloMessage::decode(&buf).unwrap();
        assert_eq!(decoded.protocol_version, SUPPORTED_P2P_VERSION);
        assert_eq!(decoded.client_id, "ragno/v0.1.0");
        assert_eq!(decoded.capabilities, supported_eth_capabilities());
        assert_eq!(decoded.node_id, hello.node_id);
    }

    #[test]
    fn eth_version_negotiation() {
        let sk = SecretKey::new(&mut OsRng);
        let node_id = PublicKey::from_secret_key(secp256k1::SECP256K1, &sk);
        let offered = supported_eth_capabilities();

        let remote = HelloMessage::new(
            "geth".into(),
            vec![Capability::eth(67), Capability::eth(68), Capability::new("snap", 1)],
            node_id,
        );
        assert_eq!(remote.negotiate_eth_version(&offered), 68);

        let remote = HelloMessage::new("old".into(), vec![Capability::eth(65)], node_id);
        assert_eq!(remote.negotiate_eth_version(&offered), 0);

        let remote = HelloMessage::new("other".into(), vec![Capability::new("les", 4)], node_id);
        assert_eq!(remote.negotiate_eth_version(&offered), 0);
    }

    #[test]
    fn disconnect_roundtrip() {
        let msg = DisconnectMessage::new(Some(DisconnectReason::TooManyPeers));
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        let decoded = DisconnectMessage::decode(&buf).unwrap();
        assert_eq!(decoded.reason(), DisconnectReason::TooManyPeers);
    }

    #[test]
    fn disconnect_decodes_uncompressed_bare_byte() {
        let decoded = DisconnectMessage::decode(&[0x04]).unwrap();
        assert_eq!(decoded.reason(), DisconnectReason::TooManyPeers);
    }
}

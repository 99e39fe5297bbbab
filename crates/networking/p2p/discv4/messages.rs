//! Discovery v4 wire format.
//! Reference: https://github.com/ethereum/devp2p/blob/master/discv4.md#wire-protocol

use bytes::BufMut;
use ethereum_types::{H256, H512};
use ragno_common::{
    keccak::{keccak, keccak_hash},
    types::{Endpoint, Node, NodeRecord, node_id},
};
use ragno_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use secp256k1::{
    SECP256K1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};
use thiserror::Error;

use crate::utils::decompress_pubkey;

const HASH_SIZE: usize = 32;
const SIGNATURE_SIZE: usize = 65;
const HEADER_SIZE: usize = HASH_SIZE + SIGNATURE_SIZE;

#[derive(Debug, Error)]
pub enum PacketDecodeErr {
    #[error("Invalid packet size: {0}")]
    InvalidPacketSize(usize),
    #[error("Packet hash does not match the computed one")]
    HashMismatch,
    #[error("Invalid packet type: {0:#x}")]
    InvalidPacketType(u8),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("RLP decode error: {0}")]
    RlpDecodeError(#[from] RLPDecodeError),
}

/// A decoded discovery packet together with the sender identity recovered
/// from its signature.
///
/// packet = hash || signature || packet-type || packet-data
/// hash = keccak256(signature || packet-type || packet-data)
/// signature = sign(keccak256(packet-type || packet-data))
#[derive(Debug)]
pub struct Packet {
    hash: H256,
    public_key: H512,
    message: Message,
}

impl Packet {
    pub fn decode(encoded_packet: &[u8]) -> Result<Packet, PacketDecodeErr> {
        if encoded_packet.len() < HEADER_SIZE + 2 {
            return Err(PacketDecodeErr::InvalidPacketSize(encoded_packet.len()));
        }

        let hash = H256::from_slice(&encoded_packet[..HASH_SIZE]);
        let signature_bytes = &encoded_packet[HASH_SIZE..HEADER_SIZE];
        let packet_type = encoded_packet[HEADER_SIZE];
        let encoded_msg = &encoded_packet[HEADER_SIZE..];

        let computed_hash = keccak(&encoded_packet[HASH_SIZE..]);
        if hash != computed_hash {
            return Err(PacketDecodeErr::HashMismatch);
        }

        let digest = keccak_hash(encoded_msg);
        let message_digest = secp256k1::Message::from_digest_slice(&digest)
            .map_err(|_| PacketDecodeErr::InvalidSignature)?;
        let recovery_id = RecoveryId::from_i32(signature_bytes[64] as i32)
            .map_err(|_| PacketDecodeErr::InvalidSignature)?;
        let signature = RecoverableSignature::from_compact(&signature_bytes[..64], recovery_id)
            .map_err(|_| PacketDecodeErr::InvalidSignature)?;
        let public_key = SECP256K1
            .recover_ecdsa(&message_digest, &signature)
            .map_err(|_| PacketDecodeErr::InvalidSignature)?;

        let message = Message::decode_with_type(packet_type, &encoded_msg[1..])?;

        Ok(Packet {
            hash,
            public_key: decompress_pubkey(&public_key),
            message,
        })
    }

    pub fn get_hash(&self) -> H256 {
        self.hash
    }

    pub fn get_public_key(&self) -> H512 {
        self.public_key
    }

    pub fn get_node_id(&self) -> H256 {
        node_id(&self.public_key)
    }

    pub fn get_message(&self) -> &Message {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNode(FindNodeMessage),
    Neighbors(NeighborsMessage),
    ENRRequest(ENRRequestMessage),
    ENRResponse(ENRResponseMessage),
}

impl Message {
    fn packet_type(&self) -> u8 {
        match self {
            Message::Ping(_) => 0x01,
            Message::Pong(_) => 0x02,
            Message::FindNode(_) => 0x03,
            Message::Neighbors(_) => 0x04,
            Message::ENRRequest(_) => 0x05,
            Message::ENRResponse(_) => 0x06,
        }
    }

    /// Serializes the message with the signed discovery header. The first 32
    /// bytes of `buf` end up holding the packet hash.
    pub fn encode_with_header(&self, buf: &mut Vec<u8>, signer: &SecretKey) {
        let mut data = vec![self.packet_type()];
        self.encode(&mut data);

        let digest = keccak_hash(&data);
        let message_digest = secp256k1::Message::from_digest_slice(&digest)
            .expect("keccak digests are always 32 bytes");
        let (recovery_id, signature) = SECP256K1
            .sign_ecdsa_recoverable(&message_digest, signer)
            .serialize_compact();

        let mut signed: Vec<u8> = Vec::with_capacity(SIGNATURE_SIZE + data.len());
        signed.extend_from_slice(&signature);
        signed.push(recovery_id.to_i32() as u8);
        signed.extend_from_slice(&data);

        let hash = keccak_hash(&signed);
        buf.extend_from_slice(&hash);
        buf.extend_from_slice(&signed);
    }

    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            Message::Ping(msg) => msg.encode(buf),
            Message::Pong(msg) => msg.encode(buf),
            Message::FindNode(msg) => msg.encode(buf),
            Message::Neighbors(msg) => msg.encode(buf),
            Message::ENRRequest(msg) => msg.encode(buf),
            Message::ENRResponse(msg) => msg.encode(buf),
        }
    }

    fn decode_with_type(packet_type: u8, msg: &[u8]) -> Result<Message, PacketDecodeErr> {
        match packet_type {
            0x01 => Ok(Message::Ping(PingMessage::decode(msg)?)),
            0x02 => Ok(Message::Pong(PongMessage::decode(msg)?)),
            0x03 => Ok(Message::FindNode(FindNodeMessage::decode(msg)?)),
            0x04 => Ok(Message::Neighbors(NeighborsMessage::decode(msg)?)),
            0x05 => Ok(Message::ENRRequest(ENRRequestMessage::decode(msg)?)),
            0x06 => Ok(Message::ENRResponse(ENRResponseMessage::decode(msg)?)),
            packet_type => Err(PacketDecodeErr::InvalidPacketType(packet_type)),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Ping(_) => "Ping".fmt(f),
            Message::Pong(_) => "Pong".fmt(f),
            Message::FindNode(_) => "FindNode".fmt(f),
            Message::Neighbors(_) => "Neighbors".fmt(f),
            Message::ENRRequest(_) => "ENRRequest".fmt(f),
            Message::ENRResponse(_) => "ENRResponse".fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    /// The discovery protocol version, always 4.
    pub version: u8,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
    /// The sender's current record seq, per EIP-868.
    pub enr_seq: Option<u64>,
}

impl PingMessage {
    pub fn new(from: Endpoint, to: Endpoint, expiration: u64) -> Self {
        Self {
            version: 4,
            from,
            to,
            expiration,
            enr_seq: None,
        }
    }

    pub fn with_enr_seq(self, enr_seq: u64) -> Self {
        Self {
            enr_seq: Some(enr_seq),
            ..self
        }
    }
}

impl RLPEncode for PingMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.version)
            .encode_field(&self.from)
            .encode_field(&self.to)
            .encode_field(&self.expiration)
            .encode_optional_field(&self.enr_seq)
            .finish();
    }
}

impl RLPDecode for PingMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (version, decoder) = decoder.decode_field("version")?;
        let (from, decoder) = decoder.decode_field("from")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        let (enr_seq, decoder) = decoder.decode_optional_field();
        Ok((
            PingMessage {
                version,
                from,
                to,
                expiration,
                enr_seq,
            },
            decoder.finish_unchecked(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongMessage {
    pub to: Endpoint,
    pub ping_hash: H256,
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

impl PongMessage {
    pub fn new(to: Endpoint, ping_hash: H256, expiration: u64) -> Self {
        Self {
            to,
            ping_hash,
            expiration,
            enr_seq: None,
        }
    }

    pub fn with_enr_seq(self, enr_seq: u64) -> Self {
        Self {
            enr_seq: Some(enr_seq),
            ..self
        }
    }
}

impl RLPEncode for PongMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.to)
            .encode_field(&self.ping_hash)
            .encode_field(&self.expiration)
            .encode_optional_field(&self.enr_seq)
            .finish();
    }
}

impl RLPDecode for PongMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (ping_hash, decoder) = decoder.decode_field("ping_hash")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        let (enr_seq, decoder) = decoder.decode_optional_field();
        Ok((
            PongMessage {
                to,
                ping_hash,
                expiration,
                enr_seq,
            },
            decoder.finish_unchecked(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindNodeMessage {
    /// The public key whose neighbourhood is being asked for.
    pub target: H512,
    pub expiration: u64,
}

impl FindNodeMessage {
    pub fn new(target: H512, expiration: u64) -> Self {
        Self { target, expiration }
    }
}

impl RLPEncode for FindNodeMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.target)
            .encode_field(&self.expiration)
            .finish();
    }
}

impl RLPDecode for FindNodeMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (target, decoder) = decoder.decode_field("target")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        Ok((
            FindNodeMessage { target, expiration },
            decoder.finish_unchecked(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborsMessage {
    pub nodes: Vec<Node>,
    pub expiration: u64,
}

impl NeighborsMessage {
    pub fn new(nodes: Vec<Node>, expiration: u64) -> Self {
        Self { nodes, expiration }
    }
}

impl RLPEncode for NeighborsMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nodes)
            .encode_field(&self.expiration)
            .finish();
    }
}

impl RLPDecode for NeighborsMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nodes, decoder) = decoder.decode_field("nodes")?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        Ok((
            NeighborsMessage { nodes, expiration },
            decoder.finish_unchecked(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ENRRequestMessage {
    pub expiration: u64,
}

impl ENRRequestMessage {
    pub fn new(expiration: u64) -> Self {
        Self { expiration }
    }
}

impl RLPEncode for ENRRequestMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf).encode_field(&self.expiration).finish();
    }
}

impl RLPDecode for ENRRequestMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (expiration, decoder) = decoder.decode_field("expiration")?;
        Ok((ENRRequestMessage { expiration }, decoder.finish_unchecked()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ENRResponseMessage {
    pub request_hash: H256,
    pub node_record: NodeRecord,
}

impl ENRResponseMessage {
    pub fn new(request_hash: H256, node_record: NodeRecord) -> Self {
        Self {
            request_hash,
            node_record,
        }
    }
}

impl RLPEncode for ENRResponseMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.request_hash)
            .encode_field(&self.node_record)
            .finish();
    }
}

impl RLPDecode for ENRResponseMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (request_hash, decoder) = decoder.decode_field("request_hash")?;
        let (node_record, decoder) = decoder.decode_field("node_record")?;
        Ok((
            ENRResponseMessage {
                request_hash,
                node_record,
            },
            decoder.finish_unchecked(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use ragno_common::types::public_key_from_secret_key;
    use std::net::IpAddr;

    fn endpoint(ip: &str, port: u16) -> Endpoint {
        Endpoint {
            ip: ip.parse::<IpAddr>().unwrap(),
            udp_port: port,
            tcp_port: port,
        }
    }

    #[test]
    fn ping_packet_roundtrip_recovers_sender() {
        let signer = SecretKey::new(&mut OsRng);
        let ping = Message::Ping(
            PingMessage::new(endpoint("10.0.0.1", 30303), endpoint("10.0.0.2", 30303), 12345)
                .with_enr_seq(7),
        );

        let mut buf = Vec::new();
        ping.encode_with_header(&mut buf, &signer);

        let packet = Packet::decode(&buf).unwrap();
        assert_eq!(packet.get_public_key(), public_key_from_secret_key(&signer));
        assert_eq!(packet.get_hash(), H256::from_slice(&buf[..32]));
        assert_eq!(packet.get_message(), &ping);
    }

    #[test]
    fn neighbors_packet_roundtrip() {
        let signer = SecretKey::new(&mut OsRng);
        let nodes = vec![
            Node::new("1.2.3.4".parse().unwrap(), 30303, 30303, H512::repeat_byte(1)),
            Node::new("5.6.7.8".parse().unwrap(), 30304, 30305, H512::repeat_byte(2)),
        ];
        let neighbors = Message::Neighbors(NeighborsMessage::new(nodes.clone(), 999));

        let mut buf = Vec::new();
        neighbors.encode_with_header(&mut buf, &signer);

        let packet = Packet::decode(&buf).unwrap();
        let Message::Neighbors(decoded) = packet.get_message() else {
            panic!("expected a neighbors message");
        };
        assert_eq!(decoded.nodes, nodes);
    }

    #[test]
    fn tampered_packet_is_rejected() {
        let signer = SecretKey::new(&mut OsRng);
        let msg = Message::ENRRequest(ENRRequestMessage::new(42));
        let mut buf = Vec::new();
        msg.encode_with_header(&mut buf, &signer);

        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(Packet::decode(&buf).is_err());
    }

    #[test]
    fn ping_without_enr_seq_decodes() {
        let signer = SecretKey::new(&mut OsRng);
        let ping = Message::Ping(PingMessage::new(
            endpoint("1.1.1.1", 1),
            endpoint("2.2.2.2", 2),
            77,
        ));
        let mut buf = Vec::new();
        ping.encode_with_header(&mut buf, &signer);
        let packet = Packet::decode(&buf).unwrap();
        let Message::Ping(decoded) = packet.get_message() else {
            panic!("expected a ping");
        };
        assert_eq!(decoded.enr_seq, None);
    }
}

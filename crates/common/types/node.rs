use bytes::{BufMut, Bytes};
use chrono::{DateTime, Utc};
use ethereum_types::{H256, H264, H512};
use ragno_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};
use std::net::Ipv6Addr;
use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::OnceLock,
};
use thiserror::Error;

use crate::{base64, keccak::keccak};

use super::fork_id::ForkId;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("RLP decode error: {0}")]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Signature error: {0}")]
    SignatureError(String),
}

const MAX_NODE_RECORD_ENCODED_SIZE: usize = 300;

/// Computes the node id of a public key: keccak256 of the uncompressed key
/// without the 0x04 prefix.
pub fn node_id(public_key: &H512) -> H256 {
    keccak(public_key)
}

pub fn public_key_from_secret_key(secret_key: &SecretKey) -> H512 {
    let encoded =
        PublicKey::from_secret_key(secp256k1::SECP256K1, secret_key).serialize_uncompressed();
    H512::from_slice(&encoded[1..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl RLPEncode for Endpoint {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ip)
            .encode_field(&self.udp_port)
            .encode_field(&self.tcp_port)
            .finish();
    }
}

impl RLPDecode for Endpoint {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ip, decoder) = decoder.decode_field("ip")?;
        let (udp_port, decoder) = decoder.decode_field("udp_port")?;
        let (tcp_port, decoder) = decoder.decode_field("tcp_port")?;
        let remaining = decoder.finish()?;
        Ok((
            Endpoint {
                ip,
                udp_port,
                tcp_port,
            },
            remaining,
        ))
    }
}

/// A node's transport coordinates plus its public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: H512,
    node_id: OnceLock<H256>,
}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, public_key: H512) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            public_key,
            node_id: OnceLock::new(),
        }
    }

    pub fn from_enode_url(enode: &str) -> Result<Self, NodeError> {
        if enode.len() < 137 || !enode.starts_with("enode://") {
            return Err(NodeError::InvalidFormat("enode url too short".into()));
        }
        let public_key = H512::from_str(&enode[8..136])
            .map_err(|_| NodeError::ParseError("Could not parse public key".into()))?;

        let address_part = &enode[137..];
        // strip `?discport=` if present
        let socket_part = match address_part.find('?') {
            Some(pos) => &address_part[..pos],
            None => address_part,
        };

        let socket_address: SocketAddr = socket_part
            .parse()
            .map_err(|_| NodeError::ParseError("Could not parse socket address".into()))?;
        let ip = socket_address.ip();
        let tcp_port = socket_address.port();

        let udp_port = match enode.find("?discport=") {
            Some(pos) => enode[pos + 10..]
                .parse()
                .map_err(|_| NodeError::ParseError("Could not parse discport".into()))?,
            None => tcp_port,
        };

        Ok(Self::new(ip, udp_port, tcp_port, public_key))
    }

    pub fn from_enr_url(enr: &str) -> Result<Self, NodeError> {
        let base64_decoded = base64::decode(&enr.as_bytes()[4..]);
        let record = NodeRecord::decode(&base64_decoded)?;
        Node::from_enr(&record)
    }

    pub fn from_enr(record: &NodeRecord) -> Result<Self, NodeError> {
        let pairs = record.pairs();
        let public_key = pairs.secp256k1.ok_or(NodeError::MissingField(
            "public key not found in record".into(),
        ))?;
        let public_key = PublicKey::from_slice(public_key.as_bytes()).map_err(|_| {
            NodeError::ParseError("public key could not be built from record bytes".into())
        })?;
        let encoded = public_key.serialize_uncompressed();
        let public_key = H512::from_slice(&encoded[1..]);

        let ip: IpAddr = match (pairs.ip, pairs.ip6) {
            (Some(ipv4), _) => IpAddr::from(ipv4),
            (None, Some(ipv6)) => IpAddr::from(ipv6),
            (None, None) => {
                return Err(NodeError::MissingField(
                    "ip not found in record, can't construct node".into(),
                ));
            }
        };

        // either port may be missing, in which case it defaults to the other
        let udp_port = pairs
            .udp_port
            .or(pairs.tcp_port)
            .ok_or(NodeError::MissingField("no port found in record".into()))?;
        let tcp_port = pairs
            .tcp_port
            .or(pairs.udp_port)
            .ok_or(NodeError::MissingField("no port found in record".into()))?;

        Ok(Self::new(ip, udp_port, tcp_port, public_key))
    }

    pub fn enode_url(&self) -> String {
        let public_key = hex::encode(self.public_key);
        let node_ip = self.ip;
        let discovery_port = self.udp_port;
        let listener_port = self.tcp_port;
        if discovery_port != listener_port {
            format!("enode://{public_key}@{node_ip}:{listener_port}?discport={discovery_port}")
        } else {
            format!("enode://{public_key}@{node_ip}:{listener_port}")
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.tcp_port)
    }

    pub fn node_id(&self) -> H256 {
        *self.node_id.get_or_init(|| node_id(&self.public_key))
    }
}

impl FromStr for Node {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.starts_with("enode://") => Self::from_enode_url(s),
            s if s.starts_with("enr:") => Self::from_enr_url(s),
            _ => Err(NodeError::InvalidFormat(
                "Invalid network address format".into(),
            )),
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}({}:{})", self.node_id(), self.ip, self.tcp_port)
    }
}

impl RLPEncode for Node {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ip)
            .encode_field(&self.udp_port)
            .encode_field(&self.tcp_port)
            .encode_field(&self.public_key)
            .finish();
    }
}

impl RLPDecode for Node {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ip, decoder) = decoder.decode_field("ip")?;
        let (udp_port, decoder) = decoder.decode_field("udp_port")?;
        let (tcp_port, decoder) = decoder.decode_field("tcp_port")?;
        let (public_key, decoder) = decoder.decode_field("public_key")?;
        let remaining = decoder.finish_unchecked();
        Ok((Node::new(ip, udp_port, tcp_port, public_key), remaining))
    }
}

/// The key/value pairs of an ENR.
/// Reference: [ENR records](https://github.com/ethereum/devp2p/blob/master/enr.md)
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct NodeRecordPairs {
    /// Identity scheme, always "v4".
    pub id: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    /// Compressed secp256k1 public key, 33 bytes.
    pub secp256k1: Option<H264>,
    /// https://github.com/ethereum/devp2p/blob/master/enr-entries/eth.md
    pub eth: Option<ForkId>,
}

impl NodeRecordPairs {
    fn try_from_raw_pairs(pairs: &[(Bytes, Bytes)]) -> Result<NodeRecordPairs, RLPDecodeError> {
        let mut decoded = NodeRecordPairs::default();
        for (key, value) in pairs {
            match key.as_ref() {
                b"id" => decoded.id = Some(String::decode(value)?),
                b"ip" => decoded.ip = Some(Ipv4Addr::decode(value)?),
                b"ip6" => decoded.ip6 = Some(Ipv6Addr::decode(value)?),
                b"tcp" => decoded.tcp_port = Some(u16::decode(value)?),
                b"udp" => decoded.udp_port = Some(u16::decode(value)?),
                b"secp256k1" => decoded.secp256k1 = Some(H264(<[u8; 33]>::decode(value)?)),
                b"eth" => {
                    // entry-value = [[ forkHash, forkNext ], ...]; additional
                    // list elements must be ignored
                    let decoder = Decoder::new(value)?;
                    let (fork_id, decoder) = decoder.decode_field("forkId")?;
                    decoder.finish_unchecked();
                    decoded.eth = Some(fork_id);
                }
                // unknown keys are valid, skip them
                _ => {}
            }
        }
        Ok(decoded)
    }

    /// Encodes as the flat (key, value) sequence of the record body.
    /// Keys must be sorted; this writes them in alphabetical order.
    fn encode(&self, buf: &mut dyn BufMut) {
        if let Some(eth) = &self.eth {
            // the spec wants nested lists: [[forkHash, forkNext]]
            Bytes::from("eth").encode(buf);
            vec![*eth].encode(buf);
        }
        if let Some(id) = &self.id {
            Bytes::from("id").encode(buf);
            id.encode(buf);
        }
        if let Some(ip) = &self.ip {
            Bytes::from("ip").encode(buf);
            ip.encode(buf);
        }
        if let Some(ip6) = &self.ip6 {
            Bytes::from("ip6").encode(buf);
            ip6.encode(buf);
        }
        if let Some(secp256k1) = &self.secp256k1 {
            Bytes::from("secp256k1").encode(buf);
            secp256k1.encode(buf);
        }
        if let Some(tcp) = self.tcp_port {
            Bytes::from("tcp").encode(buf);
            tcp.encode(buf);
        }
        if let Some(udp) = self.udp_port {
            Bytes::from("udp").encode(buf);
            udp.encode(buf);
        }
    }
}

/// A signed, versioned node record.
/// Reference: [ENR records](https://github.com/ethereum/devp2p/blob/master/enr.md#record-structure)
#[derive(Debug, PartialEq, Clone, Eq, Default)]
pub struct NodeRecord {
    pub signature: H512,
    pub seq: u64,
    pairs: NodeRecordPairs,
}

impl NodeRecord {
    pub fn from_node(
        node: &Node,
        seq: u64,
        signer: &SecretKey,
        fork_id: Option<ForkId>,
    ) -> Result<Self, NodeError> {
        let mut pairs = NodeRecordPairs {
            id: Some("v4".to_string()),
            secp256k1: Some(H264::from_slice(
                &PublicKey::from_secret_key(secp256k1::SECP256K1, signer).serialize(),
            )),
            tcp_port: Some(node.tcp_port),
            udp_port: Some(node.udp_port),
            eth: fork_id,
            ..Default::default()
        };
        match node.ip.to_canonical() {
            IpAddr::V4(ip) => pairs.ip = Some(ip),
            IpAddr::V6(ip) => pairs.ip6 = Some(ip),
        }

        let mut record = NodeRecord {
            seq,
            pairs,
            ..Default::default()
        };
        record.signature = record.sign_record(signer)?;
        Ok(record)
    }

    pub fn pairs(&self) -> &NodeRecordPairs {
        &self.pairs
    }

    pub fn enr_url(&self) -> Result<String, NodeError> {
        let rlp_encoded = self.encode_to_vec();
        let base64_encoded = base64::encode(&rlp_encoded);
        let mut result: String = "enr:".into();
        let base64_encoded = String::from_utf8(base64_encoded)
            .map_err(|_| NodeError::ParseError("Could not base64 encode record".into()))?;
        result.push_str(&base64_encoded);
        Ok(result)
    }

    fn sign_record(&self, signer: &SecretKey) -> Result<H512, NodeError> {
        let digest = self.get_signature_digest();
        let msg = secp256k1::Message::from_digest_slice(&digest)
            .map_err(|_| NodeError::SignatureError("Invalid message digest".into()))?;
        let signature_bytes = secp256k1::SECP256K1
            .sign_ecdsa(&msg, signer)
            .serialize_compact();
        Ok(H512::from_slice(&signature_bytes))
    }

    pub fn get_signature_digest(&self) -> [u8; 32] {
        let mut rlp = vec![];
        Encoder::new(&mut rlp)
            .encode_field(&self.seq)
            .encode_with(|buf| self.pairs.encode(buf))
            .finish();
        crate::keccak::keccak_hash(&rlp)
    }

    /// Verifies the record signature against the embedded public key.
    pub fn verify_signature(&self) -> bool {
        let Some(pubkey_bytes) = self.pairs.secp256k1 else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes.as_bytes()) else {
            return false;
        };
        let digest = self.get_signature_digest();
        let Ok(message) = secp256k1::Message::from_digest_slice(&digest) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(self.signature.as_bytes()) else {
            return false;
        };
        secp256k1::SECP256K1
            .verify_ecdsa(&message, &signature, &pubkey)
            .is_ok()
    }
}

impl RLPEncode for NodeRecord {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.seq)
            .encode_with(|buf| self.pairs.encode(buf))
            .finish();
    }
}

impl RLPDecode for NodeRecord {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        if decoder.get_payload_len() > MAX_NODE_RECORD_ENCODED_SIZE {
            return Err(RLPDecodeError::InvalidLength);
        }
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (seq, decoder) = decoder.decode_field("seq")?;
        let (pairs, decoder) = decode_node_record_optional_fields(vec![], decoder)?;

        // all pairs are optional except for id
        if !pairs.iter().any(|(k, _)| k.as_ref() == b"id") {
            return Err(RLPDecodeError::Custom(
                "Invalid node record, 'id' field missing".into(),
            ));
        }
        let pairs = NodeRecordPairs::try_from_raw_pairs(&pairs)?;
        let record = NodeRecord {
            signature,
            seq,
            pairs,
        };
        let remaining = decoder.finish()?;
        Ok((record, remaining))
    }
}

/// Collects the remaining (key, value) pairs of a record body. Values keep
/// their RLP prefix so they can be decoded as `T::decode(value)`.
fn decode_node_record_optional_fields(
    mut pairs: Vec<(Bytes, Bytes)>,
    decoder: Decoder,
) -> Result<(Vec<(Bytes, Bytes)>, Decoder), RLPDecodeError> {
    let (key, decoder): (Option<Bytes>, Decoder) = decoder.decode_optional_field();
    if let Some(key) = key {
        let (value, decoder): (Vec<u8>, Decoder) = decoder.get_encoded_item()?;
        pairs.push((key, Bytes::from(value)));
        decode_node_record_optional_fields(pairs, decoder)
    } else {
        Ok((pairs, decoder))
    }
}

/// A node observation coming out of Discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredRecord {
    pub node: Node,
    pub seq: u64,
    /// The signed record in `enr:` form, when the node sent one.
    pub enr: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredRecord {
    pub fn from_node(node: Node, seq: u64, enr: Option<String>) -> Self {
        Self {
            node,
            seq,
            enr,
            last_seen: Utc::now(),
        }
    }

    /// A record is dialable only with an address and a discovery port.
    pub fn is_complete(&self) -> bool {
        !self.node.ip.is_unspecified() && self.node.udp_port > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_node_from_enode_string() {
        let input = "enode://d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666@18.138.108.67:30303";
        let node = Node::from_enode_url(input).unwrap();
        let public_key = H512::from_str(
            "d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666")
            .unwrap();
        let socket_address = SocketAddr::from_str("18.138.108.67:30303").unwrap();
        let expected = Node::new(
            socket_address.ip(),
            socket_address.port(),
            socket_address.port(),
            public_key,
        );
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_node_with_discport_from_enode_string() {
        let input = "enode://d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666@18.138.108.67:30303?discport=30305";
        let node = Node::from_enode_url(input).unwrap();
        assert_eq!(node.udp_port, 30305);
        assert_eq!(node.tcp_port, 30303);
    }

    #[test]
    fn parse_node_from_enr_string() {
        // https://github.com/ethereum/devp2p/blob/master/enr.md#test-vectors
        let enr_string = "enr:-IS4QHCYrYZbAKWCBRlAy5zzaDZXJBGkcnh4MHcBFZntXNFrdvJjX04jRzjzCBOonrkTfj499SZuOh8R33Ls8RRcy5wBgmlkgnY0gmlwhH8AAAGJc2VjcDI1NmsxoQPKY0yuDUmstAHYpMa2_oxVtw0RW_QAdpzBQA8yWM0xOIN1ZHCCdl8";
        let node = Node::from_enr_url(enr_string).unwrap();
        let public_key =
            H512::from_str("0xca634cae0d49acb401d8a4c6b6fe8c55b70d115bf400769cc1400f3258cd31387574077f301b421bc84df7266c44e9e6d569fc56be00812904767bf5ccd1fc7f")
                .unwrap();
        let socket_address = SocketAddr::from_str("127.0.0.1:30303").unwrap();
        let expected = Node::new(
            socket_address.ip(),
            socket_address.port(),
            socket_address.port(),
            public_key,
        );
        assert_eq!(node, expected);
    }

    #[test]
    fn verify_enr_signature_valid() {
        // https://github.com/ethereum/devp2p/blob/master/enr.md#test-vectors
        let enr_string = "enr:-IS4QHCYrYZbAKWCBRlAy5zzaDZXJBGkcnh4MHcBFZntXNFrdvJjX04jRzjzCBOonrkTfj499SZuOh8R33Ls8RRcy5wBgmlkgnY0gmlwhH8AAAGJc2VjcDI1NmsxoQPKY0yuDUmstAHYpMa2_oxVtw0RW_QAdpzBQA8yWM0xOIN1ZHCCdl8";
        let base64_decoded = base64::decode(&enr_string.as_bytes()[4..]);
        let record = NodeRecord::decode(&base64_decoded).unwrap();
        assert!(record.verify_signature());
    }

    #[test]
    fn verify_enr_signature_invalid() {
        let enr_string = "enr:-IS4QHCYrYZbAKWCBRlAy5zzaDZXJBGkcnh4MHcBFZntXNFrdvJjX04jRzjzCBOonrkTfj499SZuOh8R33Ls8RRcy5wBgmlkgnY0gmlwhH8AAAGJc2VjcDI1NmsxoQPKY0yuDUmstAHYpMa2_oxVtw0RW_QAdpzBQA8yWM0xOIN1ZHCCdl8";
        let base64_decoded = base64::decode(&enr_string.as_bytes()[4..]);
        let mut record = NodeRecord::decode(&base64_decoded).unwrap();
        record.signature = H512::zero();
        assert!(!record.verify_signature());
    }

    #[test]
    fn record_roundtrips_through_enr_url() {
        let signer = SecretKey::from_slice(&[
            16, 125, 177, 238, 167, 212, 168, 215, 239, 165, 77, 224, 199, 143, 55, 205, 9, 194,
            87, 139, 92, 46, 30, 191, 74, 37, 68, 242, 38, 225, 104, 246,
        ])
        .unwrap();
        let addr = SocketAddr::from_str("127.0.0.1:30303").unwrap();
        let node = Node::new(
            addr.ip(),
            addr.port(),
            addr.port(),
            public_key_from_secret_key(&signer),
        );
        let record = NodeRecord::from_node(&node, 1, &signer, None).unwrap();
        let enr_url = record.enr_url().unwrap();
        let decoded = NodeRecord::decode(&base64::decode(&enr_url.as_bytes()[4..])).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.verify_signature());
    }

    #[test]
    fn record_with_fork_id_roundtrips() {
        let signer = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let addr = SocketAddr::from_str("10.0.0.2:30303").unwrap();
        let node = Node::new(
            addr.ip(),
            addr.port(),
            addr.port(),
            public_key_from_secret_key(&signer),
        );
        let fork_id = ForkId {
            fork_hash: ethereum_types::H32::from_low_u64_be(0xfc64ec04),
            fork_next: 1_150_000,
        };
        let record = NodeRecord::from_node(&node, 3, &signer, Some(fork_id)).unwrap();
        let decoded = NodeRecord::decode(&record.encode_to_vec()).unwrap();
        assert_eq!(decoded.pairs().eth, Some(fork_id));
        assert!(decoded.verify_signature());
    }

    #[test]
    fn incomplete_records_are_flagged() {
        let node = Node::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 30303, 30303, H512::zero());
        assert!(!DiscoveredRecord::from_node(node, 0, None).is_complete());

        let node = Node::new("1.2.3.4".parse().unwrap(), 0, 30303, H512::zero());
        assert!(!DiscoveredRecord::from_node(node, 0, None).is_complete());

        let node = Node::new("1.2.3.4".parse().unwrap(), 30303, 30303, H512::zero());
        assert!(DiscoveredRecord::from_node(node, 0, None).is_complete());
    }
}

use ragno_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use serde::Serialize;

/// A devp2p capability as advertised in the `hello` message, e.g. `eth/68`.
/// Remote peers advertise arbitrary protocols, so the name is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub protocol: String,
    pub version: u8,
}

impl Capability {
    pub fn new(protocol: impl Into<String>, version: u8) -> Self {
        Capability {
            protocol: protocol.into(),
            version,
        }
    }

    pub fn eth(version: u8) -> Self {
        Self::new("eth", version)
    }

    pub fn is_eth(&self) -> bool {
        self.protocol == "eth"
    }
}

impl RLPEncode for Capability {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.protocol)
            .encode_field(&self.version)
            .finish();
    }
}

impl RLPDecode for Capability {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (protocol, decoder) = decoder.decode_field("protocol")?;
        let (version, decoder) = decoder.decode_field("version")?;
        // implementations must tolerate additional list elements
        let remaining = decoder.finish_unchecked();
        Ok((Capability { protocol, version }, remaining))
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.protocol, self.version)
    }
}

impl Serialize for Capability {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cap = Capability::eth(68);
        let encoded = cap.encode_to_vec();
        assert_eq!(Capability::decode(&encoded).unwrap(), cap);
    }

    #[test]
    fn unknown_protocols_survive() {
        let cap = Capability::new("les", 4);
        let encoded = cap.encode_to_vec();
        let decoded = Capability::decode(&encoded).unwrap();
        assert_eq!(decoded.to_string(), "les/4");
    }
}

use ethereum_types::H512;
use ragno_rlp::error::{RLPDecodeError, RLPEncodeError};
use secp256k1::PublicKey;
use snap::raw::{Decoder as SnappyDecoder, Encoder as SnappyEncoder, max_compress_len};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expands a compressed public key to the 64-byte wire form.
pub fn decompress_pubkey(pk: &PublicKey) -> H512 {
    let encoded = pk.serialize_uncompressed();
    debug_assert_eq!(encoded[0], 4);
    H512::from_slice(&encoded[1..])
}

/// Rebuilds a public key from the 64-byte wire form (0x04 prefix omitted).
pub fn compress_pubkey(pk: H512) -> Option<PublicKey> {
    let mut buf = [0u8; 65];
    buf[0] = 4;
    buf[1..].copy_from_slice(pk.as_bytes());
    PublicKey::from_slice(&buf).ok()
}

pub fn snappy_compress(encoded_data: Vec<u8>) -> Result<Vec<u8>, RLPEncodeError> {
    let mut snappy_encoder = SnappyEncoder::new();
    let mut msg_data = vec![0; max_compress_len(encoded_data.len()) + 1];
    let compressed_size = snappy_encoder
        .compress(&encoded_data, &mut msg_data)
        .map_err(|e| RLPEncodeError::InvalidCompression(e.to_string()))?;
    msg_data.truncate(compressed_size);
    Ok(msg_data)
}

pub fn snappy_decompress(msg_data: &[u8]) -> Result<Vec<u8>, RLPDecodeError> {
    let mut snappy_decoder = SnappyDecoder::new();
    snappy_decoder
        .decompress_vec(msg_data)
        .map_err(|e| RLPDecodeError::InvalidCompression(e.to_string()))
}

pub fn time_now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn get_msg_expiration_from_seconds(seconds: u64) -> u64 {
    time_now_unix() + seconds
}

pub fn is_msg_expired(expiration: u64) -> bool {
    // as per the spec, the expiration field should be ignored when the
    // packet-type carries none (pre EIP-868 pongs encode it as 0)
    expiration != 0 && expiration < time_now_unix()
}

/// Some nodes advertise IPv4 addresses mapped into IPv6; flatten them.
pub fn unmap_ipv4in6_address(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use secp256k1::SecretKey;

    #[test]
    fn pubkey_compress_roundtrip() {
        let sk = SecretKey::new(&mut OsRng);
        let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &sk);
        let id = decompress_pubkey(&pk);
        let pk2 = compress_pubkey(id).unwrap();
        assert_eq!(pk, pk2);
    }

    #[test]
    fn snappy_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let compressed = snappy_compress(data.clone()).unwrap();
        assert_eq!(snappy_decompress(&compressed).unwrap(), data);
    }
}

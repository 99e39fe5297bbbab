//! Initiator side of the RLPx encrypted handshake.
//! Reference: https://github.com/ethereum/devp2p/blob/master/rlpx.md#initial-handshake

use aes::cipher::KeyIvInit;
use ethereum_types::{H256, H512, H520};
use rand::{Rng, rngs::OsRng};
use ragno_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use secp256k1::{PublicKey, SECP256K1, SecretKey};
use sha3::{Digest, Keccak256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::utils::{compress_pubkey, decompress_pubkey};

use super::{
    crypto::{ecdh_xchng, encrypt_message, sign_shared_secret},
    error::RLPxError,
};

/// auth-vsn of the handshake we speak.
const AUTH_VSN: u8 = 4;

pub(crate) type Aes256Ctr64BE = ctr::Ctr64BE<aes::Aes256>;

/// Symmetric state of an established RLPx connection, one direction each for
/// the AES stream and the running MAC.
#[derive(Clone)]
pub struct Established {
    pub mac_key: H256,
    pub ingress_mac: Keccak256,
    pub egress_mac: Keccak256,
    pub ingress_aes: Aes256Ctr64BE,
    pub egress_aes: Aes256Ctr64BE,
}

struct AuthMessage {
    signature: H520,
    initiator_pubkey: H512,
    nonce: H256,
    version: u8,
}

impl RLPEncode for AuthMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.initiator_pubkey)
            .encode_field(&self.nonce)
            .encode_field(&self.version)
            .finish();
    }
}

struct AckMessage {
    recipient_ephemeral_pubkey: H512,
    recipient_nonce: H256,
}

impl RLPDecode for AckMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (recipient_ephemeral_pubkey, decoder) = decoder.decode_field("recipientEphemeralPubkey")?;
        let (recipient_nonce, decoder) = decoder.decode_field("recipientNonce")?;
        let (_version, decoder): (u64, _) = decoder.decode_field("ackVsn")?;
        // EIP-8: ignore anything after the known fields
        let remaining = decoder.finish_unchecked();
        Ok((
            AckMessage {
                recipient_ephemeral_pubkey,
                recipient_nonce,
            },
            remaining,
        ))
    }
}

/// Runs the auth → ack exchange against the remote identified by
/// `remote_public_key`, returning the framing secrets.
pub async fn perform<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    signer: &SecretKey,
    remote_public_key: H512,
) -> Result<Established, RLPxError> {
    let remote_pubkey = compress_pubkey(remote_public_key).ok_or_else(|| {
        RLPxError::HandshakeError("invalid remote public key".to_string())
    })?;

    let local_nonce = H256::random_using(&mut OsRng);
    let local_ephemeral_key = SecretKey::new(&mut OsRng);

    let auth_bytes = send_auth(stream, signer, &remote_pubkey, local_nonce, &local_ephemeral_key)
        .await?;
    let (ack, ack_bytes) = receive_ack(stream, signer).await?;

    let remote_ephemeral_pubkey =
        compress_pubkey(ack.recipient_ephemeral_pubkey).ok_or_else(|| {
            RLPxError::HandshakeError("invalid remote ephemeral key".to_string())
        })?;

    Ok(derive_secrets(
        &local_ephemeral_key,
        &remote_ephemeral_pubkey,
        local_nonce,
        ack.recipient_nonce,
        &auth_bytes,
        &ack_bytes,
    ))
}

async fn send_auth<S: AsyncWrite + Unpin>(
    stream: &mut S,
    signer: &SecretKey,
    remote_pubkey: &PublicKey,
    local_nonce: H256,
    local_ephemeral_key: &SecretKey,
) -> Result<Vec<u8>, RLPxError> {
    let static_shared_secret = H256(ecdh_xchng(signer, remote_pubkey));
    let signature = sign_shared_secret(static_shared_secret, local_nonce, local_ephemeral_key)?;

    let auth = AuthMessage {
        signature,
        initiator_pubkey: decompress_pubkey(&PublicKey::from_secret_key(SECP256K1, signer)),
        nonce: local_nonce,
        version: AUTH_VSN,
    };

    // EIP-8 asks for some random padding after the plaintext body
    let mut auth_body = auth.encode_to_vec();
    let padding_len = OsRng.gen_range(100..=250);
    auth_body.resize(auth_body.len() + padding_len, 0);

    let wire = encrypt_message(remote_pubkey, auth_body)?;
    stream.write_all(&wire).await?;
    Ok(wire)
}

async fn receive_ack<S: AsyncRead + Unpin>(
    stream: &mut S,
    signer: &SecretKey,
) -> Result<(AckMessage, Vec<u8>), RLPxError> {
    let mut size_buf = [0u8; 2];
    stream.read_exact(&mut size_buf).await?;
    let ack_size = u16::from_be_bytes(size_buf) as usize;
    if ack_size < 65 + 16 + 32 {
        return Err(RLPxError::HandshakeError("ack message too short".to_string()));
    }

    let mut enc_ack_body = vec![0u8; ack_size];
    stream.read_exact(&mut enc_ack_body).await?;

    let ack_body = super::crypto::decrypt_message(signer, &enc_ack_body, &size_buf)?;
    let (ack, _) = AckMessage::decode_unfinished(&ack_body)?;

    let mut wire = size_buf.to_vec();
    wire.extend_from_slice(&enc_ack_body);
    Ok((ack, wire))
}

/// Derives the frame secrets from the exchanged material.
/// `auth_bytes`/`ack_bytes` are the full wire messages, size prefix included.
fn derive_secrets(
    local_ephemeral_key: &SecretKey,
    remote_ephemeral_pubkey: &PublicKey,
    local_nonce: H256,
    remote_nonce: H256,
    auth_bytes: &[u8],
    ack_bytes: &[u8],
) -> Established {
    let ephemeral_shared = ecdh_xchng(local_ephemeral_key, remote_ephemeral_pubkey);

    let hashed_nonces: [u8; 32] =
        Keccak256::digest([remote_nonce.0, local_nonce.0].concat()).into();
    let shared_secret: [u8; 32] =
        Keccak256::digest([ephemeral_shared, hashed_nonces].concat()).into();
    let aes_key: [u8; 32] =
        Keccak256::digest([ephemeral_shared, shared_secret].concat()).into();
    let mac_key: [u8; 32] = Keccak256::digest([ephemeral_shared, aes_key].concat()).into();

    // egress-mac = keccak(mac-secret ^ remote-nonce || auth-sent)
    let mut egress_mac = Keccak256::default();
    egress_mac.update((H256(mac_key) ^ remote_nonce).0);
    egress_mac.update(auth_bytes);

    // ingress-mac = keccak(mac-secret ^ local-nonce || ack-received)
    let mut ingress_mac = Keccak256::default();
    ingress_mac.update((H256(mac_key) ^ local_nonce).0);
    ingress_mac.update(ack_bytes);

    let ingress_aes = Aes256Ctr64BE::new(&aes_key.into(), &[0; 16].into());
    let egress_aes = ingress_aes.clone();

    Established {
        mac_key: H256(mac_key),
        ingress_mac,
        egress_mac,
        ingress_aes,
        egress_aes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_encodes_as_four_field_list() {
        let auth = AuthMessage {
            signature: H520::zero(),
            initiator_pubkey: H512::zero(),
            nonce: H256::zero(),
            version: AUTH_VSN,
        };
        let encoded = auth.encode_to_vec();
        let decoder = Decoder::new(&encoded).unwrap();
        let (_sig, decoder): (H520, _) = decoder.decode_field("sig").unwrap();
        let (_pk, decoder): (H512, _) = decoder.decode_field("pk").unwrap();
        let (_nonce, decoder): (H256, _) = decoder.decode_field("nonce").unwrap();
        let (version, decoder): (u8, _) = decoder.decode_field("version").unwrap();
        decoder.finish().unwrap();
        assert_eq!(version, AUTH_VSN);
    }

    #[test]
    fn ack_decode_ignores_eip8_trailing_fields(){
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&H512::repeat_byte(2))
            .encode_field(&H256::repeat_byte(3))
            .encode_field(&4u8)
            .encode_field(&"future-proof-field")
            .finish();
        let ack = AckMessage::decode(&buf).unwrap();
        assert_eq!(ack.recipient_ephemeral_pubkey, H512::repeat_byte(2));
        assert_eq!(ack.recipient_nonce, H256::repeat_byte(3));
    }
}

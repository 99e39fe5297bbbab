//! ECIES primitives for the RLPx handshake.
//! Reference: https://github.com/ethereum/devp2p/blob/master/rlpx.md#ecies-encryption

use aes::cipher::{KeyIvInit, StreamCipher};
use ethereum_types::{H128, H256, H520};
use rand::rngs::OsRng;
use secp256k1::{PublicKey, SECP256K1, SecretKey, ecdsa::RecoverableSignature};

use super::error::RLPxError;

type Aes128Ctr64BE = ctr::Ctr64BE<aes::Aes128>;

type Result<T> = std::result::Result<T, RLPxError>;

/// Raw ECDH: the x coordinate of the shared curve point.
pub fn ecdh_xchng(secret_key: &SecretKey, public_key: &PublicKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(public_key, secret_key);
    let mut shared = [0u8; 32];
    shared.copy_from_slice(&point[..32]);
    shared
}

/// NIST SP 800-56 concatenation KDF, as required by ECIES.
pub fn kdf(secret: &[u8], output: &mut [u8]) -> Result<()> {
    // the `other_info` field is unused
    concat_kdf::derive_key_into::<sha2::Sha256>(secret, &[], output)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    sha2::Sha256::digest(data).into()
}

pub fn sha256_hmac(key: &[u8], inputs: &[&[u8]], size_data: &[u8]) -> Result<[u8; 32]> {
    use hmac::Mac;
    let mut hasher = hmac::Hmac::<sha2::Sha256>::new_from_slice(key)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    for input in inputs {
        hasher.update(input);
    }
    hasher.update(size_data);
    Ok(hasher.finalize().into_bytes().into())
}

/// Signs `shared_secret ^ nonce` with the ephemeral key, yielding the 65-byte
/// recoverable signature carried in the auth message.
pub fn sign_shared_secret(
    shared_secret: H256,
    local_nonce: H256,
    local_ephemeral_key: &SecretKey,
) -> Result<H520> {
    let prehash = shared_secret ^ local_nonce;
    let msg = secp256k1::Message::from_digest_slice(prehash.as_bytes())
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    let (recovery_id, signature) = SECP256K1
        .sign_ecdsa_recoverable(&msg, local_ephemeral_key)
        .serialize_compact();
    let mut signature_bytes = [0u8; 65];
    signature_bytes[..64].copy_from_slice(&signature);
    signature_bytes[64] = recovery_id.to_i32() as u8;
    Ok(H520(signature_bytes))
}

/// Recovers the remote's ephemeral public key from an auth signature.
/// Only needed when acting as the handshake recipient; kept for the tests
/// that exercise both directions of [`sign_shared_secret`].
pub fn retrieve_remote_ephemeral_key(
    shared_secret: H256,
    remote_nonce: H256,
    signature: H520,
) -> Result<PublicKey> {
    let prehash = shared_secret ^ remote_nonce;
    let msg = secp256k1::Message::from_digest_slice(prehash.as_bytes())
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    let recovery_id = secp256k1::ecdsa::RecoveryId::from_i32(signature[64] as i32)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    let signature = RecoverableSignature::from_compact(&signature.as_bytes()[..64], recovery_id)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    SECP256K1
        .recover_ecdsa(&msg, &signature)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))
}

/// ECIES-encrypts a handshake message for the remote's static key.
/// Layout: size (2) || ephemeral-pubkey (65) || iv (16) || ciphertext || mac (32)
pub fn encrypt_message(remote_static_pubkey: &PublicKey, mut msg: Vec<u8>) -> Result<Vec<u8>> {
    const PUBKEY_SIZE: usize = 65;
    const IV_SIZE: usize = 16;
    const MAC_FOOTER_SIZE: usize = 32;

    let ecies_overhead = PUBKEY_SIZE + IV_SIZE + MAC_FOOTER_SIZE;
    let msg_size: u16 = (msg.len() + ecies_overhead)
        .try_into()
        .map_err(|_| RLPxError::InvalidMessageLength)?;
    let msg_size_bytes = msg_size.to_be_bytes();

    // a fresh keypair for this message only
    let message_secret_key = SecretKey::new(&mut OsRng);
    let message_secret = ecdh_xchng(&message_secret_key, remote_static_pubkey);

    let mut derived = [0u8; 32];
    kdf(&message_secret, &mut derived)?;
    let aes_key = &derived[..16];
    let mac_key = sha256(&derived[16..]);

    let iv = H128::random_using(&mut OsRng);
    let mut aes_cipher = Aes128Ctr64BE::new_from_slices(aes_key, iv.as_bytes())
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    aes_cipher
        .try_apply_keystream(&mut msg)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    let ciphertext = msg;

    let ephemeral_pubkey = PublicKey::from_secret_key(SECP256K1, &message_secret_key);
    let mac = sha256_hmac(&mac_key, &[iv.as_bytes(), &ciphertext], &msg_size_bytes)?;

    Ok([
        &msg_size_bytes[..],
        &ephemeral_pubkey.serialize_uncompressed(),
        iv.as_bytes(),
        &ciphertext,
        &mac,
    ]
    .concat())
}

/// Decrypts an ECIES handshake message. `msg` excludes the 2-byte size
/// prefix, which is passed separately for the MAC check.
pub fn decrypt_message(static_key: &SecretKey, msg: &[u8], size_data: &[u8]) -> Result<Vec<u8>> {
    if msg.len() < 65 + 16 + 32 {
        return Err(RLPxError::InvalidMessageLength);
    }
    // pubkey (65) || iv (16) || ciphertext || mac (32)
    let (pk, rest) = msg.split_at(65);
    let (iv, rest) = rest.split_at(16);
    let (ciphertext, mac) = rest.split_at(rest.len() - 32);

    let remote_pubkey = PublicKey::from_slice(pk)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    let shared_secret = ecdh_xchng(static_key, &remote_pubkey);

    let mut derived = [0u8; 32];
    kdf(&shared_secret, &mut derived)?;
    let aes_key = &derived[..16];
    let mac_key = sha256(&derived[16..]);

    let expected_mac = sha256_hmac(&mac_key, &[iv, ciphertext], size_data)?;
    if mac != expected_mac {
        return Err(RLPxError::InvalidMac);
    }

    let mut stream_cipher = Aes128Ctr64BE::new_from_slices(aes_key, iv)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    let mut decoded = ciphertext.to_vec();
    stream_cipher
        .try_apply_keystream(&mut decoded)
        .map_err(|e| RLPxError::CryptographyError(e.to_string()))?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_is_symmetric() {
        let a_sk = SecretKey::new(&mut OsRng);
        let b_sk = SecretKey::new(&mut OsRng);
        let a_pk = PublicKey::from_secret_key(SECP256K1, &a_sk);
        let b_pk = PublicKey::from_secret_key(SECP256K1, &b_sk);
        assert_eq!(ecdh_xchng(&a_sk, &b_pk), ecdh_xchng(&b_sk, &a_pk));
    }

    #[test]
    fn ecies_message_roundtrip() {
        let static_key = SecretKey::new(&mut OsRng);
        let static_pubkey = PublicKey::from_secret_key(SECP256K1, &static_key);

        let plaintext = b"auth body bytes".to_vec();
        let wire = encrypt_message(&static_pubkey, plaintext.clone()).unwrap();

        let (size, body) = wire.split_at(2);
        let decrypted = decrypt_message(&static_key, body, size).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ephemeral_key_recovers_from_signature() {
        let ephemeral = SecretKey::new(&mut OsRng);
        let shared = H256::random();
        let nonce = H256::random();
        let signature = sign_shared_secret(shared, nonce, &ephemeral).unwrap();
        let recovered = retrieve_remote_ephemeral_key(shared, nonce, signature).unwrap();
        assert_eq!(recovered, PublicKey::from_secret_key(SECP256K1, &ephemeral));
    }
}

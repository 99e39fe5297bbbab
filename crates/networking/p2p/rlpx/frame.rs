//! Framed codec over an established RLPx connection.
//! Reference: https://github.com/ethereum/devp2p/blob/master/rlpx.md#framing

use aes::{
    Aes256Enc,
    cipher::{BlockEncrypt as _, KeyInit as _, StreamCipher as _},
};
use bytes::{Buf, BufMut, BytesMut};
use ethereum_types::H128;
use ragno_rlp::{decode::RLPDecode, encode::RLPEncode};
use sha3::Digest as _;
use tokio_util::codec::{Decoder, Encoder};

use super::{error::RLPxError, handshake::Established, message::Message};

// Max RLPx message size, the same cap go-ethereum uses.
const MAX_MESSAGE_SIZE: usize = 0xFFFFFF;

pub struct RLPxCodec {
    state: Established,
    /// Size of a frame whose header was already consumed but whose body has
    /// not fully arrived. The MAC/AES states advance as bytes are processed,
    /// so the header must never be run through them twice.
    pending_frame_size: Option<usize>,
}

impl RLPxCodec {
    pub fn new(state: Established) -> Self {
        Self {
            state,
            pending_frame_size: None,
        }
    }

    fn mac_cipher(&self) -> Result<Aes256Enc, RLPxError> {
        Aes256Enc::new_from_slice(self.state.mac_key.as_bytes())
            .map_err(|e| RLPxError::CryptographyError(e.to_string()))
    }
}

/// header-mac-seed = aes(mac-secret, keccak.digest(mac)[:16]) ^ seed_xor
fn mac_seed(
    mac: &sha3::Keccak256,
    cipher: &Aes256Enc,
    seed_xor: H128,
) -> Result<[u8; 16], RLPxError> {
    let digest: [u8; 16] = mac.clone().finalize()[..16]
        .try_into()
        .map_err(|_| RLPxError::CryptographyError("invalid mac digest".to_string()))?;
    let mut seed = digest.into();
    cipher.encrypt_block(&mut seed);
    Ok((H128(seed.into()) ^ seed_xor).0)
}

fn mac_digest(mac: &sha3::Keccak256) -> Result<[u8; 16], RLPxError> {
    mac.clone().finalize()[..16]
        .try_into()
        .map_err(|_| RLPxError::CryptographyError("invalid mac digest".to_string()))
}

impl Decoder for RLPxCodec {
    type Item = Message;
    type Error = RLPxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mac_aes_cipher = self.mac_cipher()?;

        let frame_size = match self.pending_frame_size {
            Some(frame_size) => frame_size,
            None => {
                if src.len() < 32 {
                    // not enough data for the frame header
                    return Ok(None);
                }
                let mut frame_header = [0; 32];
                frame_header.copy_from_slice(&src[..32]);
                src.advance(32);
                let (header_ciphertext, header_mac) = frame_header.split_at_mut(16);

                let header_mac_seed = mac_seed(
                    &self.state.ingress_mac,
                    &mac_aes_cipher,
                    H128(header_ciphertext.try_into().map_err(|_| {
                        RLPxError::CryptographyError("invalid header ciphertext length".to_string())
                    })?),
                )?;
                self.state.ingress_mac.update(header_mac_seed);
                let expected_header_mac = mac_digest(&self.state.ingress_mac)?;
                if header_mac != expected_header_mac {
                    return Err(RLPxError::InvalidMac);
                }

                let header_text = header_ciphertext;
                self.state.ingress_aes.apply_keystream(header_text);

                let frame_size =
                    u32::from_be_bytes([0, header_text[0], header_text[1], header_text[2]])
                        as usize;
                if frame_size.next_multiple_of(16) > MAX_MESSAGE_SIZE {
                    return Err(RLPxError::InvalidMessageLength);
                }
                self.pending_frame_size = Some(frame_size);
                frame_size
            }
        };

        let padded_size = frame_size.next_multiple_of(16);
        if src.len() < padded_size + 16 {
            // the full frame has not yet arrived
            src.reserve(padded_size + 16 - src.len());
            return Ok(None);
        }

        let mut frame_data = src[..padded_size + 16].to_vec();
        src.advance(padded_size + 16);
        self.pending_frame_size = None;
        let (frame_ciphertext, frame_mac) = frame_data.split_at_mut(padded_size);

        // frame-mac-seed folds the mac digest into itself
        self.state.ingress_mac.update(&*frame_ciphertext);
        let digest = mac_digest(&self.state.ingress_mac)?;
        let frame_mac_seed = mac_seed(&self.state.ingress_mac, &mac_aes_cipher, H128(digest))?;
        self.state.ingress_mac.update(frame_mac_seed);
        let expected_frame_mac = mac_digest(&self.state.ingress_mac)?;
        if frame_mac != expected_frame_mac {
            return Err(RLPxError::InvalidMac);
        }

        self.state.ingress_aes.apply_keystream(frame_ciphertext);
        let (frame_data, _padding) = frame_ciphertext.split_at(frame_size);

        let (msg_id, msg_data): (u8, _) = RLPDecode::decode_unfinished(frame_data)?;
        Ok(Some(Message::decode(msg_id, msg_data)?))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(RLPxError::Disconnected),
        }
    }
}

impl Encoder<Message> for RLPxCodec {
    type Error = RLPxError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mac_aes_cipher = self.mac_cipher()?;

        let mut frame_data = Vec::new();
        message.encode(&mut frame_data)?;

        // header = frame-size || header-data || padding
        let mut header = Vec::with_capacity(32);
        let frame_size = frame_data.len().to_be_bytes();
        header.extend_from_slice(&frame_size[5..8]);
        // header-data = [capability-id, context-id], both always zero
        (0_u8, 0_u8).encode(&mut header);
        header.resize(16, 0);
        self.state.egress_aes.apply_keystream(&mut header[..16]);

        let header_mac_seed = mac_seed(
            &self.state.egress_mac,
            &mac_aes_cipher,
            H128(header[..16].try_into().map_err(|_| {
                RLPxError::CryptographyError("invalid header length".to_string())
            })?),
        )?;
        self.state.egress_mac.update(header_mac_seed);
        let header_mac = mac_digest(&self.state.egress_mac)?;

        dst.put_slice(&header);
        dst.put_slice(&header_mac);

        // pad the frame to the cipher block size
        frame_data.resize(frame_data.len().next_multiple_of(16), 0);
        self.state.egress_aes.apply_keystream(&mut frame_data);
        let frame_ciphertext = frame_data;

        self.state.egress_mac.update(&frame_ciphertext);
        let digest = mac_digest(&self.state.egress_mac)?;
        let frame_mac_seed = mac_seed(&self.state.egress_mac, &mac_aes_cipher, H128(digest))?;
        self.state.egress_mac.update(frame_mac_seed);
        let frame_mac = mac_digest(&self.state.egress_mac)?;

        dst.put_slice(&frame_ciphertext);
        dst.put_slice(&frame_mac);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::handshake::Aes256Ctr64BE;
    use aes::cipher::KeyIvInit;
    use ethereum_types::H256;
    use sha3::Digest;

    /// Builds a pair of codecs whose ingress/egress states mirror each other,
    /// as the handshake would produce on either side of one connection.
    fn codec_pair() -> (RLPxCodec, RLPxCodec) {
        let mac_key = H256::random();
        let aes_key = H256::random();
        let aes = Aes256Ctr64BE::new(&aes_key.0.into(), &[0; 16].into());
        let mut mac_a = sha3::Keccak256::default();
        mac_a.update(b"a-side");
        let mut mac_b = sha3::Keccak256::default();
        mac_b.update(b"b-side");

        let alice = Established {
            mac_key,
            ingress_mac: mac_b.clone(),
            egress_mac: mac_a.clone(),
            ingress_aes: aes.clone(),
            egress_aes: aes.clone(),
        };
        let bob = Established {
            mac_key,
            ingress_mac: mac_a,
            egress_mac: mac_b,
            ingress_aes: aes.clone(),
            egress_aes: aes,
        };
        (RLPxCodec::new(alice), RLPxCodec::new(bob))
    }

    #[test]
    fn frame_roundtrip() {
        let (mut alice, mut bob) = codec_pair();

        let mut wire = BytesMut::new();
        alice
            .encode(Message::Ping(super::super::p2p::PingMessage {}), &mut wire)
            .unwrap();

        let decoded = bob.decode(&mut wire).unwrap().unwrap();
        assert!(matches!(decoded, Message::Ping(_)));
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_frame_resumes_cleanly() {
        let (mut alice, mut bob) = codec_pair();

        let mut wire = BytesMut::new();
        alice
            .encode(Message::Pong(super::super::p2p::PongMessage {}), &mut wire)
            .unwrap();

        // not even the header yet
        let mut buf = BytesMut::from(&wire[..20]);
        assert!(bob.decode(&mut buf).unwrap().is_none());

        // header complete, body still missing
        buf.extend_from_slice(&wire[20..40]);
        assert!(bob.decode(&mut buf).unwrap().is_none());

        // the rest arrives and the same frame decodes
        buf.extend_from_slice(&wire[40..]);
        let decoded = bob.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Message::Pong(_)));
    }

    #[test]
    fn tampered_frame_fails_mac_check() {
        let (mut alice, mut bob) = codec_pair();

        let mut wire = BytesMut::new();
        alice
            .encode(Message::Ping(super::super::p2p::PingMessage {}), &mut wire)
            .unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        assert!(bob.decode(&mut wire).is_err());
    }
}

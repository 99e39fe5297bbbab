use bytes::{BufMut, Bytes};
use ethereum_types::{H32, H256, H264, H512, H520, U256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{RLP_EMPTY_LIST, RLP_NULL};

pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Writes the header of an RLP list with the given payload length.
/// The payload itself is written by the caller right after.
pub fn encode_list_header(payload_len: usize, buf: &mut dyn BufMut) {
    if payload_len < 56 {
        buf.put_u8(RLP_EMPTY_LIST + payload_len as u8);
    } else {
        let be_len = to_minimal_be_bytes(payload_len as u64);
        buf.put_u8(0xf7 + be_len.len() as u8);
        buf.put_slice(&be_len);
    }
}

/// Encodes a slice of bytes as an RLP string.
pub fn encode_bytes(bytes: &[u8], buf: &mut dyn BufMut) {
    if bytes.len() == 1 && bytes[0] < RLP_NULL {
        buf.put_u8(bytes[0]);
    } else if bytes.len() < 56 {
        buf.put_u8(RLP_NULL + bytes.len() as u8);
        buf.put_slice(bytes);
    } else {
        let be_len = to_minimal_be_bytes(bytes.len() as u64);
        buf.put_u8(0xb7 + be_len.len() as u8);
        buf.put_slice(&be_len);
        buf.put_slice(bytes);
    }
}

/// Big-endian representation without leading zero bytes; empty for zero.
fn to_minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn encode_unsigned(value: u64, buf: &mut dyn BufMut) {
    encode_bytes(&to_minimal_be_bytes(value), buf);
}

impl RLPEncode for bool {
    fn encode(&self, buf: &mut dyn BufMut) {
        if *self {
            buf.put_u8(0x01);
        } else {
            buf.put_u8(RLP_NULL);
        }
    }
}

impl RLPEncode for u8 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(*self as u64, buf);
    }
}

impl RLPEncode for u16 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(*self as u64, buf);
    }
}

impl RLPEncode for u32 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(*self as u64, buf);
    }
}

impl RLPEncode for u64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(*self, buf);
    }
}

impl RLPEncode for usize {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(*self as u64, buf);
    }
}

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for &str {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for U256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        let bytes = self.to_big_endian();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        encode_bytes(&bytes[first..], buf);
    }
}

impl RLPEncode for H32 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for H264 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for H512 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for H520 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for Ipv4Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(&self.octets(), buf);
    }
}

impl RLPEncode for Ipv6Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(&self.octets(), buf);
    }
}

impl RLPEncode for IpAddr {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            IpAddr::V4(ip) => ip.encode(buf),
            IpAddr::V6(ip) => ip.encode(buf),
        }
    }
}

impl<T: RLPEncode> RLPEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut payload = Vec::new();
        for item in self {
            item.encode(&mut payload);
        }
        encode_list_header(payload.len(), buf);
        buf.put_slice(&payload);
    }
}

impl<A: RLPEncode, B: RLPEncode> RLPEncode for (A, B) {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut payload = Vec::new();
        self.0.encode(&mut payload);
        self.1.encode(&mut payload);
        encode_list_header(payload.len(), buf);
        buf.put_slice(&payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_integers() {
        assert_eq!(0u64.encode_to_vec(), vec![0x80]);
        assert_eq!(1u64.encode_to_vec(), vec![0x01]);
        assert_eq!(0x7fu64.encode_to_vec(), vec![0x7f]);
        assert_eq!(0x80u64.encode_to_vec(), vec![0x81, 0x80]);
        assert_eq!(1024u64.encode_to_vec(), vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn encode_strings() {
        assert_eq!("dog".encode_to_vec(), vec![0x83, b'd', b'o', b'g']);
        assert_eq!("".encode_to_vec(), vec![0x80]);
        let long = "Lorem ipsum dolor sit amet, consectetur adipisicing elit";
        let mut expected = vec![0xb8, 0x38];
        expected.extend_from_slice(long.as_bytes());
        assert_eq!(long.encode_to_vec(), expected);
    }

    #[test]
    fn encode_list_of_strings() {
        let list = vec!["cat".to_string(), "dog".to_string()];
        assert_eq!(
            list.encode_to_vec(),
            hex!("c88363617483646f67").to_vec()
        );
    }

    #[test]
    fn encode_empty_list() {
        let list: Vec<u8> = vec![];
        assert_eq!(list.encode_to_vec(), vec![0xc0]);
    }

    #[test]
    fn encode_u256() {
        let value = U256::from(0x0400u64);
        assert_eq!(value.encode_to_vec(), vec![0x82, 0x04, 0x00]);
    }
}

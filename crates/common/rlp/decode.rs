use bytes::Bytes;
use ethereum_types::{H32, H256, H264, H512, H520, U256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{RLP_EMPTY_LIST, RLP_NULL, error::RLPDecodeError};

pub trait RLPDecode: Sized {
    /// Decodes a value, returning it together with the bytes left after it.
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    /// Decodes a value, requiring the input to hold exactly one item.
    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (value, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok(value)
    }
}

/// Splits the next RLP item off the input.
/// Returns (is_list, payload, rest), where payload excludes the prefix.
pub fn decode_rlp_item(rlp: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let (prefix, rest) = rlp.split_first().ok_or(RLPDecodeError::InvalidLength)?;
    match prefix {
        0x00..=0x7f => Ok((false, &rlp[..1], rest)),
        0x80..=0xb7 => {
            let len = (prefix - RLP_NULL) as usize;
            split_payload(rest, len).map(|(payload, rest)| (false, payload, rest))
        }
        0xb8..=0xbf => {
            let len_len = (prefix - 0xb7) as usize;
            let (payload, rest) = split_long_payload(rest, len_len)?;
            Ok((false, payload, rest))
        }
        0xc0..=0xf7 => {
            let len = (prefix - RLP_EMPTY_LIST) as usize;
            split_payload(rest, len).map(|(payload, rest)| (true, payload, rest))
        }
        0xf8..=0xff => {
            let len_len = (prefix - 0xf7) as usize;
            let (payload, rest) = split_long_payload(rest, len_len)?;
            Ok((true, payload, rest))
        }
    }
}

/// Like [`decode_rlp_item`] but keeps the item's prefix in the returned slice.
pub fn get_rlp_item_with_prefix(rlp: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, payload, rest) = decode_rlp_item(rlp)?;
    let item_len = rlp.len() - rest.len();
    debug_assert!(payload.len() <= item_len);
    Ok((&rlp[..item_len], rest))
}

fn split_payload(data: &[u8], len: usize) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    if data.len() < len {
        return Err(RLPDecodeError::InvalidLength);
    }
    Ok(data.split_at(len))
}

fn split_long_payload(data: &[u8], len_len: usize) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    if len_len > 8 || data.len() < len_len {
        return Err(RLPDecodeError::InvalidLength);
    }
    let mut len: u64 = 0;
    for byte in &data[..len_len] {
        len = (len << 8) | *byte as u64;
    }
    if len < 56 {
        // must have used the short form
        return Err(RLPDecodeError::MalformedData);
    }
    split_payload(&data[len_len..], len as usize)
}

fn decode_unsigned(rlp: &[u8]) -> Result<(u64, &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(rlp)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    if payload.len() > 8 {
        return Err(RLPDecodeError::InvalidLength);
    }
    if payload.first() == Some(&0) {
        // leading zeros are not canonical
        return Err(RLPDecodeError::MalformedData);
    }
    let mut value: u64 = 0;
    for byte in payload {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, rest))
}

fn decode_fixed_bytes<const N: usize>(rlp: &[u8]) -> Result<([u8; N], &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(rlp)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    let bytes: [u8; N] = payload
        .try_into()
        .map_err(|_| RLPDecodeError::InvalidLength)?;
    Ok((bytes, rest))
}

impl RLPDecode for bool {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (prefix, rest) = rlp.split_first().ok_or(RLPDecodeError::InvalidLength)?;
        match *prefix {
            0x01 => Ok((true, rest)),
            RLP_NULL => Ok((false, rest)),
            _ => Err(RLPDecodeError::MalformedBoolean),
        }
    }
}

impl RLPDecode for u8 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = decode_unsigned(rlp)?;
        let value = value.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for u16 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = decode_unsigned(rlp)?;
        let value = value.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for u32 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = decode_unsigned(rlp)?;
        let value = value.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for u64 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_unsigned(rlp)
    }
}

impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes(rlp)
    }
}

impl RLPDecode for String {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if is_list {
            return Err(RLPDecodeError::UnexpectedList);
        }
        let value =
            String::from_utf8(payload.to_vec()).map_err(|_| RLPDecodeError::MalformedData)?;
        Ok((value, rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if is_list {
            return Err(RLPDecodeError::UnexpectedList);
        }
        Ok((Bytes::copy_from_slice(payload), rest))
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if is_list {
            return Err(RLPDecodeError::UnexpectedList);
        }
        if payload.len() > 32 {
            return Err(RLPDecodeError::InvalidLength);
        }
        if payload.first() == Some(&0) {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((U256::from_big_endian(payload), rest))
    }
}

impl RLPDecode for H32 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes(rlp).map(|(bytes, rest)| (H32(bytes), rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes(rlp).map(|(bytes, rest)| (H256(bytes), rest))
    }
}

impl RLPDecode for H264 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes(rlp).map(|(bytes, rest)| (H264(bytes), rest))
    }
}

impl RLPDecode for H512 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes(rlp).map(|(bytes, rest)| (H512(bytes), rest))
    }
}

impl RLPDecode for H520 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes(rlp).map(|(bytes, rest)| (H520(bytes), rest))
    }
}

impl RLPDecode for Ipv4Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes::<4>(rlp).map(|(octets, rest)| (Ipv4Addr::from(octets), rest))
    }
}

impl RLPDecode for Ipv6Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        decode_fixed_bytes::<16>(rlp).map(|(octets, rest)| (Ipv6Addr::from(octets), rest))
    }
}

impl RLPDecode for IpAddr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (_, payload, rest) = decode_rlp_item(rlp)?;
        match payload.len() {
            4 => {
                let octets: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                Ok((IpAddr::V4(Ipv4Addr::from(octets)), rest))
            }
            16 => {
                let octets: [u8; 16] = payload
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                Ok((IpAddr::V6(Ipv6Addr::from(octets)), rest))
            }
            _ => Err(RLPDecodeError::InvalidLength),
        }
    }
}

impl<T: RLPDecode> RLPDecode for Vec<T> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, mut payload, rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let mut items = Vec::new();
        while !payload.is_empty() {
            let (item, remaining) = T::decode_unfinished(payload)?;
            items.push(item);
            payload = remaining;
        }
        Ok((items, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::RLPEncode;
    use hex_literal::hex;

    #[test]
    fn decode_integers() {
        assert_eq!(u64::decode(&[0x80]).unwrap(), 0);
        assert_eq!(u64::decode(&[0x01]).unwrap(), 1);
        assert_eq!(u64::decode(&[0x82, 0x04, 0x00]).unwrap(), 1024);
        assert!(u64::decode(&[0x82, 0x00, 0x01]).is_err());
    }

    #[test]
    fn decode_strings() {
        assert_eq!(String::decode(&hex!("83646f67")).unwrap(), "dog");
        assert_eq!(String::decode(&[0x80]).unwrap(), "");
    }

    #[test]
    fn decode_list_of_strings() {
        let decoded: Vec<String> = Vec::decode(&hex!("c88363617483646f67")).unwrap();
        assert_eq!(decoded, vec!["cat".to_string(), "dog".to_string()]);
    }

    #[test]
    fn roundtrip_ip_addresses() {
        for ip in [
            IpAddr::V4(Ipv4Addr::new(18, 138, 108, 67)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            let encoded = ip.encode_to_vec();
            assert_eq!(IpAddr::decode(&encoded).unwrap(), ip);
        }
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        assert!(u64::decode(&[0x01, 0x02]).is_err());
    }
}

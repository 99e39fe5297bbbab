use bytes::BufMut;

use crate::{
    decode::{RLPDecode, decode_rlp_item, get_rlp_item_with_prefix},
    encode::{RLPEncode, encode_list_header},
    error::RLPDecodeError,
};

/// Helper for decoding the fields of an RLP list one by one.
///
/// ```
/// # use ragno_rlp::structs::Decoder;
/// # use ragno_rlp::encode::RLPEncode;
/// let encoded = (5u8, 10u8).encode_to_vec();
/// let decoder = Decoder::new(&encoded).unwrap();
/// let (a, decoder): (u8, _) = decoder.decode_field("a").unwrap();
/// let (b, decoder): (u8, _) = decoder.decode_field("b").unwrap();
/// decoder.finish().unwrap();
/// assert_eq!((a, b), (5, 10));
/// ```
#[derive(Debug)]
#[must_use = "the decoder consumes the payload as fields are read"]
pub struct Decoder<'a> {
    payload: &'a [u8],
    remaining: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(rlp: &'a [u8]) -> Result<Self, RLPDecodeError> {
        let (is_list, payload, remaining) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        Ok(Self { payload, remaining })
    }

    pub fn get_payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn decode_field<T: RLPDecode>(
        self,
        name: &'static str,
    ) -> Result<(T, Self), RLPDecodeError> {
        if self.payload.is_empty() {
            return Err(RLPDecodeError::MissingField(name));
        }
        let (value, rest) = T::decode_unfinished(self.payload)?;
        Ok((
            value,
            Self {
                payload: rest,
                ..self
            },
        ))
    }

    /// Decodes a trailing optional field: `None` when the payload is already
    /// exhausted or the next item fails to decode.
    pub fn decode_optional_field<T: RLPDecode>(self) -> (Option<T>, Self) {
        match T::decode_unfinished(self.payload) {
            Ok((value, rest)) => (
                Some(value),
                Self {
                    payload: rest,
                    ..self
                },
            ),
            Err(_) => (None, self),
        }
    }

    /// Returns the next item as raw bytes including its RLP prefix, so it can
    /// later be decoded with `T::decode`.
    pub fn get_encoded_item(self) -> Result<(Vec<u8>, Self), RLPDecodeError> {
        let (item, rest) = get_rlp_item_with_prefix(self.payload)?;
        Ok((
            item.to_vec(),
            Self {
                payload: rest,
                ..self
            },
        ))
    }

    /// Requires the list payload to be fully consumed.
    pub fn finish(self) -> Result<&'a [u8], RLPDecodeError> {
        if !self.payload.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(self.remaining)
    }

    /// Ignores any unread trailing items in the list.
    pub fn finish_unchecked(self) -> &'a [u8] {
        self.remaining
    }
}

/// Helper for encoding the fields of an RLP list one by one.
/// The list header is written on `finish`, once the payload length is known.
#[must_use = "the encoder only writes the list on finish"]
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
    payload: Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self {
            buf,
            payload: Vec::new(),
        }
    }

    pub fn encode_field<T: RLPEncode>(mut self, value: &T) -> Self {
        value.encode(&mut self.payload);
        self
    }

    /// Encodes a trailing optional field, skipped entirely when `None`.
    pub fn encode_optional_field<T: RLPEncode>(mut self, value: &Option<T>) -> Self {
        if let Some(value) = value {
            value.encode(&mut self.payload);
        }
        self
    }

    /// Appends raw payload bytes produced by the given closure.
    pub fn encode_with<F: FnOnce(&mut dyn BufMut)>(mut self, f: F) -> Self {
        f(&mut self.payload);
        self
    }

    pub fn finish(self) {
        encode_list_header(self.payload.len(), self.buf);
        self.buf.put_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_decoder_roundtrip() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&42u64)
            .encode_field(&"spider")
            .finish();

        let decoder = Decoder::new(&buf).unwrap();
        let (number, decoder): (u64, _) = decoder.decode_field("number").unwrap();
        let (name, decoder): (String, _) = decoder.decode_field("name").unwrap();
        assert!(decoder.finish().unwrap().is_empty());
        assert_eq!(number, 42);
        assert_eq!(name, "spider");
    }

    #[test]
    fn optional_trailing_field() {
        let mut with = Vec::new();
        Encoder::new(&mut with)
            .encode_field(&7u8)
            .encode_optional_field(&Some(9u64))
            .finish();
        let decoder = Decoder::new(&with).unwrap();
        let (_, decoder): (u8, _) = decoder.decode_field("first").unwrap();
        let (opt, _): (Option<u64>, _) = decoder.decode_optional_field();
        assert_eq!(opt, Some(9));

        let mut without = Vec::new();
        Encoder::new(&mut without).encode_field(&7u8).finish();
        let decoder = Decoder::new(&without).unwrap();
        let (_, decoder): (u8, _) = decoder.decode_field("first").unwrap();
        let (opt, _): (Option<u64>, _) = decoder.decode_optional_field();
        assert_eq!(opt, None);
    }

    #[test]
    fn nested_payload_via_encode_with() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&1u8)
            .encode_with(|b| 2u8.encode(b))
            .finish();
        let decoder = Decoder::new(&buf).unwrap();
        let (a, decoder): (u8, _) = decoder.decode_field("a").unwrap();
        let (b, decoder): (u8, _) = decoder.decode_field("b").unwrap();
        decoder.finish().unwrap();
        assert_eq!((a, b), (1, 2));
    }
}

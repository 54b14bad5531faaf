use bytes::BufMut;

use crate::decode::{RLPDecode, decode_rlp_item};
use crate::encode::{RLPEncode, encode_list_header};
use crate::error::RLPDecodeError;

/// Builder for the RLP encoding of a struct as a list of fields.
///
/// ```ignore
/// Encoder::new(&mut buf)
///     .encode_field(&self.number)
///     .encode_field(&self.hash)
///     .finish();
/// ```
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

    /// Writes the list header and payload into the target buffer.
    pub fn finish(self) {
        encode_list_header(self.payload.len(), self.buf);
        self.buf.put_slice(&self.payload);
    }
}

/// Field-by-field decoder over the payload of an RLP list.
///
/// Consumed and returned on each call so partially decoded state cannot be
/// reused by accident.
#[derive(Debug)]
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

    pub fn decode_field<T: RLPDecode>(self, name: &str) -> Result<(T, Self), RLPDecodeError> {
        let (value, rest) = T::decode_unfinished(self.payload)
            .map_err(|_| RLPDecodeError::InvalidField(name.to_string()))?;
        Ok((
            value,
            Self {
                payload: rest,
                remaining: self.remaining,
            },
        ))
    }

    pub fn is_done(&self) -> bool {
        self.payload.is_empty()
    }

    /// Asserts the list payload was fully consumed and returns the input that
    /// followed the list.
    pub fn finish(self) -> Result<&'a [u8], RLPDecodeError> {
        if !self.payload.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(self.remaining)
    }
}

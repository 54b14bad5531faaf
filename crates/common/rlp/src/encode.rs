use bytes::BufMut;
use bytes::Bytes;
use ethereum_types::{Address, Bloom, H256, H512, U256};

use crate::constants::{RLP_EMPTY_LIST, RLP_NULL};

pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Length of the encoding of `self`, header included.
    fn length(&self) -> usize {
        self.encode_to_vec().len()
    }
}

/// Writes the header of an RLP string of the given payload length.
/// The payload itself is written by the caller.
pub fn encode_string_header(payload_len: usize, buf: &mut dyn BufMut) {
    if payload_len < 56 {
        buf.put_u8(RLP_NULL + payload_len as u8);
    } else {
        let len_bytes = minimal_be_bytes(payload_len as u64);
        buf.put_u8(0xb7 + len_bytes.len() as u8);
        buf.put_slice(&len_bytes);
    }
}

/// Writes the header of an RLP list whose encoded payload has the given length.
pub fn encode_list_header(payload_len: usize, buf: &mut dyn BufMut) {
    if payload_len < 56 {
        buf.put_u8(RLP_EMPTY_LIST + payload_len as u8);
    } else {
        let len_bytes = minimal_be_bytes(payload_len as u64);
        buf.put_u8(0xf7 + len_bytes.len() as u8);
        buf.put_slice(&len_bytes);
    }
}

fn encode_bytes(payload: &[u8], buf: &mut dyn BufMut) {
    if payload.len() == 1 && payload[0] < RLP_NULL {
        buf.put_u8(payload[0]);
    } else {
        encode_string_header(payload.len(), buf);
        buf.put_slice(payload);
    }
}

/// Big-endian representation with leading zero bytes stripped.
/// Zero encodes as the empty byte string.
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
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

impl RLPEncode for u64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(&minimal_be_bytes(*self), buf);
    }
}

impl RLPEncode for u32 {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self as u64).encode(buf);
    }
}

impl RLPEncode for u16 {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self as u64).encode(buf);
    }
}

impl RLPEncode for usize {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self as u64).encode(buf);
    }
}

impl RLPEncode for U256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        let bytes = self.to_big_endian();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(32);
        encode_bytes(&bytes[first..], buf);
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for H512 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for Address {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for Bloom {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for &[u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf);
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

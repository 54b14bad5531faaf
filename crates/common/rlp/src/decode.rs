use bytes::Bytes;
use ethereum_types::{Address, Bloom, H256, H512, U256};

use crate::constants::RLP_NULL;
use crate::error::RLPDecodeError;

pub trait RLPDecode: Sized {
    /// Decodes one RLP item from the front of `rlp`, returning the value and
    /// the remaining input.
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (value, rest) = Self::decode_unfinished(rlp)?;
        if !rest.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(value)
    }
}

/// Splits one RLP item off the front of the input.
/// Returns `(is_list, payload, rest)`.
pub fn decode_rlp_item(rlp: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first = *rlp.first().ok_or(RLPDecodeError::UnexpectedEof)?;
    match first {
        0x00..=0x7f => Ok((false, &rlp[..1], &rlp[1..])),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            let payload = rlp.get(1..1 + len).ok_or(RLPDecodeError::UnexpectedEof)?;
            // A single byte below 0x80 must be encoded as itself
            if len == 1 && payload[0] < RLP_NULL {
                return Err(RLPDecodeError::MalformedData);
            }
            Ok((false, payload, &rlp[1 + len..]))
        }
        0xb8..=0xbf => {
            let len_len = (first - 0xb7) as usize;
            let len = decode_length_bytes(rlp.get(1..1 + len_len).ok_or(RLPDecodeError::UnexpectedEof)?)?;
            if len < 56 {
                return Err(RLPDecodeError::InvalidLength);
            }
            let payload = rlp
                .get(1 + len_len..1 + len_len + len)
                .ok_or(RLPDecodeError::UnexpectedEof)?;
            Ok((false, payload, &rlp[1 + len_len + len..]))
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            let payload = rlp.get(1..1 + len).ok_or(RLPDecodeError::UnexpectedEof)?;
            Ok((true, payload, &rlp[1 + len..]))
        }
        0xf8..=0xff => {
            let len_len = (first - 0xf7) as usize;
            let len = decode_length_bytes(rlp.get(1..1 + len_len).ok_or(RLPDecodeError::UnexpectedEof)?)?;
            if len < 56 {
                return Err(RLPDecodeError::InvalidLength);
            }
            let payload = rlp
                .get(1 + len_len..1 + len_len + len)
                .ok_or(RLPDecodeError::UnexpectedEof)?;
            Ok((true, payload, &rlp[1 + len_len + len..]))
        }
    }
}

fn decode_length_bytes(bytes: &[u8]) -> Result<usize, RLPDecodeError> {
    if bytes.is_empty() || bytes[0] == 0 {
        return Err(RLPDecodeError::InvalidLength);
    }
    if bytes.len() > size_of::<usize>() {
        return Err(RLPDecodeError::InvalidLength);
    }
    let mut len = 0usize;
    for byte in bytes {
        len = (len << 8) | *byte as usize;
    }
    Ok(len)
}

fn decode_string(rlp: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(rlp)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    Ok((payload, rest))
}

impl RLPDecode for bool {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        match payload {
            [] => Ok((false, rest)),
            [0x01] => Ok((true, rest)),
            _ => Err(RLPDecodeError::MalformedData),
        }
    }
}

impl RLPDecode for u64 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        if payload.len() > 8 || payload.first() == Some(&0) {
            return Err(RLPDecodeError::MalformedData);
        }
        let mut value = 0u64;
        for byte in payload {
            value = (value << 8) | *byte as u64;
        }
        Ok((value, rest))
    }
}

impl RLPDecode for u32 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = u64::decode_unfinished(rlp)?;
        let value = u32::try_from(value).map_err(|_| RLPDecodeError::MalformedData)?;
        Ok((value, rest))
    }
}

impl RLPDecode for u16 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = u64::decode_unfinished(rlp)?;
        let value = u16::try_from(value).map_err(|_| RLPDecodeError::MalformedData)?;
        Ok((value, rest))
    }
}

impl RLPDecode for usize {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = u64::decode_unfinished(rlp)?;
        Ok((value as usize, rest))
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        if payload.len() > 32 || payload.first() == Some(&0) {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((U256::from_big_endian(payload), rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        if payload.len() != 32 {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((H256::from_slice(payload), rest))
    }
}

impl RLPDecode for H512 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        if payload.len() != 64 {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((H512::from_slice(payload), rest))
    }
}

impl RLPDecode for Address {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        if payload.len() != 20 {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((Address::from_slice(payload), rest))
    }
}

impl RLPDecode for Bloom {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        if payload.len() != 256 {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((Bloom::from_slice(payload), rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_string(rlp)?;
        Ok((Bytes::copy_from_slice(payload), rest))
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
        assert_eq!(u64::decode(&[0x0f]).unwrap(), 15);
        assert_eq!(u64::decode(&[0x82, 0x04, 0x00]).unwrap(), 1024);
        // leading zero is non-canonical
        assert!(u64::decode(&[0x82, 0x00, 0x01]).is_err());
    }

    #[test]
    fn decode_rejects_non_canonical_single_byte() {
        // 0x7f must be encoded as itself, not as a one-byte string
        assert!(u64::decode(&[0x81, 0x7f]).is_err());
    }

    #[test]
    fn decode_hash_roundtrip() {
        let hash = H256::from(hex!(
            "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
        ));
        assert_eq!(H256::decode(&hash.encode_to_vec()).unwrap(), hash);
    }

    #[test]
    fn decode_list_roundtrip() {
        let list: Vec<u64> = vec![7, 77, 7777];
        assert_eq!(Vec::<u64>::decode(&list.encode_to_vec()).unwrap(), list);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        assert!(u64::decode(&[0x0f, 0x0f]).is_err());
    }
}

use bytes::{BufMut, Bytes};
use ethereum_types::{Address, H256, U256};

use ember_rlp::decode::RLPDecode;
use ember_rlp::encode::RLPEncode;
use ember_rlp::error::RLPDecodeError;
use ember_rlp::structs::{Decoder, Encoder};

use crate::utils::keccak;

/// Recipient of a transaction: a call to an address or a contract creation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TxKind {
    Call(Address),
    #[default]
    Create,
}

impl RLPEncode for TxKind {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            TxKind::Call(address) => address.encode(buf),
            TxKind::Create => Bytes::new().encode(buf),
        }
    }
}

impl RLPDecode for TxKind {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest): (Bytes, _) = Bytes::decode_unfinished(rlp)?;
        match bytes.len() {
            0 => Ok((TxKind::Create, rest)),
            20 => Ok((TxKind::Call(Address::from_slice(&bytes)), rest)),
            _ => Err(RLPDecodeError::MalformedData),
        }
    }
}

/// A signed transaction. Only the legacy shape is carried during fast sync;
/// execution never happens here, so the payload is opaque beyond hashing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: TxKind,
    pub value: U256,
    pub data: Bytes,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

impl Transaction {
    pub fn hash(&self) -> H256 {
        keccak(self.encode_to_vec())
    }
}

impl RLPEncode for Transaction {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.gas_price)
            .encode_field(&self.gas)
            .encode_field(&self.to)
            .encode_field(&self.value)
            .encode_field(&self.data)
            .encode_field(&self.v)
            .encode_field(&self.r)
            .encode_field(&self.s)
            .finish();
    }
}

impl RLPDecode for Transaction {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (gas_price, decoder) = decoder.decode_field("gas_price")?;
        let (gas, decoder) = decoder.decode_field("gas")?;
        let (to, decoder) = decoder.decode_field("to")?;
        let (value, decoder) = decoder.decode_field("value")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let (v, decoder) = decoder.decode_field("v")?;
        let (r, decoder) = decoder.decode_field("r")?;
        let (s, decoder) = decoder.decode_field("s")?;
        let remaining = decoder.finish()?;
        Ok((
            Transaction {
                nonce,
                gas_price,
                gas,
                to,
                value,
                data,
                v,
                r,
                s,
            },
            remaining,
        ))
    }
}

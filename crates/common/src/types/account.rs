use bytes::BufMut;
use ethereum_types::{H256, U256};
use hex_literal::hex;

use ember_rlp::decode::RLPDecode;
use ember_rlp::encode::RLPEncode;
use ember_rlp::error::RLPDecodeError;
use ember_rlp::structs::{Decoder, Encoder};

/// keccak256 of the empty byte string, the code hash of accounts without code.
pub const EMPTY_CODE_HASH: H256 = H256(hex!(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
));

/// The value stored in a state-trie leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

impl RLPEncode for AccountState {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.balance)
            .encode_field(&self.storage_root)
            .encode_field(&self.code_hash)
            .finish();
    }
}

impl RLPDecode for AccountState {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (balance, decoder) = decoder.decode_field("balance")?;
        let (storage_root, decoder) = decoder.decode_field("storage_root")?;
        let (code_hash, decoder) = decoder.decode_field("code_hash")?;
        let remaining = decoder.finish()?;
        Ok((
            AccountState {
                nonce,
                balance,
                storage_root,
                code_hash,
            },
            remaining,
        ))
    }
}

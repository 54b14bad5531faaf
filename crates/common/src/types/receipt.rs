use bytes::{BufMut, Bytes};
use ethereum_types::{Address, Bloom, H256};

use ember_rlp::decode::RLPDecode;
use ember_rlp::encode::RLPEncode;
use ember_rlp::error::RLPDecodeError;
use ember_rlp::structs::{Decoder, Encoder};
use ember_trie::compute_ordered_root;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl RLPEncode for Log {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.address)
            .encode_field(&self.topics)
            .encode_field(&self.data)
            .finish();
    }
}

impl RLPDecode for Log {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (address, decoder) = decoder.decode_field("address")?;
        let (topics, decoder) = decoder.decode_field("topics")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let remaining = decoder.finish()?;
        Ok((
            Log {
                address,
                topics,
                data,
            },
            remaining,
        ))
    }
}

/// Execution receipt of one transaction. `succeeded` is the post-Byzantium
/// status code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub succeeded: bool,
    pub cumulative_gas_used: u64,
    pub logs_bloom: Bloom,
    pub logs: Vec<Log>,
}

impl RLPEncode for Receipt {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.succeeded)
            .encode_field(&self.cumulative_gas_used)
            .encode_field(&self.logs_bloom)
            .encode_field(&self.logs)
            .finish();
    }
}

impl RLPDecode for Receipt {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (succeeded, decoder) = decoder.decode_field("succeeded")?;
        let (cumulative_gas_used, decoder) = decoder.decode_field("cumulative_gas_used")?;
        let (logs_bloom, decoder) = decoder.decode_field("logs_bloom")?;
        let (logs, decoder) = decoder.decode_field("logs")?;
        let remaining = decoder.finish()?;
        Ok((
            Receipt {
                succeeded,
                cumulative_gas_used,
                logs_bloom,
                logs,
            },
            remaining,
        ))
    }
}

pub fn compute_receipts_root(receipts: &[Receipt]) -> H256 {
    let encoded: Vec<Vec<u8>> = receipts.iter().map(|r| r.encode_to_vec()).collect();
    compute_ordered_root(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_trie::EMPTY_TRIE_ROOT;

    #[test]
    fn receipt_rlp_roundtrip() {
        let receipt = Receipt {
            succeeded: true,
            cumulative_gas_used: 42_000,
            logs_bloom: Bloom::default(),
            logs: vec![Log {
                address: Address::repeat_byte(0x0a),
                topics: vec![H256::repeat_byte(0x0b)],
                data: Bytes::from_static(b"payload"),
            }],
        };
        let decoded = Receipt::decode(&receipt.encode_to_vec()).unwrap();
        assert_eq!(decoded, receipt);
    }

    #[test]
    fn empty_receipt_list_has_empty_root() {
        assert_eq!(compute_receipts_root(&[]), EMPTY_TRIE_ROOT);
    }

    #[test]
    fn receipts_root_depends_on_order() {
        let receipt_a = Receipt {
            cumulative_gas_used: 1,
            ..Default::default()
        };
        let receipt_b = Receipt {
            cumulative_gas_used: 2,
            ..Default::default()
        };
        let root_ab = compute_receipts_root(&[receipt_a.clone(), receipt_b.clone()]);
        let root_ba = compute_receipts_root(&[receipt_b, receipt_a]);
        assert_ne!(root_ab, root_ba);
    }
}

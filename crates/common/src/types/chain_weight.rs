use bytes::BufMut;
use ethereum_types::U256;

use ember_rlp::decode::RLPDecode;
use ember_rlp::encode::RLPEncode;
use ember_rlp::error::RLPDecodeError;
use ember_rlp::structs::{Decoder, Encoder};

use crate::types::{BlockHeader, BlockNumber};

/// The fork-choice scalar: checkpoints dominate, accumulated difficulty
/// breaks ties. Monotonic along any canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ChainWeight {
    pub last_checkpoint_number: BlockNumber,
    pub total_difficulty: U256,
}

impl ChainWeight {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Weight of a child block on top of this weight.
    pub fn increase(&self, header: &BlockHeader) -> ChainWeight {
        ChainWeight {
            last_checkpoint_number: self.last_checkpoint_number,
            total_difficulty: self.total_difficulty + header.difficulty,
        }
    }
}

impl RLPEncode for ChainWeight {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.last_checkpoint_number)
            .encode_field(&self.total_difficulty)
            .finish();
    }
}

impl RLPDecode for ChainWeight {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (last_checkpoint_number, decoder) = decoder.decode_field("last_checkpoint_number")?;
        let (total_difficulty, decoder) = decoder.decode_field("total_difficulty")?;
        let remaining = decoder.finish()?;
        Ok((
            ChainWeight {
                last_checkpoint_number,
                total_difficulty,
            },
            remaining,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increase_accumulates_difficulty() {
        let weight = ChainWeight::zero();
        let header = BlockHeader {
            difficulty: U256::from(100u64),
            ..Default::default()
        };
        let next = weight.increase(&header);
        assert_eq!(next.total_difficulty, U256::from(100u64));
        assert!(next > weight);
    }

    #[test]
    fn checkpoint_dominates_difficulty() {
        let heavy = ChainWeight {
            last_checkpoint_number: 0,
            total_difficulty: U256::from(u64::MAX),
        };
        let checkpointed = ChainWeight {
            last_checkpoint_number: 1,
            total_difficulty: U256::from(1u64),
        };
        assert!(checkpointed > heavy);
    }

    #[test]
    fn weight_rlp_roundtrip() {
        let weight = ChainWeight {
            last_checkpoint_number: 12,
            total_difficulty: U256::from(34_567u64),
        };
        let decoded = ChainWeight::decode(&weight.encode_to_vec()).unwrap();
        assert_eq!(decoded, weight);
    }
}

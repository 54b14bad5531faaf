mod nibbles;
mod node;
mod ordered;

use ethereum_types::H256;
use hex_literal::hex;
use sha3::{Digest, Keccak256};

pub use nibbles::Nibbles;
pub use node::{Node, NodeDecodeError, NodeRef};
pub use ordered::compute_ordered_root;

/// Root hash of an empty Merkle-Patricia trie: keccak256(rlp("")).
pub const EMPTY_TRIE_ROOT: H256 = H256(hex!(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
));

pub(crate) fn keccak(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rlp::encode::RLPEncode;

    #[test]
    fn empty_trie_root_matches_keccak_of_empty_string() {
        let encoded_empty: &[u8] = &[];
        assert_eq!(keccak(&encoded_empty.encode_to_vec()), EMPTY_TRIE_ROOT);
    }
}

use ethereum_types::H256;

use ember_rlp::encode::{RLPEncode, encode_list_header, encode_string_header};

use crate::nibbles::Nibbles;
use crate::{EMPTY_TRIE_ROOT, keccak};

/// Root of the trie mapping rlp(index) to the given encoded items, as used
/// for a block's transactions and receipts roots.
pub fn compute_ordered_root(items: &[Vec<u8>]) -> H256 {
    if items.is_empty() {
        return EMPTY_TRIE_ROOT;
    }
    let mut root: Option<Box<BuildNode>> = None;
    for (index, item) in items.iter().enumerate() {
        let key = (index as u64).encode_to_vec();
        let path = Nibbles::from_bytes(&key);
        root = Some(insert(root, path, item.clone()));
    }
    match root {
        Some(node) => keccak(&node.encode()),
        None => EMPTY_TRIE_ROOT,
    }
}

enum BuildNode {
    Leaf {
        path: Nibbles,
        value: Vec<u8>,
    },
    Extension {
        prefix: Nibbles,
        child: Box<BuildNode>,
    },
    Branch {
        children: [Option<Box<BuildNode>>; 16],
        value: Vec<u8>,
    },
}

fn empty_children() -> [Option<Box<BuildNode>>; 16] {
    std::array::from_fn(|_| None)
}

fn insert(node: Option<Box<BuildNode>>, path: Nibbles, value: Vec<u8>) -> Box<BuildNode> {
    let Some(node) = node else {
        return Box::new(BuildNode::Leaf { path, value });
    };
    match *node {
        BuildNode::Leaf {
            path: leaf_path,
            value: leaf_value,
        } => {
            let common = leaf_path.common_prefix_len(&path);
            if common == leaf_path.len() && common == path.len() {
                return Box::new(BuildNode::Leaf { path, value });
            }
            let mut children = empty_children();
            let mut branch_value = Vec::new();
            if common == leaf_path.len() {
                branch_value = leaf_value;
            } else {
                let index = leaf_path.at(common) as usize;
                children[index] = Some(Box::new(BuildNode::Leaf {
                    path: leaf_path.slice_from(common + 1),
                    value: leaf_value,
                }));
            }
            if common == path.len() {
                branch_value = value;
            } else {
                let index = path.at(common) as usize;
                children[index] = Some(Box::new(BuildNode::Leaf {
                    path: path.slice_from(common + 1),
                    value,
                }));
            }
            let branch = Box::new(BuildNode::Branch {
                children,
                value: branch_value,
            });
            wrap_with_prefix(path.truncated(common), branch)
        }
        BuildNode::Extension { prefix, child } => {
            let common = prefix.common_prefix_len(&path);
            if common == prefix.len() {
                let child = insert(Some(child), path.slice_from(common), value);
                return Box::new(BuildNode::Extension { prefix, child });
            }
            let mut children = empty_children();
            let mut branch_value = Vec::new();
            // Descend side of the existing extension
            let index = prefix.at(common) as usize;
            let remainder = prefix.slice_from(common + 1);
            children[index] = Some(if remainder.is_empty() {
                child
            } else {
                Box::new(BuildNode::Extension {
                    prefix: remainder,
                    child,
                })
            });
            if common == path.len() {
                branch_value = value;
            } else {
                let index = path.at(common) as usize;
                children[index] = Some(Box::new(BuildNode::Leaf {
                    path: path.slice_from(common + 1),
                    value,
                }));
            }
            let branch = Box::new(BuildNode::Branch {
                children,
                value: branch_value,
            });
            wrap_with_prefix(prefix.truncated(common), branch)
        }
        BuildNode::Branch {
            mut children,
            value: branch_value,
        } => {
            if path.is_empty() {
                return Box::new(BuildNode::Branch {
                    children,
                    value,
                });
            }
            let index = path.at(0) as usize;
            let child = children[index].take();
            children[index] = Some(insert(child, path.slice_from(1), value));
            Box::new(BuildNode::Branch {
                children,
                value: branch_value,
            })
        }
    }
}

fn wrap_with_prefix(prefix: Nibbles, node: Box<BuildNode>) -> Box<BuildNode> {
    if prefix.is_empty() {
        node
    } else {
        Box::new(BuildNode::Extension {
            prefix,
            child: node,
        })
    }
}

impl BuildNode {
    /// Full RLP encoding of this node.
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            BuildNode::Leaf { path, value } => {
                path.compact_encode(true).as_slice().encode(&mut payload);
                value.as_slice().encode(&mut payload);
            }
            BuildNode::Extension { prefix, child } => {
                prefix.compact_encode(false).as_slice().encode(&mut payload);
                payload.extend_from_slice(&child.reference());
            }
            BuildNode::Branch { children, value } => {
                for child in children {
                    match child {
                        Some(node) => payload.extend_from_slice(&node.reference()),
                        None => payload.push(ember_rlp::constants::RLP_NULL),
                    }
                }
                value.as_slice().encode(&mut payload);
            }
        }
        let mut buf = Vec::new();
        encode_list_header(payload.len(), &mut buf);
        buf.extend_from_slice(&payload);
        buf
    }

    /// How this node appears inside its parent: inline when shorter than 32
    /// bytes, a hash string otherwise.
    fn reference(&self) -> Vec<u8> {
        let encoded = self.encode();
        if encoded.len() < 32 {
            encoded
        } else {
            let hash = keccak(&encoded);
            let mut buf = Vec::new();
            encode_string_header(32, &mut buf);
            buf.extend_from_slice(hash.as_bytes());
            buf
        }
    }
}

use ethereum_types::H256;
use thiserror::Error;

use ember_rlp::decode::decode_rlp_item;
use ember_rlp::error::RLPDecodeError;

use crate::nibbles::Nibbles;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeDecodeError {
    #[error("Node is not an RLP list")]
    NotAList,
    #[error("Node has {0} items, expected 2 or 17")]
    InvalidItemCount(usize),
    #[error("Invalid child reference")]
    InvalidChildRef,
    #[error("Invalid hex-prefix path")]
    InvalidPath,
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
}

/// Reference from a node to one of its children.
///
/// Children whose encoding is shorter than 32 bytes are embedded inline in
/// the parent instead of being stored under their own hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Empty,
    Hash(H256),
    Inline(Box<Node>),
}

/// A decoded Merkle-Patricia trie node, as retrieved from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Branch {
        children: Box<[NodeRef; 16]>,
        value: Vec<u8>,
    },
    Extension {
        prefix: Nibbles,
        child: NodeRef,
    },
    Leaf {
        path: Nibbles,
        value: Vec<u8>,
    },
}

/// One raw item of a node's RLP list: its payload plus whether it is a list,
/// and the full encoding (needed to recurse into inline children).
struct RawItem<'a> {
    is_list: bool,
    payload: &'a [u8],
    full: &'a [u8],
}

fn split_items(mut payload: &[u8]) -> Result<Vec<RawItem<'_>>, NodeDecodeError> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (is_list, item_payload, rest) = decode_rlp_item(payload)?;
        let full = &payload[..payload.len() - rest.len()];
        items.push(RawItem {
            is_list,
            payload: item_payload,
            full,
        });
        payload = rest;
    }
    Ok(items)
}

fn parse_child(item: &RawItem<'_>) -> Result<NodeRef, NodeDecodeError> {
    if item.is_list {
        return Ok(NodeRef::Inline(Box::new(Node::decode(item.full)?)));
    }
    match item.payload.len() {
        0 => Ok(NodeRef::Empty),
        32 => Ok(NodeRef::Hash(H256::from_slice(item.payload))),
        _ => Err(NodeDecodeError::InvalidChildRef),
    }
}

impl Node {
    pub fn decode(encoded: &[u8]) -> Result<Self, NodeDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(encoded)?;
        if !is_list {
            return Err(NodeDecodeError::NotAList);
        }
        if !rest.is_empty() {
            return Err(NodeDecodeError::Rlp(RLPDecodeError::MalformedData));
        }
        let items = split_items(payload)?;
        match items.len() {
            17 => {
                let mut children: [NodeRef; 16] = std::array::from_fn(|_| NodeRef::Empty);
                for (slot, item) in children.iter_mut().zip(&items[..16]) {
                    *slot = parse_child(item)?;
                }
                let value_item = &items[16];
                if value_item.is_list {
                    return Err(NodeDecodeError::InvalidChildRef);
                }
                Ok(Node::Branch {
                    children: Box::new(children),
                    value: value_item.payload.to_vec(),
                })
            }
            2 => {
                if items[0].is_list {
                    return Err(NodeDecodeError::InvalidPath);
                }
                let (path, is_leaf) = Nibbles::compact_decode(items[0].payload)
                    .ok_or(NodeDecodeError::InvalidPath)?;
                if is_leaf {
                    if items[1].is_list {
                        return Err(NodeDecodeError::InvalidChildRef);
                    }
                    Ok(Node::Leaf {
                        path,
                        value: items[1].payload.to_vec(),
                    })
                } else {
                    let child = parse_child(&items[1])?;
                    if child == NodeRef::Empty {
                        return Err(NodeDecodeError::InvalidChildRef);
                    }
                    Ok(Node::Extension {
                        prefix: path,
                        child,
                    })
                }
            }
            count => Err(NodeDecodeError::InvalidItemCount(count)),
        }
    }

    /// Hash references this node makes to other stored nodes, including those
    /// reachable through inline children.
    pub fn child_hashes(&self) -> Vec<H256> {
        let mut hashes = Vec::new();
        self.collect_child_hashes(&mut hashes);
        hashes
    }

    fn collect_child_hashes(&self, out: &mut Vec<H256>) {
        let collect_ref = |node_ref: &NodeRef, out: &mut Vec<H256>| match node_ref {
            NodeRef::Empty => {}
            NodeRef::Hash(hash) => out.push(*hash),
            NodeRef::Inline(node) => node.collect_child_hashes(out),
        };
        match self {
            Node::Branch { children, .. } => {
                for child in children.iter() {
                    collect_ref(child, out);
                }
            }
            Node::Extension { child, .. } => collect_ref(child, out),
            Node::Leaf { .. } => {}
        }
    }

    /// All values carried by this node, including values of inline children.
    pub fn values(&self) -> Vec<&[u8]> {
        let mut values = Vec::new();
        self.collect_values(&mut values);
        values
    }

    fn collect_values<'a>(&'a self, out: &mut Vec<&'a [u8]>) {
        match self {
            Node::Branch { children, value } => {
                if !value.is_empty() {
                    out.push(value);
                }
                for child in children.iter() {
                    if let NodeRef::Inline(node) = child {
                        node.collect_values(out);
                    }
                }
            }
            Node::Extension { child, .. } => {
                if let NodeRef::Inline(node) = child {
                    node.collect_values(out);
                }
            }
            Node::Leaf { value, .. } => {
                if !value.is_empty() {
                    out.push(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rlp::encode::RLPEncode;
    use ember_rlp::structs::Encoder;

    fn encode_leaf(path: &Nibbles, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&path.compact_encode(true).as_slice())
            .encode_field(&value)
            .finish();
        buf
    }

    #[test]
    fn decode_leaf_node() {
        let path = Nibbles::from_raw(vec![0xa, 0xb, 0xc]);
        let encoded = encode_leaf(&path, b"value");
        let node = Node::decode(&encoded).unwrap();
        assert_eq!(
            node,
            Node::Leaf {
                path: path.clone(),
                value: b"value".to_vec()
            }
        );
        assert!(node.child_hashes().is_empty());
        assert_eq!(node.values(), vec![b"value".as_slice()]);
    }

    #[test]
    fn decode_branch_with_hash_children() {
        let child_a = H256::repeat_byte(0x11);
        let child_b = H256::repeat_byte(0x22);
        let empty: &[u8] = &[];
        // Children at slots 0 and 5, no value
        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf);
        encoder = encoder.encode_field(&child_a);
        for _ in 1..5 {
            encoder = encoder.encode_field(&empty);
        }
        encoder = encoder.encode_field(&child_b);
        for _ in 6..17 {
            encoder = encoder.encode_field(&empty);
        }
        encoder.finish();

        let node = Node::decode(&buf).unwrap();
        assert_eq!(node.child_hashes(), vec![child_a, child_b]);
        assert!(node.values().is_empty());
    }

    #[test]
    fn decode_extension_with_inline_leaf() {
        let leaf_path = Nibbles::from_raw(vec![0x1]);
        let leaf = encode_leaf(&leaf_path, b"v");
        assert!(leaf.len() < 32);

        // Extension whose child is the inline leaf: encode the raw leaf list
        // as the second item by splicing it in manually.
        let prefix = Nibbles::from_raw(vec![0x2, 0x3]);
        let compact = prefix.compact_encode(false);
        let mut payload = Vec::new();
        compact.as_slice().encode(&mut payload);
        payload.extend_from_slice(&leaf);
        let mut buf = Vec::new();
        ember_rlp::encode::encode_list_header(payload.len(), &mut buf);
        buf.extend_from_slice(&payload);

        let node = Node::decode(&buf).unwrap();
        match &node {
            Node::Extension { prefix: p, child } => {
                assert_eq!(p, &prefix);
                assert!(matches!(child, NodeRef::Inline(_)));
            }
            other => panic!("expected extension, got {other:?}"),
        }
        assert!(node.child_hashes().is_empty());
        assert_eq!(node.values(), vec![b"v".as_slice()]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Node::decode(&[0x80]).is_err());
        assert!(Node::decode(&[0xc2, 0x01, 0x02, 0x03]).is_err());
    }
}

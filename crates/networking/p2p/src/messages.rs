use bytes::Bytes;
use ember_common::H256;
use ember_common::types::{BlockBody, BlockHash, BlockHeader, Receipt};

/// Start of a header range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(BlockHash),
    Number(u64),
}

impl From<u64> for HashOrNumber {
    fn from(number: u64) -> Self {
        HashOrNumber::Number(number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    pub id: u64,
    pub startblock: HashOrNumber,
    pub limit: u64,
    pub skip: u64,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaders {
    pub id: u64,
    pub block_headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockBodies {
    pub id: u64,
    pub block_hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBodies {
    pub id: u64,
    pub block_bodies: Vec<BlockBody>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReceipts {
    pub id: u64,
    pub block_hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipts {
    pub id: u64,
    pub receipts: Vec<Vec<Receipt>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetNodeData {
    pub id: u64,
    pub node_hashes: Vec<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub id: u64,
    pub nodes: Vec<Bytes>,
}

/// Typed messages exchanged with a peer. Wire framing, encryption, and the
/// byte-level codec live in the transport; the engine only sees this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(BlockHeaders),
    GetBlockBodies(GetBlockBodies),
    BlockBodies(BlockBodies),
    GetReceipts(GetReceipts),
    Receipts(Receipts),
    GetNodeData(GetNodeData),
    NodeData(NodeData),
}

/// Discriminant used to match a response against the request that expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    GetBlockHeaders,
    BlockHeaders,
    GetBlockBodies,
    BlockBodies,
    GetReceipts,
    Receipts,
    GetNodeData,
    NodeData,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::GetBlockHeaders(_) => MessageKind::GetBlockHeaders,
            Message::BlockHeaders(_) => MessageKind::BlockHeaders,
            Message::GetBlockBodies(_) => MessageKind::GetBlockBodies,
            Message::BlockBodies(_) => MessageKind::BlockBodies,
            Message::GetReceipts(_) => MessageKind::GetReceipts,
            Message::Receipts(_) => MessageKind::Receipts,
            Message::GetNodeData(_) => MessageKind::GetNodeData,
            Message::NodeData(_) => MessageKind::NodeData,
        }
    }

    pub fn request_id(&self) -> u64 {
        match self {
            Message::GetBlockHeaders(msg) => msg.id,
            Message::BlockHeaders(msg) => msg.id,
            Message::GetBlockBodies(msg) => msg.id,
            Message::BlockBodies(msg) => msg.id,
            Message::GetReceipts(msg) => msg.id,
            Message::Receipts(msg) => msg.id,
            Message::GetNodeData(msg) => msg.id,
            Message::NodeData(msg) => msg.id,
        }
    }
}

//! DAG nodes and blocks.
//!
//! A `Block` is the stored unit: a content id plus the bytes it hashes to.
//! A `Node` is a decoded block. Three node kinds exist:
//!
//! - `RawNode` (codec `RAW`): opaque bytes, no links. Parity shards are raw.
//! - `ProtoNode` (codec `DAG_NODE`): payload plus ordered named links.
//! - `RecoveryNode` (codec `RECOVERY_REEDSOLOMON`): a `ProtoNode` plus
//!   ordered links to parity shards.
//!
//! Plain node envelope:
//! ```text
//! [uvarint data_len][data]
//! [uvarint link_count]
//! repeated: [uvarint name_len][name][uvarint size][cid bytes]
//! ```
//!
//! Nodes are values: `clone()` is a deep, independent copy.

pub mod recovery_node;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::cid::{Cid, DAG_NODE, RAW};
use crate::error::{RecoveryError, Result};
use crate::varint::{push_varint, read_varint};

pub use recovery_node::{NodeStat, RecoveryNode};
pub use registry::{CodecRegistry, DecodeFn};

// ── Block ──────────────────────────────────────────────────────────

/// Content-addressed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Vec<u8>,
}

impl Block {
    /// Hash `data` under `codec`.
    pub fn new(codec: u64, data: Vec<u8>) -> Self {
        Self {
            cid: Cid::new(codec, &data),
            data,
        }
    }

    /// Pair bytes with a claimed id without hashing. Call `verify()` before
    /// trusting bytes that came from outside.
    pub fn with_cid(cid: Cid, data: Vec<u8>) -> Self {
        Self { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Re-hash the bytes and compare with the claimed id.
    pub fn verify(&self) -> Result<()> {
        let actual = Cid::new(self.cid.codec(), &self.data);
        if actual != self.cid {
            return Err(RecoveryError::CidMismatch {
                expected: self.cid,
                actual,
            });
        }
        Ok(())
    }
}

// ── Link ───────────────────────────────────────────────────────────

/// Named edge to a child. `size` is the cumulative byte size of the
/// linked subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub size: u64,
    pub cid: Cid,
}

impl Link {
    pub fn new(name: impl Into<String>, size: u64, cid: Cid) -> Self {
        Self {
            name: name.into(),
            size,
            cid,
        }
    }

    /// Link to `node` with its cumulative size.
    pub fn to_node(name: impl Into<String>, node: &Node) -> Self {
        Self::new(name, node.size(), node.cid())
    }
}

pub(crate) fn write_links(out: &mut Vec<u8>, links: &[Link]) {
    push_varint(out, links.len() as u64);
    for link in links {
        push_varint(out, link.name.len() as u64);
        out.extend_from_slice(link.name.as_bytes());
        push_varint(out, link.size);
        link.cid.write_bytes(out);
    }
}

/// Cursor over envelope bytes.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn varint(&mut self, what: &str) -> Result<u64> {
        let (value, n) = read_varint(&self.bytes[self.pos..])
            .ok_or_else(|| RecoveryError::InvalidFormat(format!("truncated {}", what)))?;
        self.pos += n;
        Ok(value)
    }

    pub(crate) fn slice(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.varint(what)? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| RecoveryError::InvalidFormat(format!("truncated {}", what)))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn cid(&mut self) -> Result<Cid> {
        let (cid, n) = Cid::read_bytes(&self.bytes[self.pos..])?;
        self.pos += n;
        Ok(cid)
    }

    pub(crate) fn links(&mut self) -> Result<Vec<Link>> {
        let count = self.varint("link count")? as usize;
        // Each link takes at least 35 bytes; reject counts the input can't hold.
        if count > self.bytes.len().saturating_sub(self.pos) {
            return Err(RecoveryError::InvalidFormat(format!(
                "link count {} exceeds envelope size",
                count
            )));
        }
        let mut links = Vec::with_capacity(count);
        for _ in 0..count {
            let name = std::str::from_utf8(self.slice("link name")?)
                .map_err(|e| RecoveryError::InvalidFormat(format!("link name: {}", e)))?
                .to_string();
            let size = self.varint("link size")?;
            let cid = self.cid()?;
            links.push(Link { name, size, cid });
        }
        Ok(links)
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(RecoveryError::InvalidFormat(format!(
                "{} trailing bytes",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

// ── RawNode ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNode {
    data: Vec<u8>,
}

impl RawNode {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn cid(&self) -> Cid {
        Cid::new(RAW, &self.data)
    }
}

// ── ProtoNode ──────────────────────────────────────────────────────

/// Plain DAG node: payload plus ordered links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtoNode {
    data: Vec<u8>,
    links: Vec<Link>,
}

impl ProtoNode {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            links: Vec::new(),
        }
    }

    pub fn with_links(data: Vec<u8>, links: Vec<Link>) -> Self {
        Self { data, links }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut [Link] {
        &mut self.links
    }

    pub fn add_link(&mut self, link: Link) {
        self.links.push(link);
    }

    /// Append a link to `child` under `name`.
    pub fn add_node_link(&mut self, name: impl Into<String>, child: &Node) {
        self.links.push(Link::to_node(name, child));
    }

    /// Remove every link named `name`. Returns how many were removed.
    pub fn remove_link(&mut self, name: &str) -> usize {
        let before = self.links.len();
        self.links.retain(|l| l.name != name);
        before - self.links.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 8 + self.links.len() * 48);
        push_varint(&mut out, self.data.len() as u64);
        out.extend_from_slice(&self.data);
        write_links(&mut out, &self.links);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let data = reader.slice("node data")?.to_vec();
        let links = reader.links()?;
        reader.finish()?;
        Ok(Self { data, links })
    }

    pub fn cid(&self) -> Cid {
        Cid::new(DAG_NODE, &self.encode())
    }
}

// ── Node ───────────────────────────────────────────────────────────

/// A decoded block of any supported kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Raw(RawNode),
    Proto(ProtoNode),
    Recovery(RecoveryNode),
}

impl Node {
    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Node::Raw(RawNode::new(data.into()))
    }

    /// Plain node with payload and no links.
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Node::Proto(ProtoNode::new(data.into()))
    }

    pub fn cid(&self) -> Cid {
        match self {
            Node::Raw(n) => n.cid(),
            Node::Proto(n) => n.cid(),
            Node::Recovery(n) => n.cid(),
        }
    }

    /// Serialized block bytes.
    pub fn raw_data(&self) -> Vec<u8> {
        match self {
            Node::Raw(n) => n.data.clone(),
            Node::Proto(n) => n.encode(),
            Node::Recovery(n) => n.encode(),
        }
    }

    pub fn to_block(&self) -> Block {
        let data = self.raw_data();
        let codec = match self {
            Node::Raw(_) => RAW,
            Node::Proto(_) => DAG_NODE,
            Node::Recovery(_) => crate::cid::RECOVERY_REEDSOLOMON,
        };
        Block::new(codec, data)
    }

    /// Ordinary child links (parity links are not included).
    pub fn links(&self) -> &[Link] {
        match self {
            Node::Raw(_) => &[],
            Node::Proto(n) => n.links(),
            Node::Recovery(n) => n.links(),
        }
    }

    /// Payload carried by the node itself.
    pub fn data(&self) -> &[u8] {
        match self {
            Node::Raw(n) => n.data(),
            Node::Proto(n) => n.data(),
            Node::Recovery(n) => n.proto().data(),
        }
    }

    /// Cumulative size: own block bytes plus every linked subtree.
    pub fn size(&self) -> u64 {
        match self {
            Node::Raw(n) => n.data.len() as u64,
            Node::Proto(n) => {
                n.encode().len() as u64 + n.links.iter().map(|l| l.size).sum::<u64>()
            }
            Node::Recovery(n) => n.size(),
        }
    }

    pub fn stat(&self) -> NodeStat {
        if let Node::Recovery(n) = self {
            return n.stat();
        }
        NodeStat {
            cid: self.cid().to_string(),
            num_links: self.links().len(),
            num_recovery_links: 0,
            block_size: self.raw_data().len(),
            data_size: self.data().len(),
            cumulative_size: self.size(),
        }
    }

    pub fn as_recovery(&self) -> Option<&RecoveryNode> {
        match self {
            Node::Recovery(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_recovery(self) -> Option<RecoveryNode> {
        match self {
            Node::Recovery(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_proto(&self) -> Option<&ProtoNode> {
        match self {
            Node::Proto(n) => Some(n),
            _ => None,
        }
    }

    /// The plain view of this node: a recovery node is unwrapped to the
    /// node it was built from, everything else is returned as is.
    pub fn into_plain(self) -> Node {
        match self {
            Node::Recovery(n) => Node::Proto(n.into_proto()),
            other => other,
        }
    }
}

impl From<RawNode> for Node {
    fn from(n: RawNode) -> Self {
        Node::Raw(n)
    }
}

impl From<ProtoNode> for Node {
    fn from(n: ProtoNode) -> Self {
        Node::Proto(n)
    }
}

impl From<RecoveryNode> for Node {
    fn from(n: RecoveryNode) -> Self {
        Node::Recovery(n)
    }
}

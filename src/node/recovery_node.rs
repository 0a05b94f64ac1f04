//! Recovery node: a plain node plus ordered links to its parity shards.
//!
//! Envelope:
//! ```text
//! [uvarint proto_len][plain node envelope]
//! [uvarint recovery_link_count]
//! repeated: [uvarint name_len][name][uvarint size][cid bytes]
//! ```
//!
//! Recovery links keep generation order: position `i` in the list is
//! parity row `i` of the coding matrix. They are never re-sorted.

use serde::Serialize;

use crate::cid::{Cid, RECOVERY_REEDSOLOMON};
use crate::error::Result;
use crate::node::{write_links, Link, Node, ProtoNode, Reader};
use crate::varint::push_varint;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryNode {
    proto: ProtoNode,
    recovery: Vec<Link>,
}

/// Summary of a node for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStat {
    pub cid: String,
    pub num_links: usize,
    pub num_recovery_links: usize,
    pub block_size: usize,
    pub data_size: usize,
    pub cumulative_size: u64,
}

impl RecoveryNode {
    /// Wrap a plain node. No parity links yet.
    pub fn new(proto: ProtoNode) -> Self {
        Self {
            proto,
            recovery: Vec::new(),
        }
    }

    pub fn with_recovery_links(proto: ProtoNode, recovery: Vec<Link>) -> Self {
        Self { proto, recovery }
    }

    /// The plain node this recovery node was built from.
    pub fn proto(&self) -> &ProtoNode {
        &self.proto
    }

    pub fn into_proto(self) -> ProtoNode {
        self.proto
    }

    /// Ordinary child links.
    pub fn links(&self) -> &[Link] {
        self.proto.links()
    }

    /// Links to parity shards, in generation order.
    pub fn recovery_links(&self) -> &[Link] {
        &self.recovery
    }

    /// Number of parity shards (M).
    pub fn recoverability(&self) -> usize {
        self.recovery.len()
    }

    /// Append a parity link to `node`, named by its position.
    pub fn add_recovery_link(&mut self, node: &Node) {
        self.recovery.push(Link::new(
            self.recovery.len().to_string(),
            node.raw_data().len() as u64,
            node.cid(),
        ));
    }

    /// Drop every parity link to `id`. Returns true if one was removed.
    pub fn remove_recovery_link(&mut self, id: &Cid) -> bool {
        let before = self.recovery.len();
        self.recovery.retain(|l| &l.cid != id);
        before != self.recovery.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let proto = self.proto.encode();
        let mut out = Vec::with_capacity(proto.len() + 8 + self.recovery.len() * 48);
        push_varint(&mut out, proto.len() as u64);
        out.extend_from_slice(&proto);
        write_links(&mut out, &self.recovery);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let proto = ProtoNode::decode(reader.slice("plain node")?)?;
        let recovery = reader.links()?;
        reader.finish()?;
        Ok(Self { proto, recovery })
    }

    pub fn cid(&self) -> Cid {
        Cid::new(RECOVERY_REEDSOLOMON, &self.encode())
    }

    /// Own block bytes plus every data and parity subtree.
    pub fn size(&self) -> u64 {
        self.encode().len() as u64
            + self.links().iter().map(|l| l.size).sum::<u64>()
            + self.recovery.iter().map(|l| l.size).sum::<u64>()
    }

    pub fn stat(&self) -> NodeStat {
        let block_size = self.encode().len();
        NodeStat {
            cid: self.cid().to_string(),
            num_links: self.links().len(),
            num_recovery_links: self.recovery.len(),
            block_size,
            data_size: self.proto.data().len(),
            cumulative_size: self.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecoveryNode {
        let mut proto = ProtoNode::new(b"1234567890".to_vec());
        proto.add_node_link("link", &Node::with_data("0987654321"));
        proto.add_node_link("link", &Node::with_data("1234509876"));
        let mut node = RecoveryNode::new(proto);
        for i in 0..12u8 {
            node.add_recovery_link(&Node::raw(vec![i; 16]));
        }
        node
    }

    #[test]
    fn test_envelope_decodes() {
        let node = sample();
        let decoded = RecoveryNode::decode(&node.encode()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.recoverability(), 12);
    }

    #[test]
    fn test_recovery_links_keep_generation_order() {
        let node = RecoveryNode::decode(&sample().encode()).unwrap();
        let names: Vec<&str> = node.recovery_links().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names[..3], ["0", "1", "2"]);
        assert_eq!(names[10], "10");
        assert_eq!(names[11], "11");
    }

    #[test]
    fn test_codec_differs_from_plain_node() {
        let node = sample();
        assert_eq!(node.cid().codec(), RECOVERY_REEDSOLOMON);
        assert_ne!(node.cid(), node.proto().cid());
    }

    #[test]
    fn test_edit_changes_identity() {
        let mut node = sample();
        let before = node.cid();
        let victim = node.recovery_links()[0].cid;

        assert!(node.remove_recovery_link(&victim));
        assert!(!node.remove_recovery_link(&victim));
        assert_ne!(node.cid(), before);
        assert_eq!(node.recoverability(), 11);
    }

    #[test]
    fn test_stat() {
        let node = sample();
        let stat = node.stat();
        assert_eq!(stat.num_links, 2);
        assert_eq!(stat.num_recovery_links, 12);
        assert_eq!(stat.data_size, 10);
        assert_eq!(stat.block_size, node.encode().len());
        assert!(stat.cumulative_size > stat.block_size as u64);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(RecoveryNode::decode(b"\x05abc").is_err());
    }
}

//! ShardSet - want/have bookkeeping for one recovery node.
//!
//! Positions `0..K` are the node's data children, `K..K+M` its parity
//! shards in generation order. Every position holds a vector of the same
//! width once known:
//!
//! ```text
//! data   shard: [uvarint len][child block bytes][zero padding]
//! parity shard: [width bytes]
//! ```
//!
//! The width is the size recorded on the parity links. Reconstruction is a
//! single Reed-Solomon solve over the known positions and only runs once at
//! least K are known. Every wanted position is materialized from that solve
//! or none is.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, warn};

use crate::cid::Cid;
use crate::error::{RecoveryError, Result};
use crate::node::{Block, CodecRegistry, Node, RecoveryNode};
use crate::varint::{read_varint, write_varint, varint_len};

struct Shard {
    cid: Cid,
    want: bool,
    node: Option<Node>,
    vector: Option<Vec<u8>>,
}

pub struct ShardSet {
    parent: Cid,
    rs: ReedSolomon,
    registry: Arc<CodecRegistry>,
    data_shards: usize,
    width: usize,
    shards: Vec<Shard>,
    positions: HashMap<Cid, Vec<usize>>,
    have: usize,
    /// Positions filled by reconstruction rather than by `fill`.
    recovered: Vec<usize>,
    reconstructions: usize,
}

impl ShardSet {
    /// Build the shard set for `node`.
    ///
    /// Fails with a validation error when the node has no children, no
    /// parity links, unequal child sizes, unequal parity sizes, or more
    /// than 256 shards in total.
    pub fn new(node: &RecoveryNode, registry: Arc<CodecRegistry>) -> Result<Self> {
        let links = node.links();
        let recovery = node.recovery_links();
        if links.is_empty() {
            return Err(RecoveryError::NoLinks);
        }
        let Some(first_parity) = recovery.first() else {
            return Err(RecoveryError::InvalidRecoverability(
                "node has no recovery links".into(),
            ));
        };
        if links.iter().any(|l| l.size != links[0].size) {
            return Err(RecoveryError::SizesNotEqual);
        }
        let width = first_parity.size as usize;
        if width == 0 || recovery.iter().any(|l| l.size as usize != width) {
            return Err(RecoveryError::InvalidRecoverability(
                "recovery links must share a non-zero size".into(),
            ));
        }
        let rs = ReedSolomon::new(links.len(), recovery.len()).map_err(|e| {
            RecoveryError::InvalidRecoverability(format!(
                "{} data + {} parity shards: {}",
                links.len(),
                recovery.len(),
                e
            ))
        })?;

        let mut shards = Vec::with_capacity(links.len() + recovery.len());
        let mut positions: HashMap<Cid, Vec<usize>> = HashMap::new();
        for (i, link) in links.iter().chain(recovery).enumerate() {
            positions.entry(link.cid).or_default().push(i);
            shards.push(Shard {
                cid: link.cid,
                want: false,
                node: None,
                vector: None,
            });
        }

        Ok(Self {
            parent: node.cid(),
            rs,
            registry,
            data_shards: links.len(),
            width,
            shards,
            positions,
            have: 0,
            recovered: Vec::new(),
            reconstructions: 0,
        })
    }

    /// Id of the recovery node this set belongs to.
    pub fn parent(&self) -> Cid {
        self.parent
    }

    /// Ids of every position, data first, then parity.
    pub fn ids(&self) -> Vec<Cid> {
        self.shards.iter().map(|s| s.cid).collect()
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.shards.len() - self.data_shards
    }

    /// Number of known positions.
    pub fn have(&self) -> usize {
        self.have
    }

    /// True once enough positions are known to reconstruct the rest.
    pub fn recoverable(&self) -> bool {
        self.have >= self.data_shards
    }

    /// Number of Reed-Solomon solves run so far.
    pub fn reconstructions(&self) -> usize {
        self.reconstructions
    }

    /// Mark `id` as wanted. Fails if `id` isn't one of the K+M shards.
    pub fn want(&mut self, id: &Cid) -> Result<()> {
        let positions = self
            .positions
            .get(id)
            .ok_or(RecoveryError::UnknownChild(*id))?;
        for &i in positions {
            self.shards[i].want = true;
        }
        Ok(())
    }

    /// Want every data shard.
    pub fn want_data(&mut self) {
        for shard in &mut self.shards[..self.data_shards] {
            shard.want = true;
        }
    }

    /// Want every data and parity shard.
    pub fn want_all(&mut self) {
        for shard in &mut self.shards {
            shard.want = true;
        }
    }

    /// Ids wanted but not yet known, each once, in position order.
    pub fn missing(&self) -> Vec<Cid> {
        let mut seen = HashSet::new();
        self.shards
            .iter()
            .filter(|s| s.want && s.node.is_none() && seen.insert(s.cid))
            .map(|s| s.cid)
            .collect()
    }

    /// Record a shard whose bytes became available.
    ///
    /// Unknown nodes and shards already known are ignored. Returns true
    /// while fewer than K positions are known.
    pub fn fill(&mut self, node: &Node) -> bool {
        let id = node.cid();
        let Some(positions) = self.positions.get(&id).cloned() else {
            warn!(parent = %self.parent, %id, "Ignoring node that is not a shard");
            return !self.recoverable();
        };

        let raw = node.raw_data();
        for i in positions {
            if self.shards[i].node.is_some() {
                continue;
            }
            let Some(vector) = self.vector_for(i, &raw) else {
                warn!(parent = %self.parent, %id, len = raw.len(), width = self.width,
                    "Ignoring shard that does not fit the shard width");
                continue;
            };
            let shard = &mut self.shards[i];
            shard.vector = Some(vector);
            shard.node = Some(node.clone());
            shard.want = false;
            self.have += 1;
            debug!(parent = %self.parent, position = i, have = self.have, "Filled shard");
        }

        !self.recoverable()
    }

    fn vector_for(&self, position: usize, raw: &[u8]) -> Option<Vec<u8>> {
        if position < self.data_shards {
            let prefix = varint_len(raw.len() as u64);
            if prefix + raw.len() > self.width {
                return None;
            }
            let mut vector = vec![0u8; self.width];
            let n = write_varint(&mut vector, raw.len() as u64);
            vector[n..n + raw.len()].copy_from_slice(raw);
            Some(vector)
        } else {
            (raw.len() == self.width).then(|| raw.to_vec())
        }
    }

    /// Get the node at `id`, reconstructing every wanted position if it
    /// isn't known yet.
    ///
    /// Fails with `RecoveryExceeded` while fewer than K positions are known.
    pub fn get(&mut self, id: &Cid) -> Result<Node> {
        self.want(id)?;
        if let Some(node) = self.known(id) {
            return Ok(node.clone());
        }
        if !self.recoverable() {
            return Err(RecoveryError::RecoveryExceeded);
        }

        self.reconstruct()?;
        self.known(id)
            .cloned()
            .ok_or(RecoveryError::RecoveryExceeded)
    }

    fn known(&self, id: &Cid) -> Option<&Node> {
        self.positions
            .get(id)?
            .iter()
            .find_map(|&i| self.shards[i].node.as_ref())
    }

    /// Reconstruct every wanted position not known yet.
    ///
    /// Returns every node this set has reconstructed so far, which is what
    /// a caller should persist.
    pub fn recover_wanted(&mut self) -> Result<Vec<Node>> {
        if self.shards.iter().any(|s| s.want && s.node.is_none()) {
            if !self.recoverable() {
                return Err(RecoveryError::RecoveryExceeded);
            }
            self.reconstruct()?;
        }
        Ok(self.recovered())
    }

    /// Nodes filled by reconstruction, one per distinct id.
    pub fn recovered(&self) -> Vec<Node> {
        let mut seen = HashSet::new();
        self.recovered
            .iter()
            .filter_map(|&i| {
                let shard = &self.shards[i];
                if seen.insert(shard.cid) {
                    shard.node.clone()
                } else {
                    None
                }
            })
            .collect()
    }

    fn reconstruct(&mut self) -> Result<()> {
        let mut vectors: Vec<Option<Vec<u8>>> =
            self.shards.iter().map(|s| s.vector.clone()).collect();
        self.rs.reconstruct(&mut vectors)?;
        self.reconstructions += 1;

        let mut built = Vec::new();
        for (i, shard) in self.shards.iter().enumerate() {
            if !shard.want || shard.node.is_some() {
                continue;
            }
            let vector = vectors[i].take().ok_or(RecoveryError::RecoveryExceeded)?;
            let node = self.materialize(i, &vector)?;
            built.push((i, vector, node));
        }

        for (i, vector, node) in built {
            let shard = &mut self.shards[i];
            shard.vector = Some(vector);
            shard.node = Some(node);
            shard.want = false;
            self.have += 1;
            self.recovered.push(i);
        }
        debug!(parent = %self.parent, recovered = self.recovered.len(), "Reconstructed shards");
        Ok(())
    }

    /// Turn a reconstructed vector back into the node it encodes, checking
    /// the bytes against the expected id.
    fn materialize(&self, position: usize, vector: &[u8]) -> Result<Node> {
        let cid = self.shards[position].cid;
        let bytes = if position < self.data_shards {
            let (len, n) = read_varint(vector).ok_or_else(|| {
                RecoveryError::InvalidFormat(format!("bad length prefix for {}", cid))
            })?;
            let end = (len as usize)
                .checked_add(n)
                .filter(|&end| end <= vector.len())
                .ok_or_else(|| {
                    RecoveryError::InvalidFormat(format!("length prefix overruns shard for {}", cid))
                })?;
            &vector[n..end]
        } else {
            vector
        };

        let block = Block::with_cid(cid, bytes.to_vec());
        block.verify()?;
        self.registry.decode(&block)
    }
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("parent", &self.parent)
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards())
            .field("width", &self.width)
            .field("have", &self.have)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::dag::{BlockDagService, DagService, NodeGetter};
    use crate::node::ProtoNode;
    use crate::reedsolomon::{encode, registry};
    use crate::store::MemoryBlockStore;

    struct Fixture {
        dag: BlockDagService,
        node: RecoveryNode,
        children: Vec<Node>,
        parity: Vec<Node>,
    }

    fn fixture(m: usize) -> Fixture {
        let registry = Arc::new(registry());
        let dag = BlockDagService::new(Arc::new(MemoryBlockStore::new()), registry);
        let token = CancelToken::new();

        let children: Vec<Node> = ["1234567890", "0987654321", "1234509876"]
            .iter()
            .map(|s| Node::with_data(*s))
            .collect();
        let mut parent = ProtoNode::new(b"1234567890".to_vec());
        for child in &children {
            parent.add_node_link("link", child);
        }
        dag.add_many(&token, &children).unwrap();

        let node = encode::encode(&token, &dag, &Node::Proto(parent), m).unwrap();
        let parity = node
            .recovery_links()
            .iter()
            .map(|l| dag.get(&token, &l.cid).unwrap())
            .collect();
        Fixture {
            dag,
            node,
            children,
            parity,
        }
    }

    fn shard_set(f: &Fixture) -> ShardSet {
        ShardSet::new(&f.node, Arc::clone(f.dag.registry())).unwrap()
    }

    #[test]
    fn test_reconstruct_two_data_shards() {
        let f = fixture(2);
        let mut set = shard_set(&f);

        assert!(set.fill(&f.children[0]));
        assert!(set.fill(&f.parity[0]));
        assert!(!set.fill(&f.parity[1]));

        set.want(&f.children[1].cid()).unwrap();
        set.want(&f.children[2].cid()).unwrap();

        assert_eq!(set.get(&f.children[1].cid()).unwrap(), f.children[1]);
        assert_eq!(set.get(&f.children[2].cid()).unwrap(), f.children[2]);
        assert_eq!(set.get(&f.children[0].cid()).unwrap(), f.children[0]);
        assert_eq!(set.reconstructions(), 1);
        assert_eq!(set.recovered().len(), 2);
    }

    #[test]
    fn test_reconstruct_parity_shard() {
        let f = fixture(2);
        let mut set = shard_set(&f);
        for child in &f.children {
            set.fill(child);
        }

        assert_eq!(set.get(&f.parity[1].cid()).unwrap(), f.parity[1]);
    }

    #[test]
    fn test_fill_is_idempotent() {
        let f = fixture(2);
        let mut set = shard_set(&f);

        assert!(set.fill(&f.children[0]));
        assert!(set.fill(&f.children[0]));
        assert_eq!(set.have(), 1);

        set.fill(&f.parity[0]);
        set.fill(&f.parity[0]);
        set.fill(&f.parity[1]);
        assert_eq!(set.have(), 3);
        assert_eq!(set.get(&f.children[2].cid()).unwrap(), f.children[2]);
    }

    #[test]
    fn test_not_enough_shards() {
        let f = fixture(2);
        let mut set = shard_set(&f);
        set.fill(&f.children[0]);
        set.fill(&f.parity[0]);

        assert!(matches!(
            set.get(&f.children[1].cid()),
            Err(RecoveryError::RecoveryExceeded)
        ));
        // Known shards are still served.
        assert_eq!(set.get(&f.children[0].cid()).unwrap(), f.children[0]);
        assert_eq!(set.reconstructions(), 0);
    }

    #[test]
    fn test_unknown_child() {
        let f = fixture(1);
        let mut set = shard_set(&f);
        let stranger = Cid::raw(b"stranger");

        assert!(matches!(
            set.want(&stranger),
            Err(RecoveryError::UnknownChild(_))
        ));
        assert!(set.fill(&Node::raw("stranger")));
        assert_eq!(set.have(), 0);
    }

    #[test]
    fn test_ids_order() {
        let f = fixture(2);
        let set = shard_set(&f);
        let mut expected: Vec<Cid> = f.children.iter().map(Node::cid).collect();
        expected.extend(f.parity.iter().map(Node::cid));
        assert_eq!(set.ids(), expected);
        assert_eq!(set.data_shards(), 3);
        assert_eq!(set.parity_shards(), 2);
    }

    #[test]
    fn test_recover_wanted_with_strategy() {
        let f = fixture(2);
        let mut set = shard_set(&f);
        set.want_all();
        set.fill(&f.children[1]);
        set.fill(&f.parity[0]);
        set.fill(&f.parity[1]);

        let mut recovered: Vec<Cid> = set.recover_wanted().unwrap().iter().map(Node::cid).collect();
        recovered.sort();
        let mut expected = vec![f.children[0].cid(), f.children[2].cid()];
        expected.sort();
        assert_eq!(recovered, expected);
        assert!(set.missing().is_empty());
    }

    #[test]
    fn test_identical_children_share_an_id() {
        let registry = Arc::new(registry());
        let dag = BlockDagService::new(Arc::new(MemoryBlockStore::new()), registry);
        let token = CancelToken::new();
        let same = Node::with_data("aaaa");
        let other = Node::with_data("bbbb");
        dag.add_many(&token, &[same.clone(), other.clone()]).unwrap();

        let mut parent = ProtoNode::default();
        parent.add_node_link("0", &same);
        parent.add_node_link("1", &same);
        parent.add_node_link("2", &other);
        let node = encode::encode(&token, &dag, &Node::Proto(parent), 1).unwrap();

        let mut set = ShardSet::new(&node, Arc::clone(dag.registry())).unwrap();
        assert!(set.fill(&same));
        assert_eq!(set.have(), 2);
        assert!(!set.fill(&dag.get(&token, &node.recovery_links()[0].cid).unwrap()));
        assert_eq!(set.get(&other.cid()).unwrap(), other);
    }

    #[test]
    fn test_missing_lists_each_id_once() {
        let registry = Arc::new(registry());
        let dag = BlockDagService::new(Arc::new(MemoryBlockStore::new()), registry);
        let token = CancelToken::new();
        let same = Node::with_data("aaaa");
        let other = Node::with_data("bbbb");
        dag.add_many(&token, &[same.clone(), other.clone()]).unwrap();

        let mut parent = ProtoNode::default();
        parent.add_node_link("0", &same);
        parent.add_node_link("1", &other);
        parent.add_node_link("2", &same);
        let node = encode::encode(&token, &dag, &Node::Proto(parent), 1).unwrap();

        let mut set = ShardSet::new(&node, Arc::clone(dag.registry())).unwrap();
        set.want_data();
        assert_eq!(set.missing(), vec![same.cid(), other.cid()]);

        set.fill(&same);
        assert_eq!(set.missing(), vec![other.cid()]);
    }

    #[test]
    fn test_oversized_shard_ignored() {
        let f = fixture(1);
        let mut set = shard_set(&f);
        let big = Node::with_data(vec![7u8; 1024]);
        // Pretend the oversized node sits at a data position.
        set.positions.insert(big.cid(), vec![0]);
        set.shards[0].cid = big.cid();

        assert!(set.fill(&big));
        assert_eq!(set.have(), 0);
    }

    #[test]
    fn test_validation() {
        let registry = Arc::new(registry());
        let no_links = RecoveryNode::new(ProtoNode::new(b"x".to_vec()));
        assert!(matches!(
            ShardSet::new(&no_links, Arc::clone(&registry)),
            Err(RecoveryError::NoLinks)
        ));

        let mut proto = ProtoNode::default();
        proto.add_node_link("a", &Node::with_data("a"));
        let no_parity = RecoveryNode::new(proto.clone());
        assert!(ShardSet::new(&no_parity, Arc::clone(&registry))
            .unwrap_err()
            .is_validation());

        proto.add_node_link("b", &Node::with_data("bb"));
        let mut uneven = RecoveryNode::new(proto);
        uneven.add_recovery_link(&Node::raw("pp"));
        assert!(matches!(
            ShardSet::new(&uneven, registry),
            Err(RecoveryError::SizesNotEqual)
        ));
    }
}

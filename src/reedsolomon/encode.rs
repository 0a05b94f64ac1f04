//! Reed-Solomon encoding of a plain node into a recovery node.

use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::dag::DagService;
use crate::error::{RecoveryError, Result};
use crate::node::{Node, ProtoNode, RecoveryNode};
use crate::recovery::Recoverability;
use crate::varint::{varint_len, write_varint};

/// GF(2^8) limits a code to 256 shards in total.
pub const MAX_SHARDS: usize = 256;

/// Check that `node` can be Reed-Solomon coded: it must be a plain node
/// with at least one link, and all links must have the same size.
pub fn validate_node(node: &Node) -> Result<&ProtoNode> {
    let proto = node
        .as_proto()
        .ok_or(RecoveryError::WrongNodeType { expected: "dag-node" })?;

    let links = proto.links();
    let Some(first) = links.first() else {
        return Err(RecoveryError::NoLinks);
    };
    if links[1..].iter().any(|l| l.size != first.size) {
        return Err(RecoveryError::SizesNotEqual);
    }
    Ok(proto)
}

fn validate_recoverability(data_shards: usize, recoverability: Recoverability) -> Result<()> {
    if recoverability == 0 {
        return Err(RecoveryError::InvalidRecoverability(
            "at least one parity shard is required".into(),
        ));
    }
    if data_shards + recoverability > MAX_SHARDS {
        return Err(RecoveryError::InvalidRecoverability(format!(
            "{} children + {} parity shards exceed {}",
            data_shards, recoverability, MAX_SHARDS
        )));
    }
    Ok(())
}

/// Encode `node` with `recoverability` parity shards.
///
/// Writes the parity shards and the recovery node to `dag`, then removes
/// the original node. A node that already is a recovery node is returned
/// as is. Nothing is written when validation fails.
pub fn encode(
    token: &CancelToken,
    dag: &dyn DagService,
    node: &Node,
    recoverability: Recoverability,
) -> Result<RecoveryNode> {
    if let Some(recovery) = node.as_recovery() {
        return Ok(recovery.clone());
    }
    let proto = validate_node(node)?;
    let links = proto.links();
    validate_recoverability(links.len(), recoverability)?;
    token.check()?;

    let children: Vec<Vec<u8>> = links
        .par_iter()
        .map(|link| dag.get(token, &link.cid).map(|child| child.raw_data()))
        .collect::<Result<_>>()?;

    let max_len = children.iter().map(Vec::len).max().unwrap_or(0);
    let width = max_len + varint_len(max_len as u64);

    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(links.len() + recoverability);
    for raw in &children {
        let mut vector = vec![0u8; width];
        let n = write_varint(&mut vector, raw.len() as u64);
        vector[n..n + raw.len()].copy_from_slice(raw);
        shards.push(vector);
    }
    shards.resize(links.len() + recoverability, vec![0u8; width]);

    let rs = ReedSolomon::new(links.len(), recoverability)?;
    rs.encode(&mut shards)?;
    token.check()?;

    let mut encoded = RecoveryNode::new(proto.clone());
    for vector in shards.drain(links.len()..) {
        let parity = Node::raw(vector);
        dag.add(token, &parity)?;
        encoded.add_recovery_link(&parity);
    }

    dag.add(token, &Node::Recovery(encoded.clone()))?;
    dag.remove(token, &node.cid())?;

    debug!(width, data = links.len(), parity = recoverability, "Encoded shards");
    info!(
        original = %node.cid(),
        encoded = %encoded.cid(),
        recoverability,
        "Encoded recovery node"
    );
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::dag::{BlockDagService, NodeGetter};
    use crate::reedsolomon::registry;
    use crate::store::{BlockStore, MemoryBlockStore};

    fn setup() -> (Arc<MemoryBlockStore>, BlockDagService) {
        let store = Arc::new(MemoryBlockStore::new());
        let dag = BlockDagService::new(store.clone(), Arc::new(registry()));
        (store, dag)
    }

    fn parent_of(dag: &BlockDagService, children: &[&str]) -> Node {
        let token = CancelToken::new();
        let mut parent = ProtoNode::new(b"1234567890".to_vec());
        for data in children {
            let child = Node::with_data(*data);
            dag.add(&token, &child).unwrap();
            parent.add_node_link("link", &child);
        }
        let parent = Node::Proto(parent);
        dag.add(&token, &parent).unwrap();
        parent
    }

    #[test]
    fn test_encode() {
        let (store, dag) = setup();
        let token = CancelToken::new();
        let parent = parent_of(&dag, &["1234567890", "0987654321", "1234509876"]);

        let encoded = encode(&token, &dag, &parent, 2).unwrap();

        assert_eq!(encoded.recoverability(), 2);
        assert_eq!(encoded.links(), parent.links());
        assert_eq!(encoded.proto(), parent.as_proto().unwrap());
        assert!(store.has(&encoded.cid()).unwrap());
        assert!(!store.has(&parent.cid()).unwrap());
        for link in encoded.recovery_links() {
            let parity = dag.get(&token, &link.cid).unwrap();
            assert_eq!(parity.raw_data().len() as u64, link.size);
        }
        // 3 children + 2 parity + recovery node
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_encoded_node_decodes() {
        let (_store, dag) = setup();
        let token = CancelToken::new();
        let parent = parent_of(&dag, &["aa", "bb"]);

        let encoded = encode(&token, &dag, &parent, 1).unwrap();
        let fetched = dag.get(&token, &encoded.cid()).unwrap();
        assert_eq!(fetched.as_recovery(), Some(&encoded));
    }

    #[test]
    fn test_sizes_not_equal_writes_nothing() {
        let (store, dag) = setup();
        let token = CancelToken::new();
        let parent = parent_of(&dag, &["1234567890", "12345"]);
        let before = store.len();

        let err = encode(&token, &dag, &parent, 2).unwrap_err();
        assert!(matches!(err, RecoveryError::SizesNotEqual));
        assert!(err.is_validation());
        assert_eq!(store.len(), before);
    }

    #[test]
    fn test_no_links() {
        let (_store, dag) = setup();
        let err = encode(&CancelToken::new(), &dag, &Node::with_data("leaf"), 2).unwrap_err();
        assert!(matches!(err, RecoveryError::NoLinks));
    }

    #[test]
    fn test_raw_node_rejected() {
        let (_store, dag) = setup();
        let err = encode(&CancelToken::new(), &dag, &Node::raw("raw"), 2).unwrap_err();
        assert!(matches!(err, RecoveryError::WrongNodeType { .. }));
    }

    #[test]
    fn test_recoverability_limits() {
        let (_store, dag) = setup();
        let token = CancelToken::new();
        let parent = parent_of(&dag, &["a", "b"]);

        assert!(encode(&token, &dag, &parent, 0).unwrap_err().is_validation());
        assert!(encode(&token, &dag, &parent, 255).unwrap_err().is_validation());
        assert!(encode(&token, &dag, &parent, 254).is_ok());
    }

    #[test]
    fn test_already_encoded_is_returned() {
        let (store, dag) = setup();
        let token = CancelToken::new();
        let parent = parent_of(&dag, &["a", "b"]);
        let encoded = encode(&token, &dag, &parent, 1).unwrap();
        let blocks = store.len();

        let again = encode(&token, &dag, &Node::Recovery(encoded.clone()), 3).unwrap();
        assert_eq!(again, encoded);
        assert_eq!(store.len(), blocks);
    }

    #[test]
    fn test_missing_child() {
        let (_store, dag) = setup();
        let token = CancelToken::new();
        let parent = parent_of(&dag, &["a", "b"]);
        dag.remove(&token, &parent.links()[1].cid).unwrap();

        assert!(encode(&token, &dag, &parent, 1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_raw_children() {
        let (_store, dag) = setup();
        let token = CancelToken::new();
        let mut parent = ProtoNode::default();
        for data in ["xyz", "abc", "def", "ghi"] {
            let child = Node::raw(data);
            dag.add(&token, &child).unwrap();
            parent.add_node_link("", &child);
        }

        let encoded = encode(&token, &dag, &Node::Proto(parent), 3).unwrap();
        // width = 3 payload bytes + 1 prefix byte
        assert!(encoded.recovery_links().iter().all(|l| l.size == 4));
    }
}

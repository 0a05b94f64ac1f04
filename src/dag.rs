//! DAG service: nodes over a block store.
//!
//! `NodeGetter` is the read side every self-healing layer wraps.
//! `DagService` adds writes. `BlockDagService` implements both over a
//! `BlockStore`, an optional `Exchange` for misses, and the codec registry
//! used to decode blocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::cid::Cid;
use crate::error::{RecoveryError, Result};
use crate::exchange::Exchange;
use crate::node::{CodecRegistry, Link, Node, ProtoNode};
use crate::recovery::{Encoder, Recoverability};
use crate::store::BlockStore;

pub trait NodeGetter: Send + Sync {
    /// Fetch one node, or `NotFound`.
    fn get(&self, token: &CancelToken, cid: &Cid) -> Result<Node>;

    /// Fetch many nodes in the background.
    ///
    /// Each result arrives independently and in no particular order. The
    /// channel closes after every id was answered or `token` was cancelled.
    fn get_many(&self, token: &CancelToken, cids: Vec<Cid>) -> Receiver<Result<Node>>;
}

pub trait DagService: NodeGetter {
    fn add(&self, token: &CancelToken, node: &Node) -> Result<()>;

    fn add_many(&self, token: &CancelToken, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            self.add(token, node)?;
        }
        Ok(())
    }

    /// Remove a node's block. Removing an absent node is not an error.
    fn remove(&self, token: &CancelToken, cid: &Cid) -> Result<()>;
}

// ── BlockDagService ────────────────────────────────────────────────

pub struct BlockDagService {
    store: Arc<dyn BlockStore>,
    exchange: Option<Arc<dyn Exchange>>,
    registry: Arc<CodecRegistry>,
}

impl BlockDagService {
    /// Local-only service: misses are final.
    pub fn new(store: Arc<dyn BlockStore>, registry: Arc<CodecRegistry>) -> Self {
        Self {
            store,
            exchange: None,
            registry,
        }
    }

    /// Service that falls back to `exchange` on local misses and keeps
    /// whatever it fetched.
    pub fn with_exchange(
        store: Arc<dyn BlockStore>,
        exchange: Arc<dyn Exchange>,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            store,
            exchange: Some(exchange),
            registry,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    fn get_local(&self, cid: &Cid) -> Result<Node> {
        let block = self.store.get(cid)?;
        self.registry.decode(&block)
    }
}

impl NodeGetter for BlockDagService {
    fn get(&self, token: &CancelToken, cid: &Cid) -> Result<Node> {
        token.check()?;
        match self.get_local(cid) {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let Some(exchange) = &self.exchange else {
            return Err(RecoveryError::NotFound(*cid));
        };
        let block = exchange.get_block(token, cid)?;
        self.store.put(&block)?;
        self.registry.decode(&block)
    }

    fn get_many(&self, token: &CancelToken, cids: Vec<Cid>) -> Receiver<Result<Node>> {
        let (tx, rx) = crossbeam_channel::bounded(cids.len().max(1));
        let store = Arc::clone(&self.store);
        let exchange = self.exchange.clone();
        let registry = Arc::clone(&self.registry);
        let token = token.clone();

        thread::spawn(move || {
            let local = BlockDagService {
                store,
                exchange: None,
                registry,
            };
            get_many_worker(&local, exchange, &token, cids, &tx);
        });
        rx
    }
}

fn get_many_worker(
    local: &BlockDagService,
    exchange: Option<Arc<dyn Exchange>>,
    token: &CancelToken,
    cids: Vec<Cid>,
    tx: &Sender<Result<Node>>,
) {
    let mut missing = Vec::new();
    for cid in cids {
        if token.is_cancelled() {
            return;
        }
        match local.get_local(&cid) {
            Err(e) if e.is_not_found() => missing.push(cid),
            result => {
                if tx.send(result).is_err() {
                    return;
                }
            }
        }
    }

    if missing.is_empty() {
        return;
    }

    let mut remaining: HashSet<Cid> = missing.iter().copied().collect();
    if let Some(exchange) = exchange {
        for block in exchange.get_blocks(token, missing) {
            if !remaining.remove(block.cid()) {
                continue;
            }
            if let Err(e) = local.store.put(&block) {
                warn!(cid = %block.cid(), error = %e, "Failed to keep fetched block");
            }
            if tx.send(local.registry.decode(&block)).is_err() {
                return;
            }
        }
    }

    if token.is_cancelled() {
        return;
    }
    for cid in remaining {
        if tx.send(Err(RecoveryError::NotFound(cid))).is_err() {
            return;
        }
    }
}

impl DagService for BlockDagService {
    fn add(&self, _token: &CancelToken, node: &Node) -> Result<()> {
        self.store.put(&node.to_block())
    }

    fn remove(&self, _token: &CancelToken, cid: &Cid) -> Result<()> {
        self.store.delete(cid)
    }
}

// ── Whole-DAG encoding ─────────────────────────────────────────────

/// Encode every node of the DAG under `node`, bottom-up.
///
/// Children are encoded first; the parent is then relinked to its
/// children's new identities and encoded itself. Leaves are returned
/// unchanged. A node that can't be encoded (unequal child sizes, for
/// example) is kept as a relinked plain node so the rest of the DAG still
/// gains redundancy. A subtree linked more than once is encoded once and
/// every link to it is rewritten to the same result.
pub fn encode_dag(
    token: &CancelToken,
    dag: &dyn DagService,
    encoder: &dyn Encoder,
    node: &Node,
    recoverability: Recoverability,
) -> Result<Node> {
    let mut done = HashMap::new();
    encode_subtree(token, dag, encoder, node, recoverability, &mut done)
}

/// `done` maps the original id of every subtree encoded so far to its
/// result, since encoding removes the original block.
fn encode_subtree(
    token: &CancelToken,
    dag: &dyn DagService,
    encoder: &dyn Encoder,
    node: &Node,
    recoverability: Recoverability,
    done: &mut HashMap<Cid, Node>,
) -> Result<Node> {
    token.check()?;
    if node.links().is_empty() || node.as_recovery().is_some() {
        return Ok(node.clone());
    }
    let Some(proto) = node.as_proto() else {
        return Ok(node.clone());
    };

    let mut links = Vec::with_capacity(proto.links().len());
    for link in proto.links() {
        let child = match done.get(&link.cid) {
            Some(child) => child.clone(),
            None => {
                let child = dag.get(token, &link.cid)?;
                let child = encode_subtree(token, dag, encoder, &child, recoverability, done)?;
                done.insert(link.cid, child.clone());
                child
            }
        };
        links.push(Link::to_node(link.name.clone(), &child));
    }
    let relinked = Node::Proto(ProtoNode::with_links(proto.data().to_vec(), links));

    match encoder.encode(token, &relinked, recoverability) {
        Ok(encoded) => {
            let encoded = Node::Recovery(encoded);
            if relinked.cid() != node.cid() {
                dag.remove(token, &node.cid())?;
            }
            Ok(encoded)
        }
        Err(e) if e.is_validation() => {
            debug!(cid = %relinked.cid(), error = %e, "Keeping node unencoded");
            if relinked.cid() != node.cid() {
                dag.add(token, &relinked)?;
                dag.remove(token, &node.cid())?;
            }
            Ok(relinked)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OfflineExchange;
    use crate::store::MemoryBlockStore;

    fn local() -> (Arc<MemoryBlockStore>, BlockDagService) {
        let store = Arc::new(MemoryBlockStore::new());
        let dag = BlockDagService::new(store.clone(), Arc::new(CodecRegistry::default()));
        (store, dag)
    }

    #[test]
    fn test_add_get_remove() {
        let (_store, dag) = local();
        let token = CancelToken::new();
        let node = Node::with_data("1234567890");

        dag.add(&token, &node).unwrap();
        assert_eq!(dag.get(&token, &node.cid()).unwrap(), node);

        dag.remove(&token, &node.cid()).unwrap();
        assert!(dag.get(&token, &node.cid()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_many_reports_every_id() {
        let (_store, dag) = local();
        let token = CancelToken::new();
        let a = Node::with_data("a");
        let b = Node::raw("b");
        dag.add_many(&token, &[a.clone(), b.clone()]).unwrap();
        let gone = Cid::raw(b"gone");

        let results: Vec<_> = dag
            .get_many(&token, vec![a.cid(), gone, b.cid()])
            .iter()
            .collect();
        assert_eq!(results.len(), 3);
        let found: HashSet<Cid> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(Node::cid)
            .collect();
        assert_eq!(found, HashSet::from([a.cid(), b.cid()]));
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(RecoveryError::NotFound(id)) if *id == gone)));
    }

    #[test]
    fn test_exchange_fallback_keeps_blocks() {
        let remote = Arc::new(MemoryBlockStore::new());
        let node = Node::with_data("remote");
        remote.put(&node.to_block()).unwrap();

        let store = Arc::new(MemoryBlockStore::new());
        let dag = BlockDagService::with_exchange(
            store.clone(),
            Arc::new(OfflineExchange::new(remote)),
            Arc::new(CodecRegistry::default()),
        );

        let token = CancelToken::new();
        assert_eq!(dag.get(&token, &node.cid()).unwrap(), node);
        assert!(store.has(&node.cid()).unwrap());
    }

    #[test]
    fn test_get_many_uses_exchange() {
        let remote = Arc::new(MemoryBlockStore::new());
        let far = Node::raw("far");
        remote.put(&far.to_block()).unwrap();

        let store = Arc::new(MemoryBlockStore::new());
        let near = Node::raw("near");
        store.put(&near.to_block()).unwrap();
        let dag = BlockDagService::with_exchange(
            store.clone(),
            Arc::new(OfflineExchange::new(remote)),
            Arc::new(CodecRegistry::default()),
        );

        let got: Vec<Node> = dag
            .get_many(&CancelToken::new(), vec![near.cid(), far.cid()])
            .iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(got.len(), 2);
        assert!(store.has(&far.cid()).unwrap());
    }

    #[test]
    fn test_cancelled_get() {
        let (_store, dag) = local();
        let token = CancelToken::new();
        token.cancel();
        assert!(dag
            .get(&token, &Cid::raw(b"x"))
            .unwrap_err()
            .is_cancelled());
    }
}

#![allow(dead_code)]
//! Shared integration test fixtures.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use dagheal::dag::{BlockDagService, DagService, NodeGetter};
use dagheal::reedsolomon::{self, ReedSolomonRecoverer};
use dagheal::{
    BlockStore, CancelToken, Cid, CodecRegistry, MemoryBlockStore, Node, ProtoNode, RecoveryMetrics,
    RecoveryNode, Result, Strategy,
};

/// Three equal-size children used throughout the docs.
pub const EXAMPLE_CHILDREN: [&str; 3] = ["1234567890", "0987654321", "1234509876"];

pub struct Fixture {
    pub token: CancelToken,
    pub store: Arc<MemoryBlockStore>,
    pub registry: Arc<CodecRegistry>,
    pub dag: Arc<BlockDagService>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryBlockStore::new());
        let registry = Arc::new(reedsolomon::registry());
        let dag = Arc::new(BlockDagService::new(store.clone(), Arc::clone(&registry)));
        Self {
            token: CancelToken::new(),
            store,
            registry,
            dag,
        }
    }

    /// Store `payloads` as plain children of a new parent, then encode the
    /// parent with `m` parity shards.
    pub fn encoded(&self, payloads: &[&str], m: usize) -> (RecoveryNode, Vec<Node>) {
        let children: Vec<Node> = payloads.iter().map(|p| Node::with_data(*p)).collect();
        self.dag.add_many(&self.token, &children).unwrap();

        let mut parent = ProtoNode::new(b"1234567890".to_vec());
        for child in &children {
            parent.add_node_link("link", child);
        }
        let parent = Node::Proto(parent);
        self.dag.add(&self.token, &parent).unwrap();

        let node = reedsolomon::encode(&self.token, self.dag.as_ref(), &parent, m).unwrap();
        (node, children)
    }

    pub fn lose(&self, ids: &[Cid]) {
        for id in ids {
            self.store.delete(id).unwrap();
        }
    }

    pub fn recoverer(&self, strategy: Strategy) -> (ReedSolomonRecoverer, Arc<RecoveryMetrics>) {
        self.recoverer_over(self.dag.clone(), strategy)
    }

    pub fn recoverer_over(
        &self,
        dag: Arc<dyn DagService>,
        strategy: Strategy,
    ) -> (ReedSolomonRecoverer, Arc<RecoveryMetrics>) {
        let metrics = Arc::new(RecoveryMetrics::new());
        let recoverer = ReedSolomonRecoverer::with_metrics(
            &self.token,
            dag,
            Arc::clone(&self.registry),
            strategy,
            Arc::clone(&metrics),
        );
        (recoverer, metrics)
    }
}

/// Every position of a recovery node: data links, then parity links.
pub fn shard_ids(node: &RecoveryNode) -> Vec<Cid> {
    node.links()
        .iter()
        .chain(node.recovery_links())
        .map(|l| l.cid)
        .collect()
}

pub fn collect(results: Receiver<Result<Node>>) -> Vec<Result<Node>> {
    results.iter().collect()
}

/// Poll `done` for up to five seconds.
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// ── GatedDag ───────────────────────────────────────────────────────

/// DAG service whose batch fetches hold every result back until `open` is
/// called. Counts batch fetches.
pub struct GatedDag {
    inner: Arc<BlockDagService>,
    gate: Mutex<Option<Sender<()>>>,
    opened: Receiver<()>,
    fetches: AtomicUsize,
}

impl GatedDag {
    pub fn new(inner: Arc<BlockDagService>) -> Self {
        let (gate, opened) = crossbeam_channel::bounded(0);
        Self {
            inner,
            gate: Mutex::new(Some(gate)),
            opened,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Release held and future fetches.
    pub fn open(&self) {
        self.gate.lock().unwrap().take();
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl NodeGetter for GatedDag {
    fn get(&self, token: &CancelToken, cid: &Cid) -> Result<Node> {
        self.inner.get(token, cid)
    }

    fn get_many(&self, token: &CancelToken, cids: Vec<Cid>) -> Receiver<Result<Node>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = crossbeam_channel::unbounded();
        let opened = self.opened.clone();
        let inner = Arc::clone(&self.inner);
        let token = token.clone();
        thread::spawn(move || {
            // Disconnects once the gate sender is dropped.
            let _ = opened.recv();
            for result in inner.get_many(&token, cids) {
                if tx.send(result).is_err() {
                    return;
                }
            }
        });
        rx
    }
}

impl DagService for GatedDag {
    fn add(&self, token: &CancelToken, node: &Node) -> Result<()> {
        self.inner.add(token, node)
    }

    fn remove(&self, token: &CancelToken, cid: &Cid) -> Result<()> {
        self.inner.remove(token, cid)
    }
}

/// True if every id is in `store`.
pub fn has_all(store: &dyn BlockStore, ids: &[Cid]) -> bool {
    ids.iter().all(|id| store.has(id).unwrap_or(false))
}

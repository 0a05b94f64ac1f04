//! Drop-in self-healing wrapper for any `NodeGetter`.
//!
//! `HealingGetter` owns no store. Misses of the wrapped getter are healed
//! through cached parents; whatever can't be healed stays `NotFound`.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::cid::Cid;
use crate::config::DEFAULT_PARENT_CACHE_CAPACITY;
use crate::dag::NodeGetter;
use crate::error::{RecoveryError, Result};
use crate::metrics::RecoveryMetrics;
use crate::node::Node;
use crate::parents::ParentCache;
use crate::recovery::Recoverer;

#[derive(Clone)]
pub struct HealingGetter {
    inner: Arc<dyn NodeGetter>,
    recoverer: Arc<dyn Recoverer>,
    parents: Arc<ParentCache>,
    metrics: Option<Arc<RecoveryMetrics>>,
}

impl HealingGetter {
    pub fn new(inner: Arc<dyn NodeGetter>, recoverer: Arc<dyn Recoverer>) -> Self {
        Self::with_capacity(inner, recoverer, DEFAULT_PARENT_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        inner: Arc<dyn NodeGetter>,
        recoverer: Arc<dyn Recoverer>,
        parent_cache_capacity: usize,
    ) -> Self {
        Self {
            inner,
            recoverer,
            parents: Arc::new(ParentCache::new(parent_cache_capacity)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RecoveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn parents(&self) -> &ParentCache {
        &self.parents
    }

    /// Recover `lost` through the cached parent of its first id. Recovered
    /// nodes go to `emit` until it returns false; failures are only logged.
    fn heal(&self, token: &CancelToken, lost: &[Cid], emit: &mut dyn FnMut(Node) -> bool) {
        let Some(parent) = lost.first().and_then(|id| self.parents.take_parent_of(id)) else {
            return;
        };
        if let Some(m) = &self.metrics {
            m.record_parent_cache_hit();
        }

        let children: Vec<Cid> = lost
            .iter()
            .filter(|id| parent.links().iter().any(|l| &l.cid == *id))
            .copied()
            .collect();
        let results = match self.recoverer.recover(token, &parent, &children) {
            Ok(results) => results,
            Err(e) => {
                warn!(parent = %parent.cid(), error = %e, "Recovery failed");
                if let Some(m) = &self.metrics {
                    m.record_recovery_failure();
                }
                return;
            }
        };
        for result in results {
            match result {
                Ok(node) => {
                    info!(cid = %node.cid(), parent = %parent.cid(), "Successful recovery");
                    if !emit(node) {
                        return;
                    }
                }
                Err(e) => warn!(parent = %parent.cid(), error = %e, "Recovery failed"),
            }
        }
    }

    fn get_many_worker(&self, token: &CancelToken, cids: Vec<Cid>, tx: &Sender<Result<Node>>) {
        let mut lost = Vec::new();
        for result in self.inner.get_many(token, cids) {
            let result = match result {
                Err(RecoveryError::NotFound(cid)) => {
                    lost.push(cid);
                    continue;
                }
                other => other.map(|node| self.parents.observe(node)),
            };
            if tx.send(result).is_err() {
                return;
            }
        }
        if lost.is_empty() || token.is_cancelled() {
            return;
        }

        let mut remaining: HashSet<Cid> = lost.iter().copied().collect();
        let mut open = true;
        self.heal(token, &lost, &mut |node| {
            remaining.remove(&node.cid());
            open = tx.send(Ok(self.parents.observe(node))).is_ok();
            open
        });
        if !open || token.is_cancelled() {
            return;
        }
        for cid in remaining {
            if tx.send(Err(RecoveryError::NotFound(cid))).is_err() {
                return;
            }
        }
    }
}

impl NodeGetter for HealingGetter {
    fn get(&self, token: &CancelToken, cid: &Cid) -> Result<Node> {
        match self.inner.get(token, cid) {
            Ok(node) => return Ok(self.parents.observe(node)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut recovered = None;
        self.heal(token, &[*cid], &mut |node| {
            recovered = Some(node);
            false
        });
        if let Some(node) = recovered {
            return Ok(self.parents.observe(node));
        }
        token.check()?;
        Err(RecoveryError::NotFound(*cid))
    }

    fn get_many(&self, token: &CancelToken, cids: Vec<Cid>) -> Receiver<Result<Node>> {
        let (tx, rx) = crossbeam_channel::bounded(cids.len().max(1));
        let getter = self.clone();
        let token = token.clone();
        thread::spawn(move || getter.get_many_worker(&token, cids, &tx));
        rx
    }
}

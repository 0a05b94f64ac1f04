//! DagSession - self-healing node getter over a block store
//!
//! Every id is looked up in order:
//!
//! 1. the local block store,
//! 2. recovery through a cached parent that links to it,
//! 3. the exchange, through one fetch session reused for the whole DAG
//!    session,
//!
//! and is `NotFound` when all three miss. Recovery is best effort: a failed
//! attempt is logged and the lookup moves on to the exchange.
//!
//! Every recovery node handed out is cached as a parent candidate and
//! returned as its plain view. With `prefetch` enabled, the strategy decides
//! which of its shards are pulled into the store in the background.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::cid::Cid;
use crate::config::RecoveryConfig;
use crate::dag::NodeGetter;
use crate::error::{RecoveryError, Result};
use crate::exchange::Exchange;
use crate::metrics::RecoveryMetrics;
use crate::node::{CodecRegistry, Node, RecoveryNode};
use crate::parents::ParentCache;
use crate::recovery::Recoverer;
use crate::store::BlockStore;

/// Self-healing `NodeGetter`.
///
/// Cheap to clone; clones share the parent cache and the fetch session.
#[derive(Clone)]
pub struct DagSession {
    /// Lifetime of the fetch session and of background prefetches.
    token: CancelToken,
    store: Arc<dyn BlockStore>,
    exchange: Option<Arc<dyn Exchange>>,
    /// Created from `exchange` on first use.
    fetcher: Arc<OnceLock<Option<Arc<dyn Exchange>>>>,
    recoverer: Arc<dyn Recoverer>,
    registry: Arc<CodecRegistry>,
    parents: Arc<ParentCache>,
    config: RecoveryConfig,
    metrics: Option<Arc<RecoveryMetrics>>,
}

impl DagSession {
    /// Local-only session with the default configuration.
    pub fn new(
        token: &CancelToken,
        store: Arc<dyn BlockStore>,
        recoverer: Arc<dyn Recoverer>,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        let config = RecoveryConfig::default();
        Self {
            token: token.child(),
            store,
            exchange: None,
            fetcher: Arc::new(OnceLock::new()),
            recoverer,
            registry,
            parents: Arc::new(ParentCache::new(config.parent_cache_capacity)),
            config,
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.parents = Arc::new(ParentCache::new(config.parent_cache_capacity));
        self.config = config;
        self
    }

    /// Fall back to `exchange` when neither the store nor recovery can
    /// produce a node.
    pub fn with_exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = Some(exchange);
        self.fetcher = Arc::new(OnceLock::new());
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RecoveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn parents(&self) -> &ParentCache {
        &self.parents
    }

    /// Stop background prefetches and the fetch session.
    pub fn close(&self) {
        self.token.cancel();
    }

    fn validate(&self, cid: &Cid) -> Result<()> {
        if self.registry.is_registered(cid.codec()) {
            Ok(())
        } else {
            Err(RecoveryError::UnknownCodec(cid.codec()))
        }
    }

    fn load_local(&self, cid: &Cid) -> Result<Option<Node>> {
        match self.store.get(cid) {
            Ok(block) => self.registry.decode(&block).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cache recovery nodes as parents and return the plain view.
    fn visit(&self, node: Node) -> Node {
        if self.config.prefetch {
            if let Some(recovery) = node.as_recovery() {
                self.prefetch(recovery);
            }
        }
        self.parents.observe(node)
    }

    fn fetcher(&self) -> Option<&Arc<dyn Exchange>> {
        self.fetcher
            .get_or_init(|| {
                let exchange = self.exchange.as_ref()?;
                Some(
                    exchange
                        .new_session(&self.token)
                        .unwrap_or_else(|| Arc::clone(exchange)),
                )
            })
            .as_ref()
    }

    /// Recover `ids` through the cached parent of the first one. Ids that
    /// parent doesn't link to are left alone. Recovered nodes are passed to
    /// `emit` until it returns false.
    fn recover(&self, token: &CancelToken, ids: &[Cid], emit: &mut dyn FnMut(Node) -> bool) {
        let Some(first) = ids.first() else {
            return;
        };
        let Some(parent) = self.parents.take_parent_of(first) else {
            return;
        };
        if let Some(m) = &self.metrics {
            m.record_parent_cache_hit();
        }

        let children: Vec<Cid> = ids
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

    /// Fetch `ids` through the fetch session, keeping every block.
    fn fetch_many(
        &self,
        token: &CancelToken,
        ids: Vec<Cid>,
        emit: &mut dyn FnMut(&Cid, Result<Node>) -> bool,
    ) {
        let Some(fetcher) = self.fetcher() else {
            return;
        };
        for block in fetcher.get_blocks(token, ids) {
            if let Err(e) = self.store.put(&block) {
                warn!(cid = %block.cid(), error = %e, "Failed to keep fetched block");
            }
            if let Some(m) = &self.metrics {
                m.record_network_fallback();
            }
            if !emit(block.cid(), self.registry.decode(&block)) {
                return;
            }
        }
    }

    fn prefetch(&self, node: &RecoveryNode) {
        let strategy = self.config.strategy;
        if strategy.requested() {
            return;
        }
        let Some(fetcher) = self.fetcher().cloned() else {
            return;
        };

        let mut ids: Vec<Cid> = node.links().iter().map(|l| l.cid).collect();
        if strategy.all() {
            ids.extend(node.recovery_links().iter().map(|l| l.cid));
        }
        ids.retain(|id| !matches!(self.store.has(id), Ok(true)));
        if ids.is_empty() {
            return;
        }

        let store = Arc::clone(&self.store);
        let token = self.token.clone();
        let parent = node.cid();
        debug!(%parent, %strategy, shards = ids.len(), "Prefetching shards");
        thread::spawn(move || {
            let mut kept = 0usize;
            for block in fetcher.get_blocks(&token, ids) {
                match store.put(&block) {
                    Ok(()) => kept += 1,
                    Err(e) => warn!(cid = %block.cid(), error = %e, "Failed to keep prefetched block"),
                }
            }
            debug!(%parent, kept, "Prefetch finished");
        });
    }

    fn get_many_worker(&self, token: &CancelToken, cids: Vec<Cid>, tx: &Sender<Result<Node>>) {
        let mut missing = Vec::new();
        for cid in cids {
            if token.is_cancelled() {
                return;
            }
            let result = match self.validate(&cid).and_then(|()| self.load_local(&cid)) {
                Ok(None) => {
                    missing.push(cid);
                    continue;
                }
                Ok(Some(node)) => Ok(self.visit(node)),
                Err(e) => Err(e),
            };
            if tx.send(result).is_err() {
                return;
            }
        }
        if missing.is_empty() {
            return;
        }

        // One batch shares one parent.
        let mut remaining: HashSet<Cid> = missing.iter().copied().collect();
        let mut open = true;
        self.recover(token, &missing, &mut |node| {
            remaining.remove(&node.cid());
            open = tx.send(Ok(self.visit(node))).is_ok();
            open
        });
        if !open || token.is_cancelled() {
            return;
        }

        let unresolved: Vec<Cid> = missing
            .into_iter()
            .filter(|id| remaining.contains(id))
            .collect();
        if !unresolved.is_empty() {
            self.fetch_many(token, unresolved, &mut |cid, result| {
                if !remaining.remove(cid) {
                    return true;
                }
                open = tx.send(result.map(|node| self.visit(node))).is_ok();
                open
            });
        }
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

impl NodeGetter for DagSession {
    fn get(&self, token: &CancelToken, cid: &Cid) -> Result<Node> {
        token.check()?;
        self.validate(cid)?;
        if let Some(node) = self.load_local(cid)? {
            return Ok(self.visit(node));
        }

        let mut recovered = None;
        self.recover(token, &[*cid], &mut |node| {
            recovered = Some(node);
            false
        });
        if let Some(node) = recovered {
            return Ok(self.visit(node));
        }
        token.check()?;

        if let Some(fetcher) = self.fetcher() {
            match fetcher.get_block(token, cid) {
                Ok(block) => {
                    self.store.put(&block)?;
                    if let Some(m) = &self.metrics {
                        m.record_network_fallback();
                    }
                    return self.registry.decode(&block).map(|node| self.visit(node));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Err(RecoveryError::NotFound(*cid))
    }

    fn get_many(&self, token: &CancelToken, cids: Vec<Cid>) -> Receiver<Result<Node>> {
        let (tx, rx) = crossbeam_channel::bounded(cids.len().max(1));
        let session = self.clone();
        let token = token.clone();
        thread::spawn(move || session.get_many_worker(&token, cids, &tx));
        rx
    }
}

impl std::fmt::Debug for DagSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagSession")
            .field("strategy", &self.config.strategy)
            .field("prefetch", &self.config.prefetch)
            .field("exchange", &self.exchange.is_some())
            .field("parents", &self.parents)
            .finish()
    }
}

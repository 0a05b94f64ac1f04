//! Block exchange: where blocks come from when the local store misses.
//!
//! The crate never talks to a network itself. An `Exchange` is whatever
//! can produce blocks by id; `OfflineExchange` serves them from a block
//! store, which is enough for tests and for the CLI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::cid::Cid;
use crate::error::Result;
use crate::node::Block;
use crate::store::BlockStore;

pub trait Exchange: Send + Sync {
    /// Fetch one block. Misses are `NotFound`.
    fn get_block(&self, token: &CancelToken, cid: &Cid) -> Result<Block>;

    /// Fetch many blocks in the background.
    ///
    /// Blocks arrive in no particular order. Ids that can't be fetched are
    /// skipped; the channel closes once every id was tried or `token` is
    /// cancelled.
    fn get_blocks(&self, token: &CancelToken, cids: Vec<Cid>) -> Receiver<Block>;

    /// A fetch session bound to `token`, if this exchange supports them.
    /// Sessions let repeated fetches reuse the same peers.
    fn new_session(&self, _token: &CancelToken) -> Option<Arc<dyn Exchange>> {
        None
    }
}

// ── OfflineExchange ────────────────────────────────────────────────

/// Exchange that serves blocks from a local store. Every fetched block is
/// verified against its id.
#[derive(Clone)]
pub struct OfflineExchange {
    store: Arc<dyn BlockStore>,
    stats: Arc<ExchangeStats>,
}

/// Fetch counters, shared by an exchange and all its sessions.
#[derive(Debug, Default)]
pub struct ExchangeStats {
    get_block_calls: AtomicU64,
    get_blocks_calls: AtomicU64,
    sessions: AtomicU64,
}

impl ExchangeStats {
    pub fn get_block_calls(&self) -> u64 {
        self.get_block_calls.load(Ordering::Relaxed)
    }

    /// Number of batch fetches started.
    pub fn get_blocks_calls(&self) -> u64 {
        self.get_blocks_calls.load(Ordering::Relaxed)
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }
}

impl OfflineExchange {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self {
            store,
            stats: Arc::new(ExchangeStats::default()),
        }
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    fn fetch(store: &dyn BlockStore, cid: &Cid) -> Result<Block> {
        let block = store.get(cid)?;
        block.verify()?;
        Ok(block)
    }
}

impl Exchange for OfflineExchange {
    fn get_block(&self, token: &CancelToken, cid: &Cid) -> Result<Block> {
        self.stats.get_block_calls.fetch_add(1, Ordering::Relaxed);
        token.check()?;
        Self::fetch(self.store.as_ref(), cid)
    }

    fn get_blocks(&self, token: &CancelToken, cids: Vec<Cid>) -> Receiver<Block> {
        self.stats.get_blocks_calls.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = crossbeam_channel::bounded(cids.len().max(1));
        let store = Arc::clone(&self.store);
        let token = token.clone();
        thread::spawn(move || {
            for cid in cids {
                if token.is_cancelled() {
                    debug!("Batch fetch cancelled");
                    return;
                }
                match Self::fetch(store.as_ref(), &cid) {
                    Ok(block) => {
                        if tx.send(block).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(%cid, error = %e, "Failed to fetch block"),
                }
            }
        });
        rx
    }

    fn new_session(&self, _token: &CancelToken) -> Option<Arc<dyn Exchange>> {
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
        Some(Arc::new(self.clone()))
    }
}

//! Recovery session coordinator.
//!
//! One session exists per recovery node being recovered. The first
//! `recover` call for a node creates a `ShardSet`, starts a background fetch
//! of all K+M shards and spawns the session's control loop. Later calls for
//! the same node queue their request on the running session, so every
//! caller is served by one fetch and one reconstruction.
//!
//! The control loop owns the `ShardSet`; nothing else touches it. It waits
//! on, one event at a time:
//!
//! - a shard arriving from the fetch: `fill`, stop once K are known,
//! - a new request: mark its ids as wanted,
//! - a request's token firing: drop that request, stop if none remain,
//! - the coordinator's token firing: stop.
//!
//! It also stops when the fetch closes. On stop the session deregisters,
//! picks up any requests queued meanwhile, answers every live request id by
//! id, persists everything it reconstructed and closes the reply channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Select, Sender};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::cid::Cid;
use crate::dag::DagService;
use crate::error::Result;
use crate::metrics::RecoveryMetrics;
use crate::node::{CodecRegistry, Node, RecoveryNode};
use crate::recovery::Recoverer;
use crate::reedsolomon::shards::ShardSet;
use crate::strategy::Strategy;

/// A caller's request queued on a session.
struct Request {
    token: CancelToken,
    ids: Vec<Cid>,
    reply: Sender<Result<Node>>,
}

struct Inner {
    dag: Arc<dyn DagService>,
    registry: Arc<CodecRegistry>,
    strategy: Strategy,
    /// Root token: cancelling it stops every session.
    token: CancelToken,
    /// Request mailbox of each running session, by recovery node id.
    sessions: Mutex<HashMap<Cid, Sender<Request>>>,
    metrics: Option<Arc<RecoveryMetrics>>,
}

/// Cancels the root token when the last coordinator handle is dropped.
struct ShutdownGuard(CancelToken);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Reed-Solomon `Recoverer` that deduplicates concurrent recoveries.
#[derive(Clone)]
pub struct ReedSolomonRecoverer {
    inner: Arc<Inner>,
    _guard: Arc<ShutdownGuard>,
}

impl ReedSolomonRecoverer {
    /// Create a coordinator whose sessions live at most as long as `token`.
    pub fn new(
        token: &CancelToken,
        dag: Arc<dyn DagService>,
        registry: Arc<CodecRegistry>,
        strategy: Strategy,
    ) -> Self {
        let token = token.child();
        Self {
            inner: Arc::new(Inner {
                dag,
                registry,
                strategy,
                token: token.clone(),
                sessions: Mutex::new(HashMap::new()),
                metrics: None,
            }),
            _guard: Arc::new(ShutdownGuard(token)),
        }
    }

    /// Like `new`, reporting into `metrics`.
    pub fn with_metrics(
        token: &CancelToken,
        dag: Arc<dyn DagService>,
        registry: Arc<CodecRegistry>,
        strategy: Strategy,
        metrics: Arc<RecoveryMetrics>,
    ) -> Self {
        let token = token.child();
        Self {
            inner: Arc::new(Inner {
                dag,
                registry,
                strategy,
                token: token.clone(),
                sessions: Mutex::new(HashMap::new()),
                metrics: Some(metrics),
            }),
            _guard: Arc::new(ShutdownGuard(token)),
        }
    }

    /// Number of sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop every session. Pending requests are answered with whatever the
    /// sessions can produce.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
    }
}

impl Recoverer for ReedSolomonRecoverer {
    fn recover(
        &self,
        token: &CancelToken,
        node: &RecoveryNode,
        ids: &[Cid],
    ) -> Result<Receiver<Result<Node>>> {
        token.check()?;
        self.inner.token.check()?;

        let (reply, out) = crossbeam_channel::bounded(ids.len().max(1));
        let mut request = Request {
            token: token.clone(),
            ids: ids.to_vec(),
            reply,
        };
        let parent = node.cid();

        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(mailbox) = sessions.get(&parent) {
            match mailbox.send(request) {
                Ok(()) => {
                    if let Some(m) = &self.inner.metrics {
                        m.record_session_joined();
                    }
                    debug!(%parent, "Joined running recovery session");
                    return Ok(out);
                }
                // The session died without deregistering; replace it.
                Err(e) => {
                    warn!(%parent, "Replacing dead recovery session");
                    request = e.into_inner();
                    sessions.remove(&parent);
                }
            }
        }

        let mut shards = ShardSet::new(node, Arc::clone(&self.inner.registry))?;
        if self.inner.strategy.all() {
            shards.want_all();
        } else if self.inner.strategy.data() {
            shards.want_data();
        }

        let fetch = self.inner.token.child();
        let incoming = self.inner.dag.get_many(&fetch, shards.ids());
        let (mailbox, requests) = crossbeam_channel::unbounded();
        // Can't fail: we hold the receiver.
        let _ = mailbox.send(request);
        sessions.insert(parent, mailbox);
        drop(sessions);

        if let Some(m) = &self.inner.metrics {
            m.record_session_started();
        }
        debug!(%parent, shards = shards.ids().len(), "Started recovery session");

        let session = Session {
            inner: Arc::clone(&self.inner),
            parent,
            shards,
            fetch,
            incoming,
            requests,
            pending: Vec::new(),
            started: Instant::now(),
        };
        thread::Builder::new()
            .name(format!("recovery-{}", short(&parent)))
            .spawn(move || session.run())?;

        Ok(out)
    }
}

fn short(cid: &Cid) -> String {
    cid.to_string()
        .rsplit(':')
        .next()
        .map(|hex| hex.chars().take(8).collect())
        .unwrap_or_default()
}

// ── Session ────────────────────────────────────────────────────────

enum Event {
    Shard(Result<Node>),
    FetchClosed,
    Request(Request),
    RequestCancelled(usize),
    Shutdown,
}

struct Session {
    inner: Arc<Inner>,
    parent: Cid,
    shards: ShardSet,
    fetch: CancelToken,
    incoming: Receiver<Result<Node>>,
    requests: Receiver<Request>,
    pending: Vec<Request>,
    started: Instant,
}

impl Session {
    fn run(mut self) {
        loop {
            match self.next_event() {
                Event::Shard(Ok(node)) => {
                    if let Some(m) = &self.inner.metrics {
                        m.record_shard_filled();
                    }
                    if !self.shards.fill(&node) {
                        debug!(parent = %self.parent, "Enough shards to reconstruct");
                        break;
                    }
                }
                Event::Shard(Err(e)) => {
                    debug!(parent = %self.parent, error = %e, "Shard fetch failed");
                }
                Event::FetchClosed => {
                    debug!(parent = %self.parent, have = self.shards.have(), "Shard fetch finished");
                    break;
                }
                Event::Request(request) => self.accept(request),
                Event::RequestCancelled(i) => {
                    self.pending.swap_remove(i);
                    debug!(parent = %self.parent, remaining = self.pending.len(), "Dropped cancelled request");
                    if self.pending.is_empty() {
                        // Requests already queued keep the session alive.
                        let queued: Vec<Request> = self.requests.try_iter().collect();
                        for request in queued {
                            self.accept(request);
                        }
                        if self.pending.is_empty() {
                            break;
                        }
                    }
                }
                Event::Shutdown => {
                    debug!(parent = %self.parent, "Coordinator shut down");
                    break;
                }
            }
        }
        self.finish();
    }

    /// Block until the next event. Every handle registered here is read
    /// before returning, so nothing is borrowed past this call.
    fn next_event(&self) -> Event {
        const SHARD: usize = 0;
        const REQUEST: usize = 1;
        const SHUTDOWN: usize = 2;

        let mut select = Select::new();
        select.recv(&self.incoming);
        select.recv(&self.requests);
        select.recv(self.inner.token.done());
        for request in &self.pending {
            select.recv(request.token.done());
        }

        let op = select.select();
        match op.index() {
            SHARD => match op.recv(&self.incoming) {
                Ok(result) => Event::Shard(result),
                Err(_) => Event::FetchClosed,
            },
            REQUEST => match op.recv(&self.requests) {
                Ok(request) => Event::Request(request),
                Err(_) => Event::Shutdown,
            },
            SHUTDOWN => {
                let _ = op.recv(self.inner.token.done());
                Event::Shutdown
            }
            i => {
                let i = i - SHUTDOWN - 1;
                let _ = op.recv(self.pending[i].token.done());
                Event::RequestCancelled(i)
            }
        }
    }

    fn accept(&mut self, request: Request) {
        for id in &request.ids {
            if let Err(e) = self.shards.want(id) {
                warn!(parent = %self.parent, error = %e, "Request for unknown shard");
            }
        }
        self.pending.push(request);
    }

    fn finish(mut self) {
        self.fetch.cancel();

        // Deregister and take requests queued since the last event under the
        // same lock `recover` enqueues with, so none is lost.
        {
            let inner = Arc::clone(&self.inner);
            let mut sessions = inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(&self.parent);
            let late: Vec<Request> = self.requests.try_iter().collect();
            for request in late {
                self.accept(request);
            }
        }

        let before = self.shards.reconstructions();
        let mut answers = Vec::new();
        let mut failed = 0u64;
        for request in std::mem::take(&mut self.pending) {
            if request.token.is_cancelled() {
                continue;
            }
            let results: Vec<Result<Node>> = request
                .ids
                .iter()
                .map(|id| {
                    let result = self.shards.get(id);
                    if let Err(e) = &result {
                        failed += 1;
                        warn!(parent = %self.parent, %id, error = %e, "Recovery failed");
                    }
                    result
                })
                .collect();
            answers.push((request.reply, results));
        }

        if let Err(e) = self.shards.recover_wanted() {
            let missing = self.shards.missing();
            debug!(parent = %self.parent, missing = missing.len(), error = %e,
                "Wanted shards not recovered");
        }
        let nodes = self.shards.recovered();
        if !nodes.is_empty() {
            match self.inner.dag.add_many(&self.inner.token, &nodes) {
                Ok(()) => info!(parent = %self.parent, recovered = nodes.len(), "Recovered nodes"),
                Err(e) => error!(parent = %self.parent, error = %e, "Failed to persist recovered nodes"),
            }
        }

        if let Some(m) = &self.inner.metrics {
            for _ in before..self.shards.reconstructions() {
                m.record_reconstruction();
            }
            m.record_session_finished(
                self.started.elapsed().as_millis() as u64,
                nodes.len() as u64,
                failed,
            );
        }

        for (reply, results) in answers {
            for result in results {
                // The caller may have stopped listening.
                let _ = reply.send(result);
            }
        }
    }
}

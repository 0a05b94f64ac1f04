//! Hierarchical cancellation tokens.
//!
//! Every blocking operation in the crate takes a `CancelToken`. A token is
//! cancelled explicitly, by its deadline, or by its parent. Cancellation is
//! observable three ways:
//!
//! - `is_cancelled()` / `reason()` for polling,
//! - `done()`, a channel receiver that disconnects on cancellation, so it can
//!   sit in a `crossbeam_channel::select!` next to data channels,
//! - `check()`, which turns a cancelled token into the matching error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::Result;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on the token or on an ancestor.
    Cancelled,
    /// The token's deadline passed.
    DeadlineExceeded,
}

struct TokenState {
    cancelled: AtomicBool,
    reason: RwLock<Option<CancelReason>>,
    /// Dropped on cancellation, which disconnects every `done` receiver.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<TokenState>>>,
}

impl TokenState {
    fn new(deadline: Option<Instant>) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        Self {
            cancelled: AtomicBool::new(false),
            reason: RwLock::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            deadline,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        *self.reason.write().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.done_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // Cancel children without holding the lock.
        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
        true
    }
}

/// Cloneable handle to shared cancellation state.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    /// A root token that is only cancelled explicitly.
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState::new(None)),
        }
    }

    /// A child token: cancelled with this token, or on its own.
    pub fn child(&self) -> Self {
        self.make_child(self.state.deadline)
    }

    /// A child token that also cancels itself once `timeout` elapses.
    ///
    /// The deadline is enforced by a watcher thread that exits as soon as
    /// the token is cancelled for any other reason.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.state.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        let child = self.make_child(Some(deadline));

        let weak = Arc::downgrade(&child.state);
        let done = child.state.done_rx.clone();
        thread::spawn(move || {
            let wait = deadline.saturating_duration_since(Instant::now());
            if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(wait) {
                if let Some(state) = weak.upgrade() {
                    state.cancel(CancelReason::DeadlineExceeded);
                }
            }
        });

        child
    }

    fn make_child(&self, deadline: Option<Instant>) -> Self {
        let child = Self {
            state: Arc::new(TokenState::new(deadline)),
        };

        // Hold the children lock across the cancelled check: cancel() sets the
        // flag before draining children, so either we see the flag or it sees
        // our child.
        let mut children = self
            .state
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            drop(children);
            child
                .state
                .cancel(self.reason().unwrap_or(CancelReason::Cancelled));
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.state));
        }

        child
    }

    /// Request cancellation. Returns true if this call triggered it.
    pub fn cancel(&self) -> bool {
        self.state.cancel(CancelReason::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.state.reason.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.deadline
    }

    /// Receiver that never yields a value and disconnects on cancellation.
    pub fn done(&self) -> &Receiver<()> {
        &self.state.done_rx
    }

    /// `Err(Cancelled | DeadlineExceeded)` once the token is cancelled.
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .field("deadline", &self.state.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecoveryError;

    #[test]
    fn test_cancel_is_first_caller_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));
        assert!(matches!(token.check(), Err(RecoveryError::Cancelled)));
    }

    #[test]
    fn test_done_disconnects_on_cancel() {
        let token = CancelToken::new();
        assert!(token.done().try_recv().is_err());
        token.cancel();
        assert!(matches!(
            token.done().recv(),
            Err(crossbeam_channel::RecvError)
        ));
    }

    #[test]
    fn test_parent_cancels_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn test_timeout_fires() {
        let token = CancelToken::new().with_timeout(Duration::from_millis(20));
        assert!(matches!(
            token.done().recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        ));
        assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
        assert!(matches!(token.check(), Err(RecoveryError::DeadlineExceeded)));
    }

    #[test]
    fn test_explicit_cancel_beats_timeout() {
        let token = CancelToken::new().with_timeout(Duration::from_secs(60));
        token.cancel();
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_child_inherits_tighter_deadline() {
        let parent = CancelToken::new().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let parent = CancelToken::new();
        for _ in 0..100 {
            let _ = parent.child();
        }
        let _keep = parent.child();
        let live = parent.state.children.lock().unwrap().len();
        assert!(live <= 2, "expected pruned child list, got {live}");
    }
}

//! Recovery metrics
//!
//! Lightweight, thread-safe counters shared by the session coordinator and
//! the DAG session. One instance is created per process (or per test),
//! wrapped in `Arc`, and handed to every component that should report.
//!
//! # Overview
//!
//! Tracks:
//! - Recovery sessions started and requests that joined a running session
//! - Shards filled and reconstruction solves
//! - Nodes recovered and recovery attempts that failed
//! - Parent-cache hits and network fallbacks in the DAG session
//! - Session latencies with p50/p95/p99 over a rolling window
//!
//! `sessions_started` counts background fetches: two concurrent recoveries
//! of the same parent must leave it at 1.
//!
//! # Example
//!
//! ```no_run
//! use dagheal::metrics::RecoveryMetrics;
//!
//! let metrics = RecoveryMetrics::new();
//! metrics.record_session_started();
//! metrics.record_session_finished(12, 2, 0);
//!
//! let snap = metrics.snapshot();
//! println!("p50: {}ms", snap.session_p50_ms);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

/// Number of session latencies kept for percentile calculation.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Number of slow sessions kept for reporting.
const MAX_SLOW_SESSIONS: usize = 10;

/// Sessions taking at least this long are recorded as slow.
pub const SLOW_SESSION_THRESHOLD_MS: u64 = 500;

pub struct RecoveryMetrics {
    // ========================================================================
    // Coordinator
    // ========================================================================
    sessions_started: AtomicU64,
    sessions_joined: AtomicU64,
    shards_filled: AtomicU64,
    reconstructions: AtomicU64,
    nodes_recovered: AtomicU64,
    recovery_failures: AtomicU64,

    // ========================================================================
    // DAG session
    // ========================================================================
    parent_cache_hits: AtomicU64,
    network_fallbacks: AtomicU64,

    // ========================================================================
    // Latency
    // ========================================================================
    /// Rolling window of recent session durations.
    latencies_ms: Mutex<VecDeque<u64>>,
    latency_sum_ms: AtomicU64,
    slow_sessions: Mutex<VecDeque<SlowSession>>,

    started_at: Instant,
}

/// A session that ran for at least `SLOW_SESSION_THRESHOLD_MS`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlowSession {
    pub duration_ms: u64,
    pub nodes_recovered: u64,
    pub failures: u64,
    /// Milliseconds since the metrics were created.
    pub timestamp_ms: u64,
}

/// Point-in-time copy of all counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_joined: u64,
    pub shards_filled: u64,
    pub reconstructions: u64,
    pub nodes_recovered: u64,
    pub recovery_failures: u64,
    pub parent_cache_hits: u64,
    pub network_fallbacks: u64,

    pub session_p50_ms: u64,
    pub session_p95_ms: u64,
    pub session_p99_ms: u64,
    pub session_avg_ms: u64,

    pub slow_sessions: Vec<SlowSession>,
    pub uptime_secs: u64,
}

impl RecoveryMetrics {
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_joined: AtomicU64::new(0),
            shards_filled: AtomicU64::new(0),
            reconstructions: AtomicU64::new(0),
            nodes_recovered: AtomicU64::new(0),
            recovery_failures: AtomicU64::new(0),
            parent_cache_hits: AtomicU64::new(0),
            network_fallbacks: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            slow_sessions: Mutex::new(VecDeque::with_capacity(MAX_SLOW_SESSIONS)),
            started_at: Instant::now(),
        }
    }

    /// A new session (and its background fetch) was registered.
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was queued on a session that was already running.
    pub fn record_session_joined(&self) {
        self.sessions_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shard_filled(&self) {
        self.shards_filled.fetch_add(1, Ordering::Relaxed);
    }

    /// One erasure-code solve ran.
    pub fn record_reconstruction(&self) {
        self.reconstructions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parent_cache_hit(&self) {
        self.parent_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_fallback(&self) {
        self.network_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// A recovery attempt failed outside a session (e.g. in the getter).
    pub fn record_recovery_failure(&self) {
        self.recovery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished session.
    ///
    /// * `duration_ms` - time from registration to the last reply
    /// * `recovered` - nodes rebuilt by reconstruction (fetched shards excluded)
    /// * `failed` - ids answered with an error
    pub fn record_session_finished(&self, duration_ms: u64, recovered: u64, failed: u64) {
        self.nodes_recovered.fetch_add(recovered, Ordering::Relaxed);
        self.recovery_failures.fetch_add(failed, Ordering::Relaxed);

        {
            let mut latencies = self
                .latencies_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_SESSION_THRESHOLD_MS {
            let slow = SlowSession {
                duration_ms,
                nodes_recovered: recovered,
                failures: failed,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };
            let mut slow_sessions = self
                .slow_sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slow_sessions.len() >= MAX_SLOW_SESSIONS {
                slow_sessions.pop_front();
            }
            slow_sessions.push_back(slow);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = self
                .latencies_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;

                (p50, p95, p99, avg)
            }
        };

        let slow_sessions = self
            .slow_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_joined: self.sessions_joined.load(Ordering::Relaxed),
            shards_filled: self.shards_filled.load(Ordering::Relaxed),
            reconstructions: self.reconstructions.load(Ordering::Relaxed),
            nodes_recovered: self.nodes_recovered.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            parent_cache_hits: self.parent_cache_hits.load(Ordering::Relaxed),
            network_fallbacks: self.network_fallbacks.load(Ordering::Relaxed),
            session_p50_ms: p50,
            session_p95_ms: p95,
            session_p99_ms: p99,
            session_avg_ms: avg,
            slow_sessions,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for RecoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

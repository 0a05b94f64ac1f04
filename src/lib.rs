//! dagheal - self-healing Merkle DAGs
//!
//! A plain DAG node with K equal-size children can be encoded into a
//! recovery node carrying M Reed-Solomon parity shards. Any K of the K+M
//! shards then reconstruct the rest, so up to M lost children can be
//! recomputed instead of fetched.
//!
//! - `reedsolomon::encode` builds and persists recovery nodes
//! - `ReedSolomonRecoverer` coordinates recoveries, one session per parent
//! - `DagSession` and `HealingGetter` are node getters that heal misses
//!   through recently seen parents
//!
//! ```no_run
//! use std::sync::Arc;
//! use dagheal::{
//!     BlockDagService, CancelToken, DagSession, MemoryBlockStore, NodeGetter,
//!     ReedSolomonRecoverer, Strategy,
//! };
//!
//! let token = CancelToken::new();
//! let store = Arc::new(MemoryBlockStore::new());
//! let registry = Arc::new(dagheal::reedsolomon::registry());
//! let dag = Arc::new(BlockDagService::new(store.clone(), registry.clone()));
//! let recoverer = ReedSolomonRecoverer::new(&token, dag, registry.clone(), Strategy::Requested);
//! let session = DagSession::new(&token, store, Arc::new(recoverer), registry);
//!
//! let id = "raw:0000000000000000000000000000000000000000000000000000000000000000".parse().unwrap();
//! let _ = session.get(&token, &id);
//! ```

pub mod cancel;
pub mod cid;
pub mod config;
pub mod dag;
pub mod error;
pub mod exchange;
pub mod getter;
pub mod metrics;
pub mod node;
pub mod parents;
pub mod recovery;
pub mod reedsolomon;
pub mod session;
pub mod store;
pub mod strategy;
pub mod varint;

pub use cancel::{CancelReason, CancelToken};
pub use cid::Cid;
pub use config::RecoveryConfig;
pub use dag::{encode_dag, BlockDagService, DagService, NodeGetter};
pub use error::{RecoveryError, Result};
pub use exchange::{Exchange, OfflineExchange};
pub use getter::HealingGetter;
pub use metrics::{MetricsSnapshot, RecoveryMetrics};
pub use node::{Block, CodecRegistry, Link, Node, ProtoNode, RawNode, RecoveryNode};
pub use parents::ParentCache;
pub use recovery::{Encoder, Recoverability, Recoverer};
pub use reedsolomon::{ReedSolomonEncoder, ReedSolomonRecoverer};
pub use session::DagSession;
pub use store::{BlockStore, FsBlockStore, MemoryBlockStore};
pub use strategy::Strategy;

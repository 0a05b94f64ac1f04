//! Reed-Solomon recovery.
//!
//! A plain node with K equal-size children is encoded with M parity shards
//! into a `RecoveryNode` (codec `recovery-reedsolomon`). Any K of the K+M
//! shards then reconstruct the rest.
//!
//! - `encode`: build and persist a recovery node
//! - `shards`: per-node want/have bookkeeping and the reconstruction solve
//! - `recover`: one-shot recovery of known-lost children
//! - `recoverer`: the session coordinator behind the `Recoverer` trait

pub mod encode;
pub mod recover;
pub mod recoverer;
pub mod shards;

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::cid::RECOVERY_REEDSOLOMON;
use crate::dag::DagService;
use crate::error::Result;
use crate::node::{Block, CodecRegistry, Node, RecoveryNode};
use crate::recovery::{Encoder, Recoverability};

pub use encode::{encode, validate_node};
pub use recover::recover;
pub use recoverer::ReedSolomonRecoverer;
pub use shards::ShardSet;

/// Codec of Reed-Solomon recovery node blocks.
pub const CODEC: u64 = RECOVERY_REEDSOLOMON;

/// Parse a recovery node block.
pub fn decode_node(block: &Block) -> Result<Node> {
    Ok(Node::Recovery(RecoveryNode::decode(block.data())?))
}

/// Add the recovery node decoder to `registry`.
pub fn register(registry: &mut CodecRegistry) {
    registry.register(CODEC, decode_node);
}

/// Default registry plus the recovery node decoder.
pub fn registry() -> CodecRegistry {
    let mut registry = CodecRegistry::default();
    register(&mut registry);
    registry
}

/// `Encoder` over a DAG service.
#[derive(Clone)]
pub struct ReedSolomonEncoder {
    dag: Arc<dyn DagService>,
}

impl ReedSolomonEncoder {
    pub fn new(dag: Arc<dyn DagService>) -> Self {
        Self { dag }
    }
}

impl Encoder for ReedSolomonEncoder {
    fn encode(
        &self,
        token: &CancelToken,
        node: &Node,
        recoverability: Recoverability,
    ) -> Result<RecoveryNode> {
        encode::encode(token, self.dag.as_ref(), node, recoverability)
    }
}

//! Recovery interfaces.
//!
//! An `Encoder` turns a plain node into a recovery node by adding parity
//! shards. A `Recoverer` recomputes lost children of a recovery node from
//! whatever shards are still reachable.

use crossbeam_channel::Receiver;

use crate::cancel::CancelToken;
use crate::cid::Cid;
use crate::error::Result;
use crate::node::{Node, RecoveryNode};

/// Number of parity shards generated for a node: the maximum number of
/// lost shards it can recover from.
pub type Recoverability = usize;

pub trait Encoder: Send + Sync {
    /// Encode `node`, persisting its parity shards and the new recovery
    /// node. Higher recoverability costs more storage.
    fn encode(
        &self,
        token: &CancelToken,
        node: &Node,
        recoverability: Recoverability,
    ) -> Result<RecoveryNode>;
}

pub trait Recoverer: Send + Sync {
    /// Recover `ids` from the shards of `node`.
    ///
    /// The outer `Result` fails only when the request can't be started.
    /// Each requested id then yields exactly one result on the channel,
    /// unless `token` is cancelled first.
    fn recover(
        &self,
        token: &CancelToken,
        node: &RecoveryNode,
        ids: &[Cid],
    ) -> Result<Receiver<Result<Node>>>;
}

//! One-shot recovery without a session coordinator.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::cid::Cid;
use crate::dag::DagService;
use crate::error::{RecoveryError, Result};
use crate::node::{CodecRegistry, Node, RecoveryNode};
use crate::reedsolomon::shards::ShardSet;

/// Recompute the children of `node` named in `lost`.
///
/// Every other shard is fetched once; ids in `lost` are not requested.
/// Every position that could not be fetched is reconstructed and written
/// back to `dag`, and the nodes for `lost` are returned in order.
///
/// Fails with `RecoveryExceeded` when more than M shards are unavailable
/// and with `Cancelled`/`DeadlineExceeded` when `token` fires mid-fetch.
pub fn recover(
    token: &CancelToken,
    dag: &dyn DagService,
    registry: Arc<CodecRegistry>,
    node: &RecoveryNode,
    lost: &[Cid],
) -> Result<Vec<Node>> {
    let mut shards = ShardSet::new(node, registry)?;
    for id in lost {
        shards.want(id)?;
    }

    let ids: Vec<Cid> = shards
        .ids()
        .into_iter()
        .filter(|id| !lost.contains(id))
        .collect();
    for result in dag.get_many(token, ids) {
        match result {
            Ok(node) => {
                shards.fill(&node);
            }
            Err(e) if e.is_not_found() => debug!(error = %e, "Shard unavailable"),
            Err(e) => return Err(e),
        }
    }
    token.check()?;

    let unavailable = shards.data_shards() + shards.parity_shards() - shards.have();
    if unavailable > shards.parity_shards() {
        return Err(RecoveryError::RecoveryExceeded);
    }

    shards.want_all();
    let mut nodes = Vec::with_capacity(lost.len());
    for id in lost {
        nodes.push(shards.get(id)?);
    }

    let recovered = shards.recover_wanted()?;
    dag.add_many(token, &recovered)?;
    info!(parent = %node.cid(), recovered = recovered.len(), "Recovered nodes");
    Ok(nodes)
}

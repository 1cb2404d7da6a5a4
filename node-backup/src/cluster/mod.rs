//! Cluster control: the commands the agent issues to the live database node.

pub mod nodetool;

use crate::utils::errors::Result;
use async_trait::async_trait;

pub use nodetool::NodetoolClusterControl;

/// Management interface of the local database node.
///
/// Failures are returned as errors; implementations must not report them
/// through a status value.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Snapshot `entities` (keyspaces or `ks.table` pairs) under `tag`. An
    /// empty list snapshots the whole node. A tag already held on the node is
    /// an error.
    async fn take_snapshot(&self, tag: &str, entities: &[String]) -> Result<()>;

    /// Remove snapshot `tag`. Removing a missing snapshot succeeds.
    async fn clear_snapshot(&self, tag: &str) -> Result<()>;

    /// Tokens currently owned by this node.
    async fn tokens(&self) -> Result<Vec<String>>;
}

//! Fan-out of a global request to the agents of every member node.
//!
//! Each member gets its own non-global copy of the request, stored below a
//! per-node prefix. The coordinator submits it over HTTP, then polls the
//! member's operation until it is terminal or the request deadline passes.
//! A request naming a datacenter only goes to the nodes of that datacenter.

use super::{NodeOutcome, Operation, OperationState};
use crate::request::{NodeEndpoint, OperationRequest};
use crate::transfer::{ProgressReport, ProgressSink};
use crate::utils::errors::{BackupError, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consecutive failed polls after which a member counts as lost
const MAX_POLL_FAILURES: u32 = 5;

/// Nodes that take part in `request`
pub fn member_nodes(request: &OperationRequest) -> Vec<&NodeEndpoint> {
    match request.datacenter() {
        Some(datacenter) => request
            .nodes()
            .iter()
            .filter(|node| node.in_datacenter(datacenter))
            .collect(),
        None => request.nodes().iter().collect(),
    }
}

/// Run `request` on every member node and wait for all of them.
///
/// Outcomes come back in node order. The result is an error when any member
/// did not complete.
pub async fn coordinate(
    http: &reqwest::Client,
    request: &OperationRequest,
    poll_interval: Duration,
    progress: Arc<dyn ProgressSink>,
) -> (Vec<NodeOutcome>, Result<()>) {
    let nodes = member_nodes(request);
    let deadline = request.timeout();

    info!(
        kind = %request.kind(),
        nodes = nodes.len(),
        skipped = request.nodes().len() - nodes.len(),
        datacenter = request.datacenter().unwrap_or("*"),
        "Coordinating request across nodes"
    );

    let mut pending: FuturesUnordered<_> = nodes
        .iter()
        .enumerate()
        .map(|(index, &node)| {
            let member = request.for_member(node);
            async move {
                let outcome = run_member(http, node, &member, poll_interval, deadline).await;
                (index, outcome)
            }
        })
        .collect();

    let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; nodes.len()];
    let mut settled = 0;
    while let Some((index, outcome)) = pending.next().await {
        settled += 1;
        progress
            .report(ProgressReport {
                completed_entries: settled,
                total_entries: nodes.len(),
                ..Default::default()
            })
            .await;
        outcomes[index] = Some(outcome);
    }

    let outcomes: Vec<NodeOutcome> = outcomes.into_iter().flatten().collect();
    let result = aggregate(&outcomes);
    (outcomes, result)
}

fn aggregate(outcomes: &[NodeOutcome]) -> Result<()> {
    let failed: Vec<String> = outcomes
        .iter()
        .filter(|o| o.state != OperationState::Completed)
        .map(|o| format!("{}: {}", o.node, o.error.as_deref().unwrap_or("not completed")))
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        Err(BackupError::Coordination(format!(
            "{} of {} nodes failed ({})",
            failed.len(),
            outcomes.len(),
            failed.join("; ")
        )))
    }
}

async fn run_member(
    http: &reqwest::Client,
    node: &NodeEndpoint,
    member: &OperationRequest,
    poll_interval: Duration,
    deadline: Duration,
) -> NodeOutcome {
    let mut operation_id = None;

    let run = async {
        let submitted = submit(http, node, member).await?;
        operation_id = Some(submitted.id);
        debug!(node = %node.id, operation_id = %submitted.id, "Member operation submitted");
        poll(http, node, submitted.id, poll_interval).await
    };

    let finished = tokio::time::timeout(deadline, run).await;
    let outcome = match finished {
        Ok(Ok(operation)) => NodeOutcome {
            node: node.id.clone(),
            operation_id: Some(operation.id),
            state: operation.state,
            error: operation.error,
        },
        Ok(Err(e)) => NodeOutcome {
            node: node.id.clone(),
            operation_id,
            state: OperationState::Failed,
            error: Some(e.to_string()),
        },
        Err(_) => NodeOutcome {
            node: node.id.clone(),
            operation_id,
            state: OperationState::Failed,
            error: Some(BackupError::Timeout(deadline).to_string()),
        },
    };

    match outcome.state {
        OperationState::Completed => info!(node = %node.id, "Member operation completed"),
        _ => warn!(
            node = %node.id,
            "Member operation failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }

    outcome
}

async fn submit(
    http: &reqwest::Client,
    node: &NodeEndpoint,
    member: &OperationRequest,
) -> Result<Operation> {
    let response = http
        .post(format!("{}/operations", node.url))
        .json(member)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackupError::Coordination(format!(
            "node {} rejected the request with {}: {}",
            node.id, status, body
        )));
    }

    Ok(response.json().await?)
}

async fn poll(
    http: &reqwest::Client,
    node: &NodeEndpoint,
    id: Uuid,
    poll_interval: Duration,
) -> Result<Operation> {
    let url = format!("{}/operations/{}", node.url, id);
    let mut failures = 0;

    loop {
        tokio::time::sleep(poll_interval).await;

        let fetched = async {
            let operation: Operation = http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<_, BackupError>(operation)
        }
        .await;

        match fetched {
            Ok(operation) if operation.state.is_terminal() => return Ok(operation),
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(node = %node.id, "Polling operation {} failed ({}): {}", id, failures, e);
                if failures >= MAX_POLL_FAILURES {
                    return Err(BackupError::Coordination(format!(
                        "lost contact with node {} after {} failed polls",
                        node.id, failures
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(node: &str, state: OperationState, error: Option<&str>) -> NodeOutcome {
        NodeOutcome {
            node: node.to_string(),
            operation_id: None,
            state,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_aggregate_all_completed() {
        let outcomes = vec![
            outcome("node1", OperationState::Completed, None),
            outcome("node2", OperationState::Completed, None),
        ];
        assert!(aggregate(&outcomes).is_ok());
    }

    #[test]
    fn test_aggregate_names_failed_nodes() {
        let outcomes = vec![
            outcome("node1", OperationState::Completed, None),
            outcome("node2", OperationState::Failed, Some("disk full")),
        ];

        let err = aggregate(&outcomes).unwrap_err().to_string();
        assert!(err.contains("1 of 2 nodes failed"));
        assert!(err.contains("node2: disk full"));
        assert!(!err.contains("node1"));
    }

    #[test]
    fn test_datacenter_selects_members() {
        use crate::request::{BackupRequest, StorageLocation};

        let mut request = BackupRequest::new(StorageLocation::parse("memory://bucket").unwrap());
        request.global_request = true;
        request.nodes = vec![
            "dc1:node1@http://10.0.0.1:9990".parse().unwrap(),
            "dc2:node2@http://10.0.1.1:9990".parse().unwrap(),
            "node3@http://10.0.2.1:9990".parse().unwrap(),
            "dc1:node4@http://10.0.0.2:9990".parse().unwrap(),
        ];

        let everyone = OperationRequest::Backup(request.clone());
        assert_eq!(member_nodes(&everyone).len(), 4);

        request.datacenter = Some("dc1".to_string());
        let dc1 = OperationRequest::Backup(request);
        let ids: Vec<&str> = member_nodes(&dc1).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["node1", "node4"]);
    }

    #[tokio::test]
    async fn test_unreachable_member_fails() {
        use crate::request::{BackupRequest, StorageLocation};
        use crate::transfer::NoProgress;

        // Port 9 (discard) on localhost is not served
        let mut request = BackupRequest::new(StorageLocation::parse("memory://bucket").unwrap());
        request.global_request = true;
        request.nodes = vec!["node1@http://127.0.0.1:9".parse().unwrap()];
        let request = OperationRequest::Backup(request);

        let (outcomes, result) = coordinate(
            &reqwest::Client::new(),
            &request,
            Duration::from_millis(10),
            Arc::new(NoProgress),
        )
        .await;

        assert!(matches!(result, Err(BackupError::Coordination(_))));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].state, OperationState::Failed);
        assert!(outcomes[0].operation_id.is_none());
    }
}

//! Snapshot lifecycle: take a snapshot, and clear it exactly once afterwards.

use crate::cluster::ClusterControl;
use crate::entities::DatabaseEntities;
use crate::utils::errors::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Take snapshot `tag` of `entities` and return the guard that clears it.
pub async fn take_snapshot(
    control: Arc<dyn ClusterControl>,
    entities: &DatabaseEntities,
    tag: &str,
) -> Result<SnapshotGuard> {
    let targets = entities.snapshot_targets();

    if targets.is_empty() {
        info!("Taking snapshot {} on all keyspaces", tag);
    } else {
        info!("Taking snapshot {} on {:?}", tag, targets);
    }

    control.take_snapshot(tag, &targets).await?;

    Ok(SnapshotGuard::new(control, tag))
}

/// Owns a taken snapshot until it is cleared.
///
/// [`SnapshotGuard::clear`] calls the cluster at most once and never fails;
/// errors are logged. A guard dropped without being cleared (early return,
/// panic, aborted task) schedules the clear on the current runtime.
pub struct SnapshotGuard {
    control: Arc<dyn ClusterControl>,
    tag: String,
    cleared: bool,
}

impl SnapshotGuard {
    pub fn new(control: Arc<dyn ClusterControl>, tag: &str) -> Self {
        Self {
            control,
            tag: tag.to_string(),
            cleared: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn clear(&mut self) {
        if self.cleared {
            return;
        }
        self.cleared = true;

        clear_snapshot(self.control.as_ref(), &self.tag).await;
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        if self.cleared {
            return;
        }
        self.cleared = true;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Snapshot {} was not cleared, clearing in background", self.tag);
                let control = Arc::clone(&self.control);
                let tag = std::mem::take(&mut self.tag);
                handle.spawn(async move {
                    clear_snapshot(control.as_ref(), &tag).await;
                });
            }
            Err(_) => {
                error!("Snapshot {} was not cleared and no runtime is available", self.tag);
            }
        }
    }
}

async fn clear_snapshot(control: &dyn ClusterControl, tag: &str) {
    match control.clear_snapshot(tag).await {
        Ok(()) => info!("Cleared snapshot {}", tag),
        Err(e) => error!("Failed to clear snapshot {}: {}", tag, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::BackupError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<String>>,
        fail_clear: bool,
    }

    impl RecordingControl {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterControl for RecordingControl {
        async fn take_snapshot(&self, tag: &str, entities: &[String]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("take {} {}", tag, entities.join(",")));
            Ok(())
        }

        async fn clear_snapshot(&self, tag: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("clear {}", tag));
            if self.fail_clear {
                return Err(BackupError::Cluster("connection refused".to_string()));
            }
            Ok(())
        }

        async fn tokens(&self) -> Result<Vec<String>> {
            Ok(vec!["0".to_string()])
        }
    }

    #[tokio::test]
    async fn test_clear_runs_once() {
        let control = Arc::new(RecordingControl::default());
        let entities = DatabaseEntities::parse("ks1.t1").unwrap();

        let mut guard = take_snapshot(control.clone(), &entities, "tag1").await.unwrap();
        guard.clear().await;
        guard.clear().await;
        drop(guard);

        assert_eq!(control.calls(), vec!["take tag1 ks1.t1", "clear tag1"]);
    }

    #[tokio::test]
    async fn test_clear_failure_is_swallowed() {
        let control = Arc::new(RecordingControl {
            fail_clear: true,
            ..RecordingControl::default()
        });

        let mut guard = take_snapshot(control.clone(), &DatabaseEntities::All, "tag1")
            .await
            .unwrap();
        guard.clear().await;
        guard.clear().await;

        assert_eq!(control.calls(), vec!["take tag1 ", "clear tag1"]);
    }

    #[tokio::test]
    async fn test_dropped_guard_clears_in_background() {
        let control = Arc::new(RecordingControl::default());

        let guard = take_snapshot(control.clone(), &DatabaseEntities::All, "tag1")
            .await
            .unwrap();
        assert_eq!(guard.tag(), "tag1");
        drop(guard);

        for _ in 0..50 {
            if control.calls().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(control.calls(), vec!["take tag1 ", "clear tag1"]);
    }
}

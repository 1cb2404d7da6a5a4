//! Cooperative stop of a running operation.
//!
//! A timeout or a cancel does not drop the operation from outside. It raises
//! the signal, the operation abandons its current step and still runs its
//! cleanup (clearing the snapshot, releasing the lock) before it returns the
//! stop error.

use crate::utils::errors::{BackupError, Result};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why an operation was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Timeout(Duration),
}

impl From<StopReason> for BackupError {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Cancelled => BackupError::Cancelled,
            StopReason::Timeout(after) => BackupError::Timeout(after),
        }
    }
}

/// Shared between an operation and whoever may stop it. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the operation to stop. The first reason wins.
    pub fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Resolves with the stop error once the signal is raised.
    pub async fn stopped(&self) -> BackupError {
        self.token.cancelled().await;
        self.reason().unwrap_or(StopReason::Cancelled).into()
    }

    /// Run `step` unless the signal is raised first. A step still in flight
    /// when the signal arrives is dropped.
    pub async fn run<T, F>(&self, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            err = self.stopped() => Err(err),
            result = step => result,
        }
    }
}

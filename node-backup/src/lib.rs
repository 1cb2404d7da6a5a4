//! Node Backup Library
//!
//! Snapshot-based backup and restore of database cluster nodes to object
//! storage, run as tracked operations locally or across a cluster.

pub mod api;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod entities;
pub mod executor;
pub mod fs;
pub mod operations;
pub mod request;
pub mod storage;
pub mod transfer;
pub mod utils;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use entities::DatabaseEntities;
pub use operations::{Engine, Operation, OperationState, OperationsService};
pub use request::{
    BackupRequest, CommitLogRestoreRequest, OperationRequest, RestoreRequest, StorageLocation,
};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;

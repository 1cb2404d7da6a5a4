//! Filesystem helpers: node-wide locking and snapshot directory discovery.

pub mod lock;
pub mod walker;

pub use lock::GlobalLock;

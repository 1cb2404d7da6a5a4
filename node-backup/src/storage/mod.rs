//! Provider-agnostic object storage.
//!
//! An operation resolves its storage location's provider in a
//! [`StorageRegistry`] and gets back three capabilities: a [`BucketService`]
//! to make sure the bucket exists, a [`Backuper`] for uploads and a
//! [`Restorer`] for downloads. Every capability instance belongs to one
//! operation and is dropped when that operation ends.

pub mod object;

use crate::request::{StorageLocation, StorageOptions};
use crate::transfer::TransferMeter;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub use object::{MemoryBuckets, ObjectStoreBackend, ObjectStoreFactory};

/// Metadata of an object already present in storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// An object found by listing, keyed relative to the storage location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait BucketService: Send + Sync {
    async fn create_if_missing(&self, bucket: &str) -> Result<()>;
}

/// Upload side. Keys are relative to the storage location.
#[async_trait]
pub trait Backuper: Send + Sync {
    async fn remote_object(&self, key: &str) -> Result<Option<RemoteObject>>;

    /// Stream `local` to `key`, reporting every chunk to `meter`.
    async fn upload_file(&self, local: &Path, key: &str, meter: &TransferMeter) -> Result<()>;

    /// Mark an up-to-date object as current without transferring it.
    async fn freshen(&self, key: &str) -> Result<()>;
}

/// Download side. Keys are relative to the storage location.
#[async_trait]
pub trait Restorer: Send + Sync {
    async fn download_text(&self, key: &str) -> Result<String>;

    /// Every object below the directory `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<ListedObject>>;

    /// Stream `key` into `local`, replacing it atomically. Returns the byte count.
    async fn download_file(&self, key: &str, local: &Path, meter: &TransferMeter) -> Result<u64>;
}

/// Builds the storage capabilities of one provider.
pub trait StorageFactory: Send + Sync {
    fn bucket_service(&self, options: &StorageOptions) -> Result<Box<dyn BucketService>>;

    fn backuper(&self, location: &StorageLocation, options: &StorageOptions)
        -> Result<Arc<dyn Backuper>>;

    fn restorer(&self, location: &StorageLocation, options: &StorageOptions)
        -> Result<Arc<dyn Restorer>>;
}

/// Provider name to factory mapping
#[derive(Clone, Default)]
pub struct StorageRegistry {
    factories: HashMap<String, Arc<dyn StorageFactory>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider. All `memory://` locations
    /// resolved through this registry share one set of in-memory buckets.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let memory = MemoryBuckets::default();

        for provider in crate::request::KNOWN_PROVIDERS {
            if let Some(factory) = ObjectStoreFactory::for_provider(provider, memory.clone()) {
                registry.register(provider, Arc::new(factory));
            }
        }

        registry
    }

    pub fn register(&mut self, provider: &str, factory: Arc<dyn StorageFactory>) {
        self.factories.insert(provider.to_ascii_lowercase(), factory);
    }

    pub fn resolve(&self, provider: &str) -> Result<Arc<dyn StorageFactory>> {
        self.factories
            .get(&provider.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| BackupError::UnknownProvider(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_knows_every_provider() {
        let registry = StorageRegistry::with_defaults();
        assert_eq!(
            registry.providers(),
            vec!["azure", "file", "gcp", "memory", "minio", "s3"]
        );
        assert!(registry.resolve("S3").is_ok());
    }

    #[test]
    fn test_unknown_provider() {
        let registry = StorageRegistry::new();
        assert!(matches!(
            registry.resolve("file"),
            Err(BackupError::UnknownProvider(p)) if p == "file"
        ));
    }
}

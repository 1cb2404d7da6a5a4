//! `object_store` backed implementation of the storage capabilities.

use super::{Backuper, BucketService, ListedObject, RemoteObject, Restorer, StorageFactory};
use crate::request::{StorageLocation, StorageOptions};
use crate::transfer::TransferMeter;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Files larger than this are uploaded in parts
pub const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Read buffer size for streaming uploads
const CHUNK_SIZE: usize = 1024 * 1024;

/// Parts buffered ahead of the multipart writer
const MULTIPART_CONCURRENCY: usize = 4;

/// Buckets of the `memory` provider, shared by every factory cloned from it.
#[derive(Clone, Default)]
pub struct MemoryBuckets {
    buckets: Arc<Mutex<HashMap<String, Arc<InMemory>>>>,
}

impl MemoryBuckets {
    pub fn bucket(&self, name: &str) -> Arc<InMemory> {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            buckets
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(InMemory::new())),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        match self.buckets.lock() {
            Ok(guard) => guard.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }
}

#[derive(Clone)]
enum Provider {
    File,
    Memory(MemoryBuckets),
    S3,
    Minio,
    Gcp,
    Azure,
}

/// How a freshened object is marked current
#[derive(Debug, Clone)]
enum FreshenMode {
    /// Bump the modification time of the backing file
    TouchFile(PathBuf),
    /// Copy the object onto itself, which resets its last-modified time
    CopyInPlace,
    /// Existence with a matching size is enough
    Nothing,
}

/// Factory for every provider `object_store` supports.
#[derive(Clone)]
pub struct ObjectStoreFactory {
    provider: Provider,
}

impl ObjectStoreFactory {
    /// Factory for `provider`, or `None` for an unsupported provider name.
    pub fn for_provider(provider: &str, memory: MemoryBuckets) -> Option<Self> {
        let provider = match provider {
            "file" => Provider::File,
            "memory" => Provider::Memory(memory),
            "s3" => Provider::S3,
            "minio" => Provider::Minio,
            "gcp" => Provider::Gcp,
            "azure" => Provider::Azure,
            _ => return None,
        };
        Some(Self { provider })
    }

    pub fn file() -> Self {
        Self {
            provider: Provider::File,
        }
    }

    pub fn memory(buckets: MemoryBuckets) -> Self {
        Self {
            provider: Provider::Memory(buckets),
        }
    }

    fn name(&self) -> &'static str {
        match self.provider {
            Provider::File => "file",
            Provider::Memory(_) => "memory",
            Provider::S3 => "s3",
            Provider::Minio => "minio",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
        }
    }

    fn open(&self, bucket: &str, options: &StorageOptions) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match &self.provider {
            Provider::File => {
                Arc::new(LocalFileSystem::new_with_prefix(options.file_root.join(bucket))?)
            }
            Provider::Memory(buckets) => buckets.bucket(bucket),
            Provider::S3 => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(endpoint) = &options.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                Arc::new(builder.build()?)
            }
            Provider::Minio => {
                let endpoint = options.endpoint.as_deref().ok_or_else(|| {
                    BackupError::InvalidRequest("minio storage requires an endpoint".to_string())
                })?;
                let builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
                Arc::new(builder.build()?)
            }
            Provider::Gcp => {
                Arc::new(GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket).build()?)
            }
            Provider::Azure => Arc::new(
                MicrosoftAzureBuilder::from_env()
                    .with_container_name(bucket)
                    .build()?,
            ),
        };

        Ok(store)
    }

    fn freshen_mode(&self, bucket: &str, options: &StorageOptions) -> FreshenMode {
        match self.provider {
            Provider::File => FreshenMode::TouchFile(options.file_root.join(bucket)),
            Provider::Memory(_) => FreshenMode::CopyInPlace,
            _ => FreshenMode::Nothing,
        }
    }

    fn backend(&self, location: &StorageLocation, options: &StorageOptions) -> Result<ObjectStoreBackend> {
        Ok(ObjectStoreBackend {
            store: self.open(&location.bucket, options)?,
            location: location.clone(),
            freshen: self.freshen_mode(&location.bucket, options),
        })
    }
}

impl StorageFactory for ObjectStoreFactory {
    fn bucket_service(&self, options: &StorageOptions) -> Result<Box<dyn BucketService>> {
        Ok(Box::new(ObjectStoreBucketService {
            factory: self.clone(),
            options: options.clone(),
        }))
    }

    fn backuper(
        &self,
        location: &StorageLocation,
        options: &StorageOptions,
    ) -> Result<Arc<dyn Backuper>> {
        Ok(Arc::new(self.backend(location, options)?))
    }

    fn restorer(
        &self,
        location: &StorageLocation,
        options: &StorageOptions,
    ) -> Result<Arc<dyn Restorer>> {
        Ok(Arc::new(self.backend(location, options)?))
    }
}

struct ObjectStoreBucketService {
    factory: ObjectStoreFactory,
    options: StorageOptions,
}

#[async_trait]
impl BucketService for ObjectStoreBucketService {
    async fn create_if_missing(&self, bucket: &str) -> Result<()> {
        match &self.factory.provider {
            Provider::File => {
                let dir = self.options.file_root.join(bucket);
                if !dir.is_dir() {
                    info!("Creating bucket directory {}", dir.display());
                    tokio::fs::create_dir_all(&dir).await?;
                }
            }
            Provider::Memory(buckets) => {
                buckets.bucket(bucket);
            }
            _ => {
                // Remote buckets are provisioned outside the agent; make sure
                // this one is reachable before anything is uploaded.
                let store = self.factory.open(bucket, &self.options)?;
                store.list_with_delimiter(None).await.map_err(|e| {
                    BackupError::Storage(format!(
                        "bucket {} on {} is not accessible: {}",
                        bucket,
                        self.factory.name(),
                        e
                    ))
                })?;
            }
        }

        debug!(bucket, provider = self.factory.name(), "Bucket is ready");
        Ok(())
    }
}

/// All three capabilities over one `ObjectStore` and storage location.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    location: StorageLocation,
    freshen: FreshenMode,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, location: StorageLocation) -> Self {
        Self {
            store,
            location,
            freshen: FreshenMode::Nothing,
        }
    }

    fn full_key(&self, key: &str) -> String {
        self.location.object_key(key)
    }

    /// Key relative to the location of a full object key
    fn relative_key<'a>(&self, full_key: &'a str) -> &'a str {
        if self.location.prefix.is_empty() {
            return full_key;
        }
        full_key
            .strip_prefix(self.location.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(full_key)
    }

    fn object_path(&self, key: &str) -> Result<ObjectPath> {
        let full_key = self.full_key(key);
        ObjectPath::parse(&full_key)
            .map_err(|e| BackupError::Storage(format!("invalid object key {}: {}", full_key, e)))
    }

    async fn put_small(
        &self,
        path: &ObjectPath,
        mut chunks: ReaderStream<tokio::fs::File>,
        size_hint: u64,
        meter: &TransferMeter,
    ) -> Result<()> {
        let mut data = BytesMut::with_capacity(size_hint as usize);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            meter.record(chunk.len() as u64).await;
            data.extend_from_slice(&chunk);
        }

        self.store.put(path, PutPayload::from_bytes(data.freeze())).await?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        path: &ObjectPath,
        mut chunks: ReaderStream<tokio::fs::File>,
        meter: &TransferMeter,
    ) -> Result<()> {
        let upload = self.store.put_multipart(path).await?;
        let mut writer = WriteMultipart::new(upload);

        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort_err) = writer.abort().await {
                        warn!("Failed to abort multipart upload of {}: {}", path, abort_err);
                    }
                    return Err(e.into());
                }
            };

            if let Err(e) = writer.wait_for_capacity(MULTIPART_CONCURRENCY).await {
                if let Err(abort_err) = writer.abort().await {
                    warn!("Failed to abort multipart upload of {}: {}", path, abort_err);
                }
                return Err(e.into());
            }

            meter.record(chunk.len() as u64).await;
            writer.write(&chunk);
        }

        writer.finish().await?;
        Ok(())
    }
}

#[async_trait]
impl Backuper for ObjectStoreBackend {
    async fn remote_object(&self, key: &str) -> Result<Option<RemoteObject>> {
        let path = self.object_path(key)?;

        match self.store.head(&path).await {
            Ok(meta) => Ok(Some(RemoteObject {
                size: meta.size as u64,
                last_modified: meta.last_modified,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_file(&self, local: &Path, key: &str, meter: &TransferMeter) -> Result<()> {
        let path = self.object_path(key)?;
        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        let chunks = ReaderStream::with_capacity(file, CHUNK_SIZE);

        debug!(key = %path, size, "Uploading");

        if size > MULTIPART_THRESHOLD {
            self.put_multipart(&path, chunks, meter).await
        } else {
            self.put_small(&path, chunks, size, meter).await
        }
    }

    async fn freshen(&self, key: &str) -> Result<()> {
        match &self.freshen {
            FreshenMode::TouchFile(root) => {
                let file = root.join(self.full_key(key));
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    std::fs::File::options()
                        .write(true)
                        .open(&file)?
                        .set_modified(SystemTime::now())
                })
                .await??;
            }
            FreshenMode::CopyInPlace => {
                let path = self.object_path(key)?;
                self.store.copy(&path, &path).await?;
            }
            FreshenMode::Nothing => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Restorer for ObjectStoreBackend {
    async fn download_text(&self, key: &str) -> Result<String> {
        let path = self.object_path(key)?;
        let bytes = self.store.get(&path).await?.bytes().await?;

        String::from_utf8(bytes.to_vec())
            .map_err(|e| BackupError::Storage(format!("object {} is not UTF-8: {}", path, e)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ListedObject>> {
        let path = self.object_path(prefix)?;

        let mut objects: Vec<ListedObject> = self
            .store
            .list(Some(&path))
            .map_ok(|meta| ListedObject {
                key: self.relative_key(meta.location.as_ref()).to_string(),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            })
            .try_collect()
            .await?;
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        debug!(prefix = %path, objects = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn download_file(&self, key: &str, local: &Path, meter: &TransferMeter) -> Result<u64> {
        let path = self.object_path(key)?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut partial = local.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let mut stream = self.store.get(&path).await?.into_stream();
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;

        let copied: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                meter.record(chunk.len() as u64).await;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        drop(file);

        if let Err(e) = copied {
            if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                warn!("Unable to delete partial download {}: {}", partial.display(), remove_err);
            }
            return Err(e);
        }

        tokio::fs::rename(&partial, local).await?;
        debug!(key = %path, bytes = written, "Downloaded");

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn location(raw: &str) -> StorageLocation {
        StorageLocation::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_memory_upload_head_download() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a-Data.db");
        fs::write(&source, b"hello world").unwrap();

        let buckets = MemoryBuckets::default();
        let factory = ObjectStoreFactory::memory(buckets.clone());
        let options = StorageOptions::default();
        let location = location("memory://bucket/node1");

        factory
            .bucket_service(&options)
            .unwrap()
            .create_if_missing("bucket")
            .await
            .unwrap();
        assert!(buckets.contains("bucket"));

        let backuper = factory.backuper(&location, &options).unwrap();
        assert!(backuper.remote_object("data/ks1/t1/a-Data.db").await.unwrap().is_none());

        let meter = TransferMeter::unlimited();
        backuper
            .upload_file(&source, "data/ks1/t1/a-Data.db", &meter)
            .await
            .unwrap();
        assert_eq!(meter.transferred(), 11);

        let remote = backuper.remote_object("data/ks1/t1/a-Data.db").await.unwrap().unwrap();
        assert_eq!(remote.size, 11);

        // The location prefix is part of the stored key
        let raw = buckets.bucket("bucket");
        assert!(raw
            .head(&ObjectPath::from("node1/data/ks1/t1/a-Data.db"))
            .await
            .is_ok());

        let restorer = factory.restorer(&location, &options).unwrap();
        let target = temp_dir.path().join("restore/a-Data.db");
        let bytes = restorer
            .download_file("data/ks1/t1/a-Data.db", &target, &TransferMeter::unlimited())
            .await
            .unwrap();
        assert_eq!(bytes, 11);
        assert_eq!(fs::read(&target).unwrap(), b"hello world");
        assert!(!temp_dir.path().join("restore/a-Data.db.part").exists());
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("big-Data.db");
        let content: Vec<u8> = (0..(MULTIPART_THRESHOLD as usize + 1024 * 1024 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        fs::write(&source, &content).unwrap();

        let factory = ObjectStoreFactory::memory(MemoryBuckets::default());
        let options = StorageOptions::default();
        let location = location("memory://bucket");

        let backuper = factory.backuper(&location, &options).unwrap();
        backuper
            .upload_file(&source, "data/big-Data.db", &TransferMeter::unlimited())
            .await
            .unwrap();

        let remote = backuper.remote_object("data/big-Data.db").await.unwrap().unwrap();
        assert_eq!(remote.size, content.len() as u64);
    }

    #[tokio::test]
    async fn test_file_provider_freshen_touches_object() {
        let temp_dir = TempDir::new().unwrap();
        let options = StorageOptions {
            file_root: temp_dir.path().join("storage"),
            endpoint: None,
        };
        let factory = ObjectStoreFactory::file();
        let location = location("file://bucket/node1");

        factory
            .bucket_service(&options)
            .unwrap()
            .create_if_missing("bucket")
            .await
            .unwrap();

        let source = temp_dir.path().join("schema.cql");
        fs::write(&source, b"CREATE TABLE").unwrap();

        let backuper = factory.backuper(&location, &options).unwrap();
        backuper
            .upload_file(&source, "data/ks1/t1/tag1-schema.cql", &TransferMeter::unlimited())
            .await
            .unwrap();

        let stored = temp_dir
            .path()
            .join("storage/bucket/node1/data/ks1/t1/tag1-schema.cql");
        assert!(stored.is_file());

        let before = backuper
            .remote_object("data/ks1/t1/tag1-schema.cql")
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        backuper.freshen("data/ks1/t1/tag1-schema.cql").await.unwrap();
        let after = backuper
            .remote_object("data/ks1/t1/tag1-schema.cql")
            .await
            .unwrap()
            .unwrap();

        assert!(after.last_modified >= before.last_modified);
        assert_eq!(after.size, before.size);
    }

    #[tokio::test]
    async fn test_list_below_prefix() {
        let buckets = MemoryBuckets::default();
        let factory = ObjectStoreFactory::memory(buckets.clone());
        let bucket = buckets.bucket("bucket");
        for key in [
            "node1/commitlog/CommitLog-7-2.log",
            "node1/commitlog/CommitLog-7-1.log",
            "node1/manifests/tag1",
            "node2/commitlog/CommitLog-7-9.log",
        ] {
            bucket
                .put(&ObjectPath::from(key), PutPayload::from_static(b"log"))
                .await
                .unwrap();
        }

        let restorer = factory
            .restorer(&location("memory://bucket/node1"), &StorageOptions::default())
            .unwrap();
        let listed = restorer.list("commitlog").await.unwrap();

        let keys: Vec<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["commitlog/CommitLog-7-1.log", "commitlog/CommitLog-7-2.log"]);
        assert_eq!(listed[0].size, 3);

        assert!(restorer.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_download_fails() {
        let factory = ObjectStoreFactory::memory(MemoryBuckets::default());
        let restorer = factory
            .restorer(&location("memory://bucket"), &StorageOptions::default())
            .unwrap();

        assert!(restorer.download_text("manifests/missing").await.is_err());
    }
}

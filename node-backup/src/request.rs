//! Backup, restore and commit log restore requests.
//!
//! Requests are immutable once validated. They serialize to JSON so a
//! coordinating agent can submit them to its peers.

use crate::entities::DatabaseEntities;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Storage providers understood by the default registry
pub const KNOWN_PROVIDERS: &[&str] = &["file", "memory", "s3", "minio", "gcp", "azure"];

/// Where backups live: `<provider>://<bucket>[/<prefix>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageLocation {
    pub provider: String,
    pub bucket: String,
    pub prefix: String,
}

impl StorageLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            BackupError::InvalidRequest(format!("storage location '{}': {}", raw, reason))
        };

        let (provider, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("expected <provider>://<bucket>[/<path>]"))?;
        let provider = provider.to_ascii_lowercase();

        if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
            return Err(BackupError::UnknownProvider(provider));
        }

        let rest = rest.trim_matches('/');
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }

        Ok(Self {
            provider,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Full object key for a key relative to this location
    pub fn object_key(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }

    /// The same location with `segment` appended to the prefix
    pub fn child(&self, segment: &str) -> Self {
        Self {
            provider: self.provider.clone(),
            bucket: self.bucket.clone(),
            prefix: self.object_key(segment),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}://{}", self.provider, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.provider, self.bucket, self.prefix)
        }
    }
}

impl FromStr for StorageLocation {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        StorageLocation::parse(s)
    }
}

impl TryFrom<String> for StorageLocation {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        StorageLocation::parse(&value)
    }
}

impl From<StorageLocation> for String {
    fn from(location: StorageLocation) -> Self {
        location.to_string()
    }
}

/// Provider settings that are not part of the location itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Root directory of the `file` provider; buckets are directories below it
    #[serde(default = "default_file_root")]
    pub file_root: PathBuf,

    /// Custom endpoint for S3-compatible providers
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            file_root: default_file_root(),
            endpoint: None,
        }
    }
}

/// Concurrency and bandwidth limits of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Aggregate limit in bytes per second
    #[serde(default)]
    pub bandwidth: Option<u64>,

    /// Attempts after the first failure of one entry
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            bandwidth: None,
            retries: default_retries(),
        }
    }
}

/// Peer agent taking part in a coordinated request:
/// `[<datacenter>:]<id>@<url>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub id: String,
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

impl NodeEndpoint {
    /// Nodes without a datacenter are in no datacenter.
    pub fn in_datacenter(&self, datacenter: &str) -> bool {
        self.datacenter.as_deref() == Some(datacenter)
    }
}

impl FromStr for NodeEndpoint {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            BackupError::InvalidRequest(format!(
                "node '{}' is not in the form [<datacenter>:]<id>@http://host:port",
                s
            ))
        };

        let (name, url) = s.split_once('@').ok_or_else(invalid)?;
        if !url.starts_with("http") {
            return Err(invalid());
        }

        let (datacenter, id) = match name.split_once(':') {
            Some((dc, id)) if !dc.is_empty() => (Some(dc.to_string()), id),
            Some(_) => return Err(invalid()),
            None => (None, name),
        };
        if id.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            id: id.to_string(),
            url: url.trim_end_matches('/').to_string(),
            datacenter,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub storage_location: StorageLocation,

    #[serde(default)]
    pub storage_options: StorageOptions,

    /// Database directory; table data lives under `<dir>/data`
    #[serde(default = "default_cassandra_directory")]
    pub cassandra_directory: PathBuf,

    /// Staging area for generated files
    #[serde(default = "default_shared_path")]
    pub shared_path: PathBuf,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default)]
    pub wait_for_lock: bool,

    #[serde(default)]
    pub entities: DatabaseEntities,

    #[serde(default = "default_snapshot_tag")]
    pub snapshot_tag: String,

    #[serde(default)]
    pub transfer: TransferSettings,

    /// Upload existing snapshot directories without contacting the node
    #[serde(default)]
    pub offline_backup: bool,

    #[serde(default)]
    pub global_request: bool,

    #[serde(default)]
    pub nodes: Vec<NodeEndpoint>,

    /// Only nodes of this datacenter take part in a global request
    #[serde(default, alias = "dc")]
    pub datacenter: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl BackupRequest {
    /// Request with defaults for everything but the location
    pub fn new(storage_location: StorageLocation) -> Self {
        Self {
            storage_location,
            storage_options: StorageOptions::default(),
            cassandra_directory: default_cassandra_directory(),
            shared_path: default_shared_path(),
            lock_file: default_lock_file(),
            wait_for_lock: false,
            entities: DatabaseEntities::All,
            snapshot_tag: default_snapshot_tag(),
            transfer: TransferSettings::default(),
            offline_backup: false,
            global_request: false,
            nodes: Vec::new(),
            datacenter: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_snapshot_tag(&self.snapshot_tag)?;
        validate_common(&self.transfer, self.timeout_secs)?;
        validate_members(self.global_request, &self.nodes, self.datacenter.as_deref())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub storage_location: StorageLocation,

    #[serde(default)]
    pub storage_options: StorageOptions,

    #[serde(default = "default_cassandra_directory")]
    pub cassandra_directory: PathBuf,

    #[serde(default = "default_config_directory")]
    pub config_directory: PathBuf,

    #[serde(default = "default_shared_path")]
    pub shared_path: PathBuf,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default)]
    pub wait_for_lock: bool,

    #[serde(default)]
    pub entities: DatabaseEntities,

    pub snapshot_tag: String,

    #[serde(default)]
    pub transfer: TransferSettings,

    /// Also restore the `system` keyspace (single-node restores)
    #[serde(default)]
    pub restore_system_keyspace: bool,

    /// Rewrite `initial_token` in the node configuration from the backup
    #[serde(default)]
    pub update_config: bool,

    #[serde(default)]
    pub global_request: bool,

    #[serde(default)]
    pub nodes: Vec<NodeEndpoint>,

    #[serde(default, alias = "dc")]
    pub datacenter: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RestoreRequest {
    pub fn new(storage_location: StorageLocation, snapshot_tag: impl Into<String>) -> Self {
        Self {
            storage_location,
            storage_options: StorageOptions::default(),
            cassandra_directory: default_cassandra_directory(),
            config_directory: default_config_directory(),
            shared_path: default_shared_path(),
            lock_file: default_lock_file(),
            wait_for_lock: false,
            entities: DatabaseEntities::All,
            snapshot_tag: snapshot_tag.into(),
            transfer: TransferSettings::default(),
            restore_system_keyspace: false,
            update_config: false,
            global_request: false,
            nodes: Vec::new(),
            datacenter: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_snapshot_tag(&self.snapshot_tag)?;
        validate_common(&self.transfer, self.timeout_secs)?;
        validate_members(self.global_request, &self.nodes, self.datacenter.as_deref())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Fetch archived commit logs so the node replays them on its next start.
///
/// Commit logs are read from `commitlog/` below the storage location. Only
/// logs archived within `[timestamp_start, timestamp_end]` are restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogRestoreRequest {
    pub storage_location: StorageLocation,

    #[serde(default)]
    pub storage_options: StorageOptions,

    #[serde(default = "default_cassandra_directory")]
    pub cassandra_directory: PathBuf,

    /// Holds `commitlog_archiving.properties`
    #[serde(default = "default_config_directory")]
    pub config_directory: PathBuf,

    /// Where the logs are downloaded to; `<cassandra_directory>/commitlog_restore`
    /// when unset
    #[serde(default)]
    pub commit_log_restore_directory: Option<PathBuf>,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default)]
    pub wait_for_lock: bool,

    #[serde(default)]
    pub timestamp_start: Option<DateTime<Utc>>,

    /// Also the point in time the node replays up to
    #[serde(default)]
    pub timestamp_end: Option<DateTime<Utc>>,

    #[serde(default)]
    pub transfer: TransferSettings,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl CommitLogRestoreRequest {
    pub fn new(storage_location: StorageLocation) -> Self {
        Self {
            storage_location,
            storage_options: StorageOptions::default(),
            cassandra_directory: default_cassandra_directory(),
            config_directory: default_config_directory(),
            commit_log_restore_directory: None,
            lock_file: default_lock_file(),
            wait_for_lock: false,
            timestamp_start: None,
            timestamp_end: None,
            transfer: TransferSettings::default(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn restore_directory(&self) -> PathBuf {
        self.commit_log_restore_directory
            .clone()
            .unwrap_or_else(|| self.cassandra_directory.join("commitlog_restore"))
    }

    /// Whether a log archived at `archived_at` falls into the requested window
    pub fn includes(&self, archived_at: DateTime<Utc>) -> bool {
        self.timestamp_start.map_or(true, |start| archived_at >= start)
            && self.timestamp_end.map_or(true, |end| archived_at <= end)
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.timestamp_start, self.timestamp_end) {
            if start > end {
                return Err(BackupError::InvalidRequest(format!(
                    "timestamp_start {} is after timestamp_end {}",
                    start, end
                )));
            }
        }
        validate_common(&self.transfer, self.timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
    #[serde(rename = "commitlog-restore")]
    CommitlogRestore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => write!(f, "backup"),
            OperationKind::Restore => write!(f, "restore"),
            OperationKind::CommitlogRestore => write!(f, "commitlog-restore"),
        }
    }
}

/// Anything the operations service can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationRequest {
    Backup(BackupRequest),
    Restore(RestoreRequest),
    #[serde(rename = "commitlog-restore")]
    CommitlogRestore(CommitLogRestoreRequest),
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Backup(_) => OperationKind::Backup,
            OperationRequest::Restore(_) => OperationKind::Restore,
            OperationRequest::CommitlogRestore(_) => OperationKind::CommitlogRestore,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            OperationRequest::Backup(r) => r.validate(),
            OperationRequest::Restore(r) => r.validate(),
            OperationRequest::CommitlogRestore(r) => r.validate(),
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            OperationRequest::Backup(r) => r.timeout(),
            OperationRequest::Restore(r) => r.timeout(),
            OperationRequest::CommitlogRestore(r) => r.timeout(),
        }
    }

    /// Commit log restores always run on the receiving node only.
    pub fn is_global(&self) -> bool {
        match self {
            OperationRequest::Backup(r) => r.global_request,
            OperationRequest::Restore(r) => r.global_request,
            OperationRequest::CommitlogRestore(_) => false,
        }
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        match self {
            OperationRequest::Backup(r) => &r.nodes,
            OperationRequest::Restore(r) => &r.nodes,
            OperationRequest::CommitlogRestore(_) => &[],
        }
    }

    pub fn datacenter(&self) -> Option<&str> {
        match self {
            OperationRequest::Backup(r) => r.datacenter.as_deref(),
            OperationRequest::Restore(r) => r.datacenter.as_deref(),
            OperationRequest::CommitlogRestore(_) => None,
        }
    }

    /// The per-node request a coordinator submits to `node`: not global, and
    /// stored under the node's own prefix.
    pub fn for_member(&self, node: &NodeEndpoint) -> Self {
        match self {
            OperationRequest::Backup(r) => {
                let mut member = r.clone();
                member.global_request = false;
                member.nodes.clear();
                member.datacenter = None;
                member.storage_location = r.storage_location.child(&node.id);
                OperationRequest::Backup(member)
            }
            OperationRequest::Restore(r) => {
                let mut member = r.clone();
                member.global_request = false;
                member.nodes.clear();
                member.datacenter = None;
                member.storage_location = r.storage_location.child(&node.id);
                OperationRequest::Restore(member)
            }
            OperationRequest::CommitlogRestore(r) => OperationRequest::CommitlogRestore(r.clone()),
        }
    }
}

/// Tags become file and object names, so only `[A-Za-z0-9._-]` is allowed.
pub fn validate_snapshot_tag(tag: &str) -> Result<()> {
    if tag.trim().is_empty() {
        return Err(BackupError::InvalidRequest("snapshot tag must not be blank".to_string()));
    }
    if tag == "." || tag == ".." {
        return Err(BackupError::InvalidRequest(format!("invalid snapshot tag '{}'", tag)));
    }
    if let Some(c) = tag
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(BackupError::InvalidRequest(format!(
            "snapshot tag '{}' contains invalid character '{}'",
            tag, c
        )));
    }
    Ok(())
}

fn validate_common(transfer: &TransferSettings, timeout_secs: u64) -> Result<()> {
    if transfer.concurrency == 0 {
        return Err(BackupError::InvalidRequest("concurrency must be at least 1".to_string()));
    }
    if transfer.bandwidth == Some(0) {
        return Err(BackupError::InvalidRequest("bandwidth must be greater than 0".to_string()));
    }
    if timeout_secs == 0 {
        return Err(BackupError::InvalidRequest("timeout must be greater than 0".to_string()));
    }
    Ok(())
}

fn validate_members(
    global_request: bool,
    nodes: &[NodeEndpoint],
    datacenter: Option<&str>,
) -> Result<()> {
    if global_request && nodes.is_empty() {
        return Err(BackupError::InvalidRequest(
            "a global request needs at least one node".to_string(),
        ));
    }

    let Some(datacenter) = datacenter else {
        return Ok(());
    };
    if !global_request {
        return Err(BackupError::InvalidRequest(
            "a datacenter can only be set on a global request".to_string(),
        ));
    }
    if !nodes.iter().any(|node| node.in_datacenter(datacenter)) {
        return Err(BackupError::InvalidRequest(format!(
            "no node is in datacenter '{}'",
            datacenter
        )));
    }
    Ok(())
}

pub fn default_snapshot_tag() -> String {
    format!("autosnap-{}", chrono::Utc::now().timestamp())
}

fn default_cassandra_directory() -> PathBuf {
    PathBuf::from("/var/lib/cassandra")
}

fn default_config_directory() -> PathBuf {
    PathBuf::from("/etc/cassandra")
}

fn default_shared_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/tmp/node-backup.lock")
}

fn default_file_root() -> PathBuf {
    PathBuf::from("/var/lib/node-backup/storage")
}

fn default_concurrency() -> usize {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    5 * 60 * 60
}

//! Configuration management for the backup agent.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`NODE_BACKUP_<SECTION>__<KEY>`, e.g. `NODE_BACKUP_AGENT__PORT`).
//! Every field has a default, so an empty file is a valid configuration.

use crate::cluster::NodetoolClusterControl;
use crate::request::{
    BackupRequest, CommitLogRestoreRequest, RestoreRequest, StorageLocation, StorageOptions,
    TransferSettings,
};
use crate::utils::errors::Result;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "NODE_BACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub cassandra: CassandraConfig,

    #[serde(default)]
    pub storage: StorageOptions,

    #[serde(default)]
    pub transfer: TransferSettings,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Node identifier, also the per-node prefix of coordinated backups
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// HTTP/WebSocket server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared directory for staging files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CassandraConfig {
    #[serde(default = "default_cassandra_dir")]
    pub data_directory: PathBuf,

    #[serde(default = "default_cassandra_config_dir")]
    pub config_directory: PathBuf,

    #[serde(default = "default_nodetool")]
    pub nodetool: PathBuf,

    /// Extra arguments passed before every nodetool command (host, port, credentials)
    #[serde(default)]
    pub nodetool_args: Vec<String>,

    /// Target of commit log restores, `<data_directory>/commitlog_restore` when unset
    #[serde(default)]
    pub commit_log_restore_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_file")]
    pub file: PathBuf,

    /// Wait for a held lock instead of failing
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node-backup-01".to_string())
}

fn default_port() -> u16 {
    9990
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/node-backup")
}

fn default_cassandra_dir() -> PathBuf {
    PathBuf::from("/var/lib/cassandra")
}

fn default_cassandra_config_dir() -> PathBuf {
    PathBuf::from("/etc/cassandra")
}

fn default_nodetool() -> PathBuf {
    PathBuf::from("nodetool")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/tmp/node-backup.lock")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for CassandraConfig {
    fn default() -> Self {
        Self {
            data_directory: default_cassandra_dir(),
            config_directory: default_cassandra_config_dir(),
            nodetool: default_nodetool(),
            nodetool_args: Vec::new(),
            commit_log_restore_directory: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            file: default_lock_file(),
            wait: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load the optional file at `path`, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Cluster control for the configured nodetool
    pub fn cluster_control(&self) -> NodetoolClusterControl {
        NodetoolClusterControl::new(&self.cassandra.nodetool, self.cassandra.nodetool_args.clone())
    }

    /// Backup request for `location` with every other setting from this config
    pub fn backup_request(&self, location: StorageLocation) -> BackupRequest {
        let mut request = BackupRequest::new(location);
        request.storage_options = self.storage.clone();
        request.cassandra_directory = self.cassandra.data_directory.clone();
        request.shared_path = self.agent.data_dir.clone();
        request.lock_file = self.lock.file.clone();
        request.wait_for_lock = self.lock.wait;
        request.transfer = self.transfer.clone();
        request
    }

    /// Restore request for `location` and `snapshot_tag` with every other
    /// setting from this config
    pub fn restore_request(&self, location: StorageLocation, snapshot_tag: &str) -> RestoreRequest {
        let mut request = RestoreRequest::new(location, snapshot_tag);
        request.storage_options = self.storage.clone();
        request.cassandra_directory = self.cassandra.data_directory.clone();
        request.config_directory = self.cassandra.config_directory.clone();
        request.shared_path = self.agent.data_dir.clone();
        request.lock_file = self.lock.file.clone();
        request.wait_for_lock = self.lock.wait;
        request.transfer = self.transfer.clone();
        request
    }

    /// Commit log restore request for `location` with every other setting
    /// from this config
    pub fn commitlog_restore_request(&self, location: StorageLocation) -> CommitLogRestoreRequest {
        let mut request = CommitLogRestoreRequest::new(location);
        request.storage_options = self.storage.clone();
        request.cassandra_directory = self.cassandra.data_directory.clone();
        request.config_directory = self.cassandra.config_directory.clone();
        request.commit_log_restore_directory = self.cassandra.commit_log_restore_directory.clone();
        request.lock_file = self.lock.file.clone();
        request.wait_for_lock = self.lock.wait;
        request.transfer = self.transfer.clone();
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.agent.port, 9990);
        assert_eq!(config.transfer.concurrency, 10);
        assert_eq!(config.cassandra.nodetool, PathBuf::from("nodetool"));
        assert!(!config.lock.wait);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
[agent]
id = "node7"
port = 7000

[transfer]
concurrency = 4
bandwidth = 1048576

[lock]
wait = true
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.agent.id, "node7");
        assert_eq!(config.agent.port, 7000);
        assert_eq!(config.transfer.concurrency, 4);
        assert_eq!(config.transfer.bandwidth, Some(1_048_576));
        assert_eq!(config.transfer.retries, 3);
        assert!(config.lock.wait);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&temp_dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_requests_inherit_config() {
        let mut config = Config::default();
        config.agent.data_dir = PathBuf::from("/srv/shared");
        config.transfer.concurrency = 2;

        let location = StorageLocation::parse("memory://bucket").unwrap();
        let backup = config.backup_request(location.clone());
        assert_eq!(backup.shared_path, PathBuf::from("/srv/shared"));
        assert_eq!(backup.transfer.concurrency, 2);

        let restore = config.restore_request(location.clone(), "tag1");
        assert_eq!(restore.snapshot_tag, "tag1");
        assert_eq!(restore.config_directory, PathBuf::from("/etc/cassandra"));

        let commit_logs = config.commitlog_restore_request(location);
        assert_eq!(
            commit_logs.restore_directory(),
            PathBuf::from("/var/lib/cassandra/commitlog_restore")
        );
        assert_eq!(commit_logs.transfer.concurrency, 2);
    }

    #[test]
    fn test_renders_as_toml() {
        let rendered = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(rendered.contains("[agent]"));
        assert!(rendered.contains("[transfer]"));
    }
}

//! [`ClusterControl`] backed by the node's `nodetool` command.

use super::ClusterControl;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

pub struct NodetoolClusterControl {
    program: PathBuf,
    /// Connection arguments placed before the subcommand (host, port, credentials)
    global_args: Vec<String>,
}

impl NodetoolClusterControl {
    pub fn new(program: impl Into<PathBuf>, global_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            global_args,
        }
    }

    async fn run(&self, args: &[String]) -> std::result::Result<String, String> {
        debug!(program = %self.program.display(), ?args, "Running nodetool");

        let output = Command::new(&self.program)
            .args(&self.global_args)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.program.display(), e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            Err(format!(
                "{} {} exited with {}: {}",
                self.program.display(),
                args.join(" "),
                output.status,
                detail.trim()
            ))
        }
    }
}

/// Arguments of `nodetool snapshot` for a tag and entity list.
pub fn snapshot_args(tag: &str, entities: &[String]) -> Vec<String> {
    let mut args = vec!["snapshot".to_string(), "-t".to_string(), tag.to_string()];

    if entities.iter().any(|e| e.contains('.')) {
        args.push("-kt".to_string());
        args.push(entities.join(","));
    } else {
        args.extend(entities.iter().cloned());
    }

    args
}

/// Extract token values from `nodetool info -T` output (`Token : <value>`).
pub fn parse_tokens(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim() == "Token" {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .filter(|token| !token.is_empty())
        .collect()
}

#[async_trait]
impl ClusterControl for NodetoolClusterControl {
    async fn take_snapshot(&self, tag: &str, entities: &[String]) -> Result<()> {
        self.run(&snapshot_args(tag, entities))
            .await
            .map(|_| ())
            .map_err(BackupError::Snapshot)
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<()> {
        let args = vec!["clearsnapshot".to_string(), "-t".to_string(), tag.to_string()];
        self.run(&args).await.map(|_| ()).map_err(BackupError::Cluster)
    }

    async fn tokens(&self) -> Result<Vec<String>> {
        let args = vec!["info".to_string(), "-T".to_string()];
        let output = self.run(&args).await.map_err(BackupError::Cluster)?;

        let tokens = parse_tokens(&output);
        if tokens.is_empty() {
            return Err(BackupError::Cluster("node reported no tokens".to_string()));
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_args() {
        assert_eq!(snapshot_args("tag1", &[]), vec!["snapshot", "-t", "tag1"]);
        assert_eq!(
            snapshot_args("tag1", &["ks1".to_string(), "ks2".to_string()]),
            vec!["snapshot", "-t", "tag1", "ks1", "ks2"]
        );
        assert_eq!(
            snapshot_args("tag1", &["ks1.t1".to_string(), "ks2.t2".to_string()]),
            vec!["snapshot", "-t", "tag1", "-kt", "ks1.t1,ks2.t2"]
        );
    }

    #[test]
    fn test_parse_tokens() {
        let output = "ID                     : 5b1c\n\
                      Gossip active          : true\n\
                      Token                  : -9223372036854775808\n\
                      Token                  : 3074457345618258602\n\
                      Data Center            : dc1\n";
        assert_eq!(
            parse_tokens(output),
            vec!["-9223372036854775808", "3074457345618258602"]
        );
        assert!(parse_tokens("Gossip active : true\n").is_empty());
    }

    #[tokio::test]
    async fn test_failing_program_maps_to_snapshot_error() {
        let control = NodetoolClusterControl::new("false", Vec::new());
        let err = control.take_snapshot("tag1", &[]).await.unwrap_err();
        assert!(matches!(err, BackupError::Snapshot(_)));

        let err = control.clear_snapshot("tag1").await.unwrap_err();
        assert!(matches!(err, BackupError::Cluster(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let control = NodetoolClusterControl::new("/nonexistent/nodetool", Vec::new());
        assert!(control.tokens().await.is_err());
    }
}

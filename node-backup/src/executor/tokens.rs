//! Token ownership file.
//!
//! Written next to every online backup so a restore onto a fresh node can
//! reuse the original ring position via `initial_token` in `cassandra.yaml`.

use crate::executor::manifest::{EntryType, ManifestEntry};
use crate::utils::errors::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Remote directory holding token files
pub const TOKENS_DIR: &str = "tokens";

/// Node configuration file rewritten on restore
pub const CASSANDRA_YAML: &str = "cassandra.yaml";

const INITIAL_TOKEN_KEY: &str = "initial_token:";

/// Local file name of the token file for `tag`
pub fn token_file_name(tag: &str) -> String {
    format!("{}-tokens.yaml", tag)
}

/// Object key of the token file for `tag`
pub fn token_object_key(tag: &str) -> String {
    format!("{}/{}", TOKENS_DIR, token_file_name(tag))
}

pub fn render_token_file(tokens: &[String]) -> String {
    format!(
        "# automatically generated by node-backup\n\
         # add the following to cassandra.yaml when restoring to a new cluster.\n\
         {} {}\n",
        INITIAL_TOKEN_KEY,
        tokens.join(",")
    )
}

/// Extract the tokens from a token file.
pub fn parse_token_file(text: &str) -> Result<Vec<String>> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(INITIAL_TOKEN_KEY))
        .ok_or_else(|| BackupError::ManifestFormat("token file has no initial_token line".to_string()))?;

    let tokens: Vec<String> = line[INITIAL_TOKEN_KEY.len()..]
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    if tokens.is_empty() {
        return Err(BackupError::ManifestFormat("token file lists no tokens".to_string()));
    }

    Ok(tokens)
}

/// Write `<dir>/<tag>-tokens.yaml` and return its manifest entry.
pub fn save_token_list(dir: &Path, tag: &str, tokens: &[String]) -> Result<ManifestEntry> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(token_file_name(tag));

    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    std::fs::write(&path, render_token_file(tokens))?;

    ManifestEntry::local(token_object_key(tag), path, EntryType::File)
}

/// Set `initial_token` in the node configuration. An existing line, commented
/// out or not, is replaced; otherwise the setting is appended.
pub fn update_cassandra_yaml(config_directory: &Path, tokens: &[String]) -> Result<PathBuf> {
    let path = config_directory.join(CASSANDRA_YAML);
    let original = std::fs::read_to_string(&path)?;
    let setting = format!("{} {}", INITIAL_TOKEN_KEY, tokens.join(","));

    let mut replaced = false;
    let mut lines: Vec<String> = original
        .lines()
        .map(|line| {
            let bare = line.trim_start().trim_start_matches('#').trim_start();
            if !replaced && bare.starts_with(INITIAL_TOKEN_KEY) {
                replaced = true;
                setting.clone()
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        lines.push(setting);
    }

    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(&path, content)?;

    info!(
        config = %path.display(),
        tokens = tokens.len(),
        "Updated initial_token in node configuration"
    );

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tokens() -> Vec<String> {
        vec!["-9223372036854775808".to_string(), "0".to_string(), "42".to_string()]
    }

    #[test]
    fn test_render_token_file() {
        let text = render_token_file(&tokens());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('#'));
        assert!(lines[1].starts_with('#'));
        assert_eq!(lines[2], "initial_token: -9223372036854775808,0,42");
        assert_eq!(parse_token_file(&text).unwrap(), tokens());
    }

    #[test]
    fn test_parse_rejects_missing_tokens() {
        assert!(parse_token_file("# nothing here\n").is_err());
        assert!(parse_token_file("initial_token: \n").is_err());
    }

    #[test]
    fn test_save_token_list() {
        let temp_dir = TempDir::new().unwrap();
        let entry = save_token_list(temp_dir.path(), "tag1", &tokens()).unwrap();

        assert_eq!(entry.object_key, "tokens/tag1-tokens.yaml");
        assert_eq!(entry.entry_type, EntryType::File);
        let path = entry.local_file.unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), entry.size);
    }

    #[test]
    fn test_update_replaces_commented_setting() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CASSANDRA_YAML),
            "cluster_name: 'Test'\nnum_tokens: 3\n# initial_token:\nlisten_address: localhost\n",
        )
        .unwrap();

        update_cassandra_yaml(temp_dir.path(), &tokens()).unwrap();

        let content = fs::read_to_string(temp_dir.path().join(CASSANDRA_YAML)).unwrap();
        assert_eq!(
            content,
            "cluster_name: 'Test'\nnum_tokens: 3\ninitial_token: -9223372036854775808,0,42\nlisten_address: localhost\n"
        );
    }

    #[test]
    fn test_update_appends_when_absent() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(CASSANDRA_YAML), "cluster_name: 'Test'\n").unwrap();

        update_cassandra_yaml(temp_dir.path(), &["7".to_string()]).unwrap();

        let content = fs::read_to_string(temp_dir.path().join(CASSANDRA_YAML)).unwrap();
        assert_eq!(content, "cluster_name: 'Test'\ninitial_token: 7\n");
    }

    #[test]
    fn test_update_requires_existing_config() {
        let temp_dir = TempDir::new().unwrap();
        assert!(update_cassandra_yaml(temp_dir.path(), &tokens()).is_err());
    }
}

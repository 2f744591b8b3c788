//! Repository and task definitions shared between the config layer and the
//! command operations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Environment variable borg reads the passphrase from.
pub const PASSPHRASE_ENV: &str = "BORG_PASSPHRASE";

/// A borg repository as declared in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Name of the config entry; filled in from the table key.
    #[serde(skip)]
    pub name: String,
    /// Repository location (path or `user@host:path`).
    pub path: String,
    /// Compression spec passed to archive-creating commands.
    #[serde(default)]
    pub compression: Option<String>,
    /// Path of the borg binary on the remote side.
    #[serde(default)]
    pub remote_path: Option<String>,
    /// Repository passphrase. Delivered via the environment, never argv.
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl Repository {
    /// Create a repository with just a name and location.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            compression: None,
            remote_path: None,
            passphrase: None,
        }
    }

    /// Common options contributed by this repository.
    ///
    /// `create` adds the options that only make sense when writing archives.
    #[must_use]
    pub fn borg_args(&self, create: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(remote_path) = &self.remote_path {
            args.extend(["--remote-path".to_string(), remote_path.clone()]);
        }
        if create {
            if let Some(compression) = &self.compression {
                args.extend(["--compression".to_string(), compression.clone()]);
            }
        }
        args
    }

    /// Environment for borg subprocesses touching this repository.
    #[must_use]
    pub fn environment(&self) -> Vec<(String, String)> {
        self.passphrase
            .iter()
            .map(|passphrase| (PASSPHRASE_ENV.to_string(), passphrase.clone()))
            .collect()
    }
}

/// Renders the repository location; used to build `repo::archive` specs.
impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_prefix() -> String {
    "{hostname}".to_string()
}

/// A configured backup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Name of the repository this task backs up into.
    pub repository: String,
    /// Disabled tasks are skipped without error.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Archive name prefix.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Paths to include.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Exclude patterns.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Retention rules for pruning: interval name to count.
    #[serde(default)]
    pub keep: BTreeMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borg_args_plain_repo_is_empty() {
        let repo = Repository::new("r", "/backup/r");
        assert!(repo.borg_args(false).is_empty());
        assert!(repo.borg_args(true).is_empty());
    }

    #[test]
    fn borg_args_compression_only_on_create() {
        let mut repo = Repository::new("r", "/backup/r");
        repo.compression = Some("zstd,5".to_string());
        assert!(repo.borg_args(false).is_empty());
        assert_eq!(repo.borg_args(true), vec!["--compression", "zstd,5"]);
    }

    #[test]
    fn borg_args_remote_path_always() {
        let mut repo = Repository::new("r", "user@host:backup");
        repo.remote_path = Some("/usr/local/bin/borg".to_string());
        assert_eq!(repo.borg_args(false), vec!["--remote-path", "/usr/local/bin/borg"]);
    }

    #[test]
    fn passphrase_travels_in_environment() {
        let mut repo = Repository::new("r", "/backup/r");
        assert!(repo.environment().is_empty());
        repo.passphrase = Some("hunter2".to_string());
        assert_eq!(
            repo.environment(),
            vec![(PASSPHRASE_ENV.to_string(), "hunter2".to_string())]
        );
    }

    #[test]
    fn display_renders_the_location() {
        let repo = Repository::new("r", "user@host:backup");
        assert_eq!(format!("{repo}::daily"), "user@host:backup::daily");
    }
}

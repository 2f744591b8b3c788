//! Configuration types and loading.

mod loader;

pub use loader::ConfigLoader;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::repo::{Repository, Task};

/// Error type for configuration loading.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file was not valid TOML for this schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
}

/// Global engine settings (`[sya]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyaConfig {
    /// Pass `--verbose` to every borg invocation.
    pub verbose: bool,
    /// Override the borg binary to execute.
    pub binary: Option<String>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global settings.
    pub sya: SyaConfig,
    /// Repositories by name.
    pub repositories: BTreeMap<String, Repository>,
    /// Backup tasks by name.
    pub tasks: BTreeMap<String, Task>,
}

impl Config {
    /// Parse a configuration document, filling repository names in from
    /// their table keys.
    ///
    /// # Errors
    ///
    /// Returns the TOML error if the document does not match the schema.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(text)?;
        for (name, repo) in &mut config.repositories {
            repo.name.clone_from(name);
        }
        Ok(config)
    }

    /// Look up a repository by name.
    #[must_use]
    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }

    /// Look up a task by name.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [sya]
        verbose = true

        [repositories.offsite]
        path = "user@host:backup"
        compression = "zstd,5"
        passphrase = "hunter2"

        [tasks.home]
        repository = "offsite"
        prefix = "home"
        includes = ["/home"]
        excludes = ["/home/*/.cache"]

        [tasks.home.keep]
        daily = 7
        weekly = 4
    "#;

    #[test]
    fn parses_sample_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert!(config.sya.verbose);

        let repo = config.repository("offsite").unwrap();
        assert_eq!(repo.name, "offsite");
        assert_eq!(repo.path, "user@host:backup");
        assert_eq!(repo.compression.as_deref(), Some("zstd,5"));

        let task = config.task("home").unwrap();
        assert!(task.enabled);
        assert_eq!(task.prefix, "home");
        assert_eq!(task.includes, vec!["/home"]);
        assert_eq!(task.keep.get("daily"), Some(&7));
    }

    #[test]
    fn empty_document_is_valid() {
        let config = Config::from_toml_str("").unwrap();
        assert!(!config.sya.verbose);
        assert!(config.repositories.is_empty());
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn task_defaults_apply() {
        let config = Config::from_toml_str(
            r#"
            [repositories.local]
            path = "/backup/local"

            [tasks.etc]
            repository = "local"
            "#,
        )
        .unwrap();
        let task = config.task("etc").unwrap();
        assert!(task.enabled);
        assert_eq!(task.prefix, "{hostname}");
        assert!(task.includes.is_empty());
    }
}

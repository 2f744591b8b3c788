//! Configuration file loader.

use std::path::PathBuf;

use super::{Config, ConfigError};

/// Default config file name searched in the working directory.
const LOCAL_CONFIG: &str = "borg-sya.toml";

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a loader with the default search paths: the working directory
    /// first, then the user config directory.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("borg-sya").join("config.toml"));
        }
        Self { search_paths }
    }

    /// Create a loader pinned to a specific config file.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
        }
    }

    /// Load the first available config file, or defaults when none exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Config, ConfigError> {
        for path in &self.search_paths {
            if !path.exists() {
                continue;
            }
            tracing::debug!(path = %path.display(), "loading configuration");
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            return Config::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            });
        }
        tracing::debug!("no configuration file found, using defaults");
        Ok(Config::default())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_missing_file_yields_defaults() {
        let loader = ConfigLoader::with_path(PathBuf::from("/nonexistent/borg-sya.toml"));
        let config = loader.load().unwrap();
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn load_reads_pinned_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[repositories.local]\npath = \"/backup/local\"").unwrap();

        let loader = ConfigLoader::with_path(file.path().to_path_buf());
        let config = loader.load().unwrap();
        assert_eq!(config.repository("local").unwrap().path, "/backup/local");
    }

    #[test]
    fn load_invalid_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not [valid toml").unwrap();

        let loader = ConfigLoader::with_path(file.path().to_path_buf());
        let err = loader.load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}

use crate::core::config::data::{path_display, BackendConfig, Config};
use crate::core::config::discovery::discover_scripts;
use crate::mcp::transport::TransportKind;
use directories::ProjectDirs;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config at {}: {source}", path_display(.path))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    #[error("Failed to parse config at {}: {source}", path_display(.path))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to write config at {}: {message}", path_display(.path))]
    Write { path: PathBuf, message: String },

    #[error("Backend `{name}` is misconfigured: {reason}")]
    InvalidBackend { name: String, reason: String },

    #[error("No tool-provider backends are configured. Add [[servers.instances]] entries or point servers.directory at a folder of .py/.js scripts.")]
    NoBackends,

    #[error("Unable to determine the configuration directory")]
    NoConfigDir,
}

impl Config {
    /// Loads the config at `config_path`, falling back to defaults when the
    /// file does not exist.
    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let write_error = |message: String| ConfigError::Write {
            path: config_path.to_path_buf(),
            message,
        };
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(|err| write_error(err.to_string()))?;
        }

        let contents = toml::to_string_pretty(self).map_err(|err| write_error(err.to_string()))?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(|err| write_error(err.to_string()))?;

        temp_file
            .write_all(contents.as_bytes())
            .map_err(|err| write_error(err.to_string()))?;
        temp_file
            .as_file_mut()
            .sync_all()
            .map_err(|err| write_error(err.to_string()))?;
        temp_file
            .persist(config_path)
            .map_err(|err| write_error(err.to_string()))?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs =
            ProjectDirs::from("org", "switchboard", "switchboard").ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Returns the enabled backends with script paths resolved and kinds
    /// validated, in declaration order.
    ///
    /// When no instances are declared, every `.py`/`.js` script in
    /// `servers.directory` becomes a piped-script backend.
    pub fn resolve_backends(&self) -> Result<Vec<BackendConfig>, ConfigError> {
        let discovered = self.servers.instances.is_empty();
        let declared: Vec<BackendConfig> = if discovered {
            match &self.servers.directory {
                Some(directory) => discover_scripts(directory),
                None => Vec::new(),
            }
        } else {
            self.servers.instances.clone()
        };

        let mut seen = HashSet::new();
        let mut backends = Vec::new();
        for mut backend in declared.into_iter().filter(BackendConfig::is_enabled) {
            if backend.name.trim().is_empty() {
                return Err(ConfigError::InvalidBackend {
                    name: backend.name,
                    reason: "name must not be empty".to_string(),
                });
            }
            if !seen.insert(backend.name.clone()) {
                return Err(ConfigError::InvalidBackend {
                    name: backend.name,
                    reason: "duplicate backend name".to_string(),
                });
            }
            TransportKind::from_config(&backend).map_err(|reason| {
                ConfigError::InvalidBackend {
                    name: backend.name.clone(),
                    reason,
                }
            })?;
            if let (Some(script), Some(directory)) = (&backend.script, &self.servers.directory) {
                if !discovered && script.is_relative() {
                    backend.script = Some(directory.join(script));
                }
            }
            backends.push(backend);
        }

        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if let Some(default) = &self.servers.default {
            if !backends.iter().any(|backend| &backend.name == default) {
                return Err(ConfigError::InvalidBackend {
                    name: default.clone(),
                    reason: "servers.default names no enabled backend".to_string(),
                });
            }
        }
        Ok(backends)
    }
}

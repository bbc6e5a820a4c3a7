//! Configuration loading and saving utilities with fallback support.

use crate::config::{Config, ConfigError, ConfigValidator};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration loader/saver with hierarchical fallback support
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths for configuration files, in priority order
    search_paths: Vec<PathBuf>,
}

/// Result of configuration loading attempt
#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub loaded_from: PathBuf,
    pub fallback_used: bool,
    pub errors: Vec<(PathBuf, ConfigError)>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { search_paths: Vec::new() }
    }

    /// Create a loader with the standard search paths.
    pub fn new_with_search_paths() -> Self {
        let mut search_paths = Vec::new();

        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("opsentry").join("config.toml"));
            search_paths.push(config_dir.join("opsentry").join("config.yaml"));
        }
        search_paths.push(PathBuf::from("opsentry.toml"));
        search_paths.push(PathBuf::from("opsentry.yaml"));
        search_paths.push(PathBuf::from("/etc/opsentry/config.toml"));

        Self { search_paths }
    }

    /// Add a search path with highest priority
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    /// Load configuration, falling back to defaults when no file parses.
    pub fn load_with_fallback(&self) -> Result<ConfigLoadResult, ConfigError> {
        let mut errors = Vec::new();

        for path in &self.search_paths {
            if !path.exists() {
                debug!("Config file does not exist: {}", path.display());
                continue;
            }

            match self.load_from_file(path) {
                Ok(config) => {
                    info!("Loaded config from: {}", path.display());
                    return Ok(ConfigLoadResult {
                        config,
                        loaded_from: path.clone(),
                        fallback_used: !errors.is_empty(),
                        errors,
                    });
                }
                Err(err) => {
                    warn!("Failed to load config from {}: {}", path.display(), err);
                    errors.push((path.clone(), err));
                }
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(ConfigLoadResult {
            config: Config::default(),
            loaded_from: PathBuf::from("<default>"),
            fallback_used: true,
            errors,
        })
    }

    /// Load and validate a single file. TOML is the primary format; YAML
    /// is accepted for deployments that template configs that way.
    pub fn load_from_file(&self, path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidValue {
                    field: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            _ => toml::from_str(&content)?,
        };
        ConfigValidator::new().validate(&config)?;
        Ok(config)
    }

    /// Save a config, creating parent directories as needed.
    pub fn save_to_file(&self, config: &Config, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new_with_search_paths()
    }
}

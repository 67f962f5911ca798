use crate::models::{MissionConfig, Settings};
use crate::services::registry::{FingerprintRegistry, StateDefinitions};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use thiserror::Error;

/// Malformed or missing declarative input. Fatal at load time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Required config file not found: {0}")]
    Missing(Utf8PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid YAML in {context}: {source}")]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Invalid entry '{key}': {reason}")]
    InvalidEntry { key: String, reason: String },

    #[error("Entry '{key}' references unknown shared region '{region}'")]
    UnknownRegionRef { key: String, region: String },

    #[error("Definition '{definition}' uses unknown or unmatchable key '{key}'")]
    UnknownMatchKey { definition: String, key: String },

    #[error("Definition '{0}' is declared more than once")]
    DuplicateDefinition(String),

    #[error("'{0}' is reserved and cannot name a definition")]
    ReservedName(String),

    #[error("Template for '{key}' at {path} could not be loaded: {reason}")]
    Template {
        key: String,
        path: Utf8PathBuf,
        reason: String,
    },
}

/// Loads the files in the configuration directory.
///
/// - `settings.yaml`: operator settings (optional, defaults when missing)
/// - `clickmap.json`: fingerprint registry (required)
/// - `state_definitions.yaml`: state and overlay definitions (required)
/// - `mission.yaml`: mission flow for campaigns (required by `campaign`)
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
    clickmap_path: Utf8PathBuf,
    definitions_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager, creating `config_dir` if needed.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join("settings.yaml"),
            clickmap_path: config_dir.join("clickmap.json"),
            definitions_path: config_dir.join("state_definitions.yaml"),
            config_dir,
        })
    }

    /// Load operator settings, or defaults if the file doesn't exist.
    pub fn load_settings(&self) -> Result<Settings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
            return Ok(Settings::default());
        }

        let file_contents = fs::read_to_string(&self.settings_path)
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        let settings: Settings = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Load the fingerprint registry. A missing file is an error.
    pub fn load_registry(&self) -> Result<FingerprintRegistry, ConfigError> {
        let contents = read_required(&self.clickmap_path)?;
        let registry = FingerprintRegistry::from_json_str(&contents, self.clickmap_path.as_str())?;
        tracing::info!(
            "Loaded {} fingerprints from {}",
            registry.len(),
            self.clickmap_path
        );
        Ok(registry)
    }

    /// Load state/overlay definitions, validated against `registry`.
    pub fn load_state_definitions(
        &self,
        registry: &FingerprintRegistry,
    ) -> Result<StateDefinitions, ConfigError> {
        let contents = read_required(&self.definitions_path)?;
        let definitions = StateDefinitions::from_yaml_str(
            &contents,
            self.definitions_path.as_str(),
            registry,
        )?;
        tracing::info!(
            "Loaded {} states and {} overlays from {}",
            definitions.states().len(),
            definitions.overlays().len(),
            self.definitions_path
        );
        Ok(definitions)
    }

    /// Load a mission file; relative names are resolved inside the config directory.
    pub fn load_mission_config(&self, file_name: &str) -> Result<MissionConfig, ConfigError> {
        let path = self.config_dir.join(file_name);
        let contents = read_required(&path)?;
        let config: MissionConfig =
            serde_yaml_ng::from_str(&contents).map_err(|source| ConfigError::Yaml {
                context: path.to_string(),
                source,
            })?;
        if config.poll_interval.is_zero() || config.poll_running.is_zero() {
            return Err(ConfigError::InvalidEntry {
                key: config.name,
                reason: "poll intervals must be greater than zero".to_string(),
            });
        }
        tracing::info!("Loaded mission '{}' from {}", config.name, path);
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn clickmap_path(&self) -> &Utf8Path {
        &self.clickmap_path
    }

    pub fn definitions_path(&self) -> &Utf8Path {
        &self.definitions_path
    }
}

fn read_required(path: &Utf8Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

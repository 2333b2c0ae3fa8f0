//! Storage layer for persistent settings (a single JSON file)

use crate::error::StorageError;
use brd_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Environment variable overriding the settings file location
pub const CONFIG_ENV: &str = "BRD_CONFIG";

const SETTINGS_FILE: &str = "settings.json";

/// Settings file manager
#[derive(Clone, Debug)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    /// Storage backed by an explicit settings file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve the settings file: explicit path, then `BRD_CONFIG`, then
    /// `<config dir>/brd/settings.json`.
    pub fn locate(explicit: Option<PathBuf>) -> Result<Self, StorageError> {
        if let Some(path) = explicit {
            return Ok(Self::new(path));
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
            return Ok(Self::new(PathBuf::from(path)));
        }
        let dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(Self::new(dir.join("brd").join(SETTINGS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings. A missing file yields the defaults.
    pub async fn load_settings(&self) -> Result<Settings, StorageError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {:?}, using defaults", self.path);
                return Ok(Settings::default());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            warn!("Settings file {:?} is empty, using defaults", self.path);
            return Ok(Settings::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Save settings as pretty JSON, creating parent directories as needed
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, content).await?;
        debug!("Saved settings to {:?}", self.path);
        Ok(())
    }

    /// Delete the settings file. Missing files are not an error.
    pub async fn reset(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Apply a `key=value` update to settings, by serialized field name.
///
/// The value is parsed as JSON first and falls back to a plain string, so
/// `max_retries=5` and `user_agent=curl/8` both work.
pub fn apply_setting(settings: &Settings, key: &str, value: &str) -> Result<Settings, StorageError> {
    let mut document = serde_json::to_value(settings)?;
    let Some(fields) = document.as_object_mut() else {
        return Err(StorageError::UnknownKey(key.to_string()));
    };
    if !fields.contains_key(key) {
        return Err(StorageError::UnknownKey(key.to_string()));
    }

    let parsed = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    fields.insert(key.to_string(), parsed);
    Ok(serde_json::from_value(document)?)
}

//! Settings storage
//!
//! Engine and generation defaults, persisted as `settings.json` in the data
//! directory. Missing fields fall back to their defaults.

use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Path to the engine shared library; platform default name when unset
    pub library_path: Option<PathBuf>,
    /// Context window size, also the prompt capacity
    pub context_size: u32,
    /// Threads for single-token decoding (None = all available cores)
    pub threads: Option<u32>,
    /// Threads for prompt decoding (None = same as `threads`)
    pub batch_threads: Option<u32>,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Map the model file instead of reading it
    pub use_mmap: bool,
    /// Cap on prompt + generated tokens (None = context size)
    pub max_length: Option<u32>,
    /// Let the tokenizer add BOS and similar markers
    pub add_special: bool,
    /// Parse special-token text in the prompt
    pub parse_special: bool,
    /// Render special tokens as text in the output
    pub render_special: bool,
    /// Check the GGUF header before handing the file to the engine
    pub verify_gguf_header: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            library_path: None,
            context_size: 2048,
            threads: None,
            batch_threads: None,
            gpu_layers: 0,
            use_mmap: true,
            max_length: None,
            add_special: true,
            parse_special: true,
            render_special: false,
            verify_gguf_header: true,
        }
    }
}

impl BridgeSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        if self.context_size == 0 {
            self.context_size = 2048;
        }

        if self.threads == Some(0) {
            self.threads = None;
        }
        if self.batch_threads == Some(0) {
            self.batch_threads = None;
        }

        // No room to generate beyond the context
        if let Some(max) = self.max_length {
            self.max_length = Some(max.min(self.context_size));
        }

        // handed to the engine as i32
        self.gpu_layers = self.gpu_layers.min(i32::MAX as u32);
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> BridgeSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            BridgeSettings::default()
        }
    }
}

/// Loads and validates settings from `path`; defaults if it does not exist.
pub fn load_settings_from(path: &Path) -> Result<BridgeSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(BridgeSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: BridgeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &BridgeSettings) -> Result<(), StorageError> {
    save_settings_to(&get_settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &BridgeSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.gpu_layers, 0);
        assert!(settings.use_mmap);
        assert!(settings.add_special);
        assert!(settings.parse_special);
        assert!(!settings.render_special);
        assert!(settings.library_path.is_none());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = BridgeSettings {
            context_size: 0,
            threads: Some(0),
            batch_threads: Some(0),
            max_length: Some(10_000),
            ..BridgeSettings::default()
        };

        settings.validate();

        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.threads, None);
        assert_eq!(settings.batch_threads, None);
        assert_eq!(settings.max_length, Some(2048));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: BridgeSettings = serde_json::from_str(r#"{"context_size": 512}"#).unwrap();
        assert_eq!(settings.context_size, 512);
        assert!(settings.use_mmap);
        assert_eq!(settings.threads, None);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = BridgeSettings {
            library_path: Some(PathBuf::from("/opt/llama/libllama.so")),
            threads: Some(8),
            gpu_layers: 33,
            ..BridgeSettings::default()
        };

        save_settings_to(&path, &settings).unwrap();
        let loaded = load_settings_from(&path).unwrap();

        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, BridgeSettings::default());
    }

    #[test]
    fn test_corrupted_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::JsonError(_))
        ));
    }
}

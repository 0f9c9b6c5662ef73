//! Persisted server settings (`~/.kindling/server.json`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LocalAIError;
use crate::model_config::ServerConfig;
use crate::{DEFAULT_HOST, DEFAULT_PORT};

/// User-adjustable settings, applied over the resolver's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub host: String,
    /// Overrides the size-derived context length.
    pub context_size: Option<u32>,
    /// Overrides the size-derived GPU layer count.
    pub gpu_layers: Option<u32>,
    /// Overrides the core-derived thread count.
    pub thread_count: Option<u32>,
    pub flash_attention: bool,
    pub warmup_enabled: bool,
    /// Model of the last successful load.
    pub last_model_path: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            context_size: None,
            gpu_layers: None,
            thread_count: None,
            flash_attention: true,
            warmup_enabled: true,
            last_model_path: None,
        }
    }
}

impl ServerSettings {
    /// Read settings from `path`.
    ///
    /// A missing file gives the defaults. A file that cannot be read or parsed
    /// also gives the defaults, with a warning.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    debug!("Loaded server settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("Ignoring malformed settings {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Cannot read settings {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write settings to `path`, replacing the old file in one rename.
    pub fn save(&self, path: &Path) -> Result<(), LocalAIError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        debug!("Saved server settings to {}", path.display());
        Ok(())
    }

    /// Apply these settings to a freshly resolved config.
    pub fn apply(&self, config: &mut ServerConfig) {
        config.port = self.port;
        config.host = self.host.clone();
        config.flash_attention = self.flash_attention;
        config.warmup_enabled = self.warmup_enabled;
        if let Some(context_size) = self.context_size {
            config.context_size = context_size;
        }
        if let Some(gpu_layers) = self.gpu_layers {
            config.gpu_layers = gpu_layers;
        }
        if let Some(threads) = self.thread_count {
            config.thread_count = threads.max(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_config::resolve;
    use crate::system_info::HostFacts;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings::load(&dir.path().join("server.json"));
        assert_eq!(settings, ServerSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.json");
        let settings = ServerSettings {
            port: 9090,
            context_size: Some(2048),
            last_model_path: Some(PathBuf::from("/models/a-7b.gguf")),
            ..ServerSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(ServerSettings::load(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(ServerSettings::load(&path), ServerSettings::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        fs::write(&path, r#"{"port": 8088}"#).unwrap();
        let settings = ServerSettings::load(&path);
        assert_eq!(settings.port, 8088);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert!(settings.flash_attention);
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = resolve(
            Path::new("/models/qwen-7b.gguf"),
            &HostFacts::synthetic(10, 1 << 34),
        );
        let settings = ServerSettings {
            port: 9000,
            gpu_layers: Some(0),
            thread_count: Some(0),
            warmup_enabled: false,
            ..ServerSettings::default()
        };
        settings.apply(&mut config);

        assert_eq!(config.port, 9000);
        assert_eq!(config.gpu_layers, 0);
        assert_eq!(config.thread_count, 1);
        assert_eq!(config.context_size, 8192);
        assert!(!config.warmup_enabled);
    }
}

//! Application configuration: persisted as JSON.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Model store root; `$OLLAMA_MODELS` or `~/.ollama/models` when unset.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// Imports/exports allowed to run at once through the HTTP API.
    #[serde(default = "default_max_transfers")]
    pub max_concurrent_transfers: usize,
    /// Drop unreferenced blobs when the store is opened.
    #[serde(default = "default_true")]
    pub prune_on_start: bool,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_max_transfers() -> usize {
    2
}
fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            models_dir: None,
            max_concurrent_transfers: default_max_transfers(),
            prune_on_start: true,
        }
    }
}

impl AppConfig {
    /// Platform config directory: `~/.config/ollama-model-manager/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ollama-model-manager")
    }

    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_file())
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_file())
    }

    pub fn save_to(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Apply `omm config set <key> <value>`.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = value.parse()?,
            "models_dir" => {
                self.models_dir = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "max_concurrent_transfers" => {
                let n: usize = value.parse()?;
                anyhow::ensure!(n > 0, "max_concurrent_transfers must be at least 1");
                self.max_concurrent_transfers = n;
            }
            "prune_on_start" => self.prune_on_start = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {key}"),
        }
        Ok(())
    }

    /// Store root: explicit override, then config, then the runtime default.
    pub fn resolve_models_dir(&self, cli_override: Option<PathBuf>) -> PathBuf {
        cli_override
            .or_else(|| self.models_dir.clone())
            .unwrap_or_else(model_store::StoreLayout::default_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: AppConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.max_concurrent_transfers, 2);
        assert!(cfg.prune_on_start);
        assert!(cfg.models_dir.is_none());
    }

    #[test]
    fn set_validates_values() {
        let mut cfg = AppConfig::default();
        cfg.set("port", "1234").unwrap();
        cfg.set("models_dir", "/srv/models").unwrap();
        cfg.set("prune_on_start", "false").unwrap();
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.models_dir, Some(PathBuf::from("/srv/models")));
        assert!(!cfg.prune_on_start);

        assert!(cfg.set("port", "not-a-port").is_err());
        assert!(cfg.set("max_concurrent_transfers", "0").is_err());
        assert!(cfg.set("api_key", "x").is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut cfg = AppConfig::default();
        cfg.set("host", "0.0.0.0").unwrap();
        cfg.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn cli_override_wins() {
        let cfg = AppConfig {
            models_dir: Some(PathBuf::from("/from/config")),
            ..AppConfig::default()
        };
        assert_eq!(
            cfg.resolve_models_dir(Some(PathBuf::from("/from/cli"))),
            PathBuf::from("/from/cli")
        );
        assert_eq!(cfg.resolve_models_dir(None), PathBuf::from("/from/config"));
    }
}

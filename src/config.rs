use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    logger::{LogConfig, LogLevel},
    storage::{FileStorage, Storage},
};

pub const CONFIG_FILE: &str = "nodeboard.json";
pub const STORAGE_FILE: &str = "board.json";

/// Resolve the board root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("NODEBOARD_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./nodeboard")
    }
}

fn default_root() -> PathBuf {
    resolve_root_dir()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Any registered storage backend, e.g. `{"FileStorage": {"path": ".."}}`.
    #[serde(default)]
    pub storage: Option<Storage>,
}

impl BoardConfig {
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            log_level: LogLevel::default(),
            log_dir: None,
            storage: None,
        }
    }

    /// Loads `<root>/.env`, then reads `nodeboard.json` from the root and
    /// applies `NODEBOARD_*` overrides from the environment. A
    /// `NODEBOARD_ROOT` defined by that `.env` moves the root.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let before = env::var("NODEBOARD_ROOT").ok();
        let env_file = root.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("could not load {}", env_file.display()))?;
        }
        let root = match env::var("NODEBOARD_ROOT").ok() {
            Some(moved) if Some(&moved) != before.as_ref() => PathBuf::from(moved),
            _ => root.to_path_buf(),
        };
        let root = root.as_path();

        let config_file = root.join(CONFIG_FILE);
        let mut config = if config_file.exists() {
            Self::from_file(&config_file)?
        } else {
            Self::with_root(root.to_path_buf())
        };
        config.root = root.to_path_buf();
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(level) = env::var("NODEBOARD_LOG_LEVEL") {
            match level.parse() {
                Ok(level) => self.log_level = level,
                Err(err) => warn!(%err, "ignoring NODEBOARD_LOG_LEVEL"),
            }
        }
        if let Ok(dir) = env::var("NODEBOARD_LOG_DIR") {
            self.log_dir = Some(self.under_root(&dir));
        }
        if let Ok(file) = env::var("NODEBOARD_STORAGE_FILE") {
            self.storage = Some(Storage(FileStorage::new(self.under_root(&file))));
        }
    }

    fn under_root(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }

    /// The configured storage, or a `board.json` file under the root.
    pub fn storage(&self) -> Storage {
        self.storage
            .clone()
            .unwrap_or_else(|| Storage(FileStorage::new(self.root.join(STORAGE_FILE))))
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.log_level, self.log_dir.clone())
    }
}

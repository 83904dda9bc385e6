use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::log::Logger;
use crate::util::check_remote_dir;
use crate::{jlog_debug, Error, Result};

const DEFAULT_REMOTE_DIR: &str = ".judo";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub ssh: Option<String>,
    pub scp: Option<String>,
    #[serde(default)]
    pub ssh_options: Vec<String>,
    pub control_dir: Option<String>,
    pub remote_dir: Option<String>,
    pub inventory: Option<String>,
    pub log_file: Option<String>,
}

impl Config {
    pub fn judo_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".judo"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::judo_dir()?.join("judo.toml"))
    }

    pub fn effective_ssh(&self) -> &str {
        self.ssh.as_deref().unwrap_or("ssh")
    }

    pub fn effective_scp(&self) -> &str {
        self.scp.as_deref().unwrap_or("scp")
    }

    /// Workspace directory on the remote side, relative to the remote `$HOME`.
    pub fn effective_remote_dir(&self) -> Result<&str> {
        let dir = self
            .remote_dir
            .as_deref()
            .map(|d| d.trim_matches('/'))
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_REMOTE_DIR);
        check_remote_dir(dir)
    }

    /// Local directory holding the ssh control sockets.
    pub fn control_dir(&self) -> Result<PathBuf> {
        match &self.control_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::judo_dir()?.join("control")),
        }
    }

    /// Inventory path: configured one, otherwise `./inventory` if present.
    pub fn inventory_path(&self) -> Option<PathBuf> {
        match &self.inventory {
            Some(path) => Some(expand_tilde(path)),
            None => {
                let local = PathBuf::from("inventory");
                local.is_file().then_some(local)
            }
        }
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(expand_tilde)
    }

    pub fn load(log: &Logger) -> Result<Self> {
        Self::load_from(&Self::config_path()?, log)
    }

    pub fn load_from(path: &Path, log: &Logger) -> Result<Self> {
        jlog_debug!(log, "Config::load path={}", path.display());
        if !path.exists() {
            jlog_debug!(log, "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        jlog_debug!(
            log,
            "Config loaded: ssh={:?}, scp={:?}, remote_dir={:?}, inventory={:?}",
            config.ssh,
            config.scp,
            config.remote_dir,
            config.inventory
        );
        Ok(config)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

//! Persistent settings for kernel sessions.
//!
//! Stored as JSON at `<config dir>/kernel-session/settings.json`. A missing
//! file means defaults; a few fields can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelSessionError, Result};
use crate::provisioner::ProvisionConfig;
use crate::reconnect::{FileReconnectionStore, ReconnectionStore};

pub const DEFAULT_KERNEL_NAME: &str = "python3";
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30;

pub const ENV_SERVER_URL: &str = "KERNEL_SESSION_SERVER_URL";
pub const ENV_SERVER_TOKEN: &str = "KERNEL_SESSION_TOKEN";
pub const ENV_KERNEL: &str = "KERNEL_SESSION_KERNEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Base URL of a Jupyter server, e.g. `http://localhost:8888`.
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub server_token: Option<String>,

    #[serde(default = "default_kernel_name")]
    pub default_kernel_name: String,

    #[serde(default)]
    pub start_default_kernel: bool,

    /// Seconds before a pending execution is abandoned. 0 disables the guard.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// Code run once on every new kernel before it is reported ready.
    #[serde(default)]
    pub init_code: Option<String>,

    /// Where session paths are remembered. Defaults next to the settings file.
    #[serde(default)]
    pub reconnection_file: Option<PathBuf>,
}

fn default_kernel_name() -> String {
    DEFAULT_KERNEL_NAME.to_string()
}

fn default_execution_timeout_secs() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            server_token: None,
            default_kernel_name: default_kernel_name(),
            start_default_kernel: false,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            init_code: None,
            reconnection_file: None,
        }
    }
}

fn config_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-session")
}

pub fn settings_path() -> PathBuf {
    config_root().join("settings.json")
}

impl SessionSettings {
    /// Read settings from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KernelSessionError::Settings(format!("reading {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| KernelSessionError::Settings(format!("parsing {}: {}", path.display(), e)))
    }

    /// Settings from the default location with environment overrides.
    ///
    /// An unreadable file is logged and replaced by defaults.
    pub fn load() -> Self {
        Self::load_layered(&settings_path(), |name| std::env::var(name).ok())
    }

    /// Settings from `path` with `lookup` overrides applied on top.
    pub fn load_layered(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::load_from(path).unwrap_or_else(|e| {
            log::warn!("[config] Using default settings: {}", e);
            Self::default()
        });
        settings.apply_overrides(lookup);
        settings
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&settings_path())
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup` (environment variable name -> value).
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(ENV_SERVER_URL) {
            self.server_url = Some(url);
        }
        if let Some(token) = lookup(ENV_SERVER_TOKEN) {
            self.server_token = Some(token);
        }
        if let Some(kernel) = lookup(ENV_KERNEL) {
            self.default_kernel_name = kernel;
        }
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        match self.execution_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn reconnection_path(&self) -> PathBuf {
        self.reconnection_file
            .clone()
            .unwrap_or_else(|| config_root().join("reconnection.json"))
    }

    pub fn reconnection_store(&self) -> Arc<dyn ReconnectionStore> {
        Arc::new(FileReconnectionStore::new(self.reconnection_path()))
    }

    /// Provisioning options derived from these settings. The kernel source
    /// (lite loader or injected services) is chosen by the caller.
    pub fn to_provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            server_url: self.server_url.clone(),
            server_token: self.server_token.clone(),
            start_default_kernel: self.start_default_kernel,
            default_kernel_name: self.default_kernel_name.clone(),
            init_code: self.init_code.clone(),
            execution_timeout: self.execution_timeout(),
            ..ProvisionConfig::default()
        }
    }
}

// Notebook Relay - CLI Config Module
// Tool configuration file: discovery service, relay client, SSH and editor settings

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use notebook_relay_common::launcher::{
    default_editor_args, DEFAULT_EDITOR_PROGRAM, DEFAULT_WORKSPACE,
};
use notebook_relay_common::ssh_config::default_ssh_config_path;
use notebook_relay_common::state::default_state_path;
use notebook_relay_common::supervisor::{
    default_prepare_args, default_relay_args, DEFAULT_READY_MARKER, DEFAULT_RELAY_PROGRAM,
};
use notebook_relay_common::{
    HttpDiscovery, RelayCommand, RetryPolicy, SessionLauncher, SshConfigReconciler, StateStore,
};

pub const DEFAULT_DISCOVERY_URL: &str = "https://api-v1.zrok.io/api/v1";
pub const DEFAULT_ENVIRONMENT_FILE: &str = "~/.zrok/environment.json";

/// Settings for the discovery service lookup
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_token: Option<String>,
    pub attempts: u32,
    /// Delay before retry n is `backoff_secs * n`
    pub backoff_secs: u64,
    pub request_timeout_secs: u64,
    /// SSH port the remote session shares
    pub remote_ssh_port: u16,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DISCOVERY_URL.to_string(),
            account_token: None,
            attempts: 5,
            backoff_secs: 2,
            request_timeout_secs: 30,
            remote_ssh_port: 22,
        }
    }
}

/// Relay access client invocation
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    pub program: String,
    pub args: Vec<String>,
    pub ready_marker: String,
    pub startup_timeout_secs: u64,
    pub stop_grace_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Enables the local environment before the first tunnel; empty skips it
    pub prepare_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_file: Option<PathBuf>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_RELAY_PROGRAM.to_string(),
            args: default_relay_args(),
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            startup_timeout_secs: 30,
            stop_grace_secs: 3,
            log_dir: None,
            prepare_args: default_prepare_args(),
            environment_file: Some(PathBuf::from(DEFAULT_ENVIRONMENT_FILE)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SshSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub strict_host_key_checking: bool,
    pub server_alive_interval: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            strict_host_key_checking: false,
            server_alive_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EditorSettings {
    pub program: String,
    pub args: Vec<String>,
    pub workspace: String,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_EDITOR_PROGRAM.to_string(),
            args: default_editor_args(),
            workspace: DEFAULT_WORKSPACE.to_string(),
        }
    }
}

/// CLI configuration file (`config.toml`)
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
    pub discovery: DiscoverySettings,
    pub relay: RelaySettings,
    pub ssh: SshSettings,
    pub editor: EditorSettings,
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location
    ///
    /// A missing default file yields the defaults; an explicitly given path
    /// must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::config_path()?;
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let contents = fs::read_to_string(&config_path).with_context(|| {
            format!("Failed to read configuration {}", config_path.display())
        })?;

        let config: Self = toml::from_str(&contents).with_context(|| {
            format!("Failed to parse configuration {}", config_path.display())
        })?;

        Ok(config)
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("notebook-relay").join("config.toml"))
    }

    pub fn state_store(&self) -> Result<StateStore> {
        let path = match &self.state_path {
            Some(p) => expand_path(p),
            None => default_state_path()?,
        };
        Ok(StateStore::new(path))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.discovery.attempts,
            backoff: Duration::from_secs(self.discovery.backoff_secs),
        }
    }

    pub fn discovery_client(&self, account_token: &str) -> Result<HttpDiscovery> {
        Ok(HttpDiscovery::new(
            &self.discovery.base_url,
            account_token,
            Duration::from_secs(self.discovery.request_timeout_secs),
            self.discovery.remote_ssh_port,
        )?)
    }

    /// Relay command; logs default to `logs/` next to the state file
    pub fn relay_command(&self, store: &StateStore) -> RelayCommand {
        let log_dir = match &self.relay.log_dir {
            Some(dir) => expand_path(dir),
            None => store.dir().join("logs"),
        };

        RelayCommand {
            program: expand_path(Path::new(&self.relay.program))
                .display()
                .to_string(),
            args: self.relay.args.clone(),
            ready_marker: self.relay.ready_marker.clone(),
            startup_timeout: Duration::from_secs(self.relay.startup_timeout_secs),
            stop_grace: Duration::from_secs(self.relay.stop_grace_secs),
            log_dir,
            prepare_args: self.relay.prepare_args.clone(),
            environment_file: self.relay.environment_file.as_deref().map(expand_path),
        }
    }

    pub fn ssh_reconciler(&self) -> Result<SshConfigReconciler> {
        let path = match &self.ssh.config_path {
            Some(p) => expand_path(p),
            None => default_ssh_config_path()?,
        };
        Ok(SshConfigReconciler::new(path))
    }

    pub fn launcher(&self) -> SessionLauncher {
        SessionLauncher {
            program: self.editor.program.clone(),
            args: self.editor.args.clone(),
            workspace: self.editor.workspace.clone(),
        }
    }
}

/// Expand a leading `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

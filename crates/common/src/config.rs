// Connection profile and SSH host block structures for Notebook Relay

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AuthMethod, ConnectionMode, EndpointDescriptor};

/// Default local port the relay access client binds in private mode
pub const DEFAULT_LOCAL_PORT: u16 = 9191;

/// Default remote login user
pub const DEFAULT_USER: &str = "root";

/// User-facing unit of configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionProfile {
    /// Profile name, also used as the SSH host alias
    pub name: String,
    /// Local bridge port (private mode only)
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Remote login user
    #[serde(default = "default_user")]
    pub user: String,
    pub auth_method: AuthMethod,
    /// Password literal (password auth) or private key path (key auth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// Environment name queried on the discovery service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub endpoint: EndpointDescriptor,
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

impl ConnectionProfile {
    /// Create a profile with default user, port and password auth
    pub fn new(name: impl Into<String>, endpoint: EndpointDescriptor) -> Self {
        Self {
            name: name.into(),
            local_port: DEFAULT_LOCAL_PORT,
            user: DEFAULT_USER.to_string(),
            auth_method: AuthMethod::Password,
            credential: None,
            server_name: None,
            last_used_at: None,
            endpoint,
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.endpoint.mode()
    }

    /// Name to look up on the discovery service
    pub fn discovery_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.name)
    }

    /// Validate the profile configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || !self.name.chars().all(is_alias_char) {
            return Err(Error::InvalidArguments(format!(
                "profile name '{}' may only contain letters, digits, '-', '_' and '.'",
                self.name
            )));
        }
        if self.user.is_empty() || self.user.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArguments(format!(
                "invalid user '{}'",
                self.user
            )));
        }
        if self.local_port == 0 {
            return Err(Error::InvalidArguments(
                "local port must be greater than 0".to_string(),
            ));
        }

        match &self.endpoint {
            EndpointDescriptor::Public { host, port } => {
                if host.is_empty() {
                    return Err(Error::InvalidArguments("host cannot be empty".to_string()));
                }
                if *port == 0 {
                    return Err(Error::InvalidArguments(
                        "remote port must be greater than 0".to_string(),
                    ));
                }
            }
            EndpointDescriptor::Private { share_token } => {
                if share_token.is_empty() {
                    return Err(Error::InvalidArguments(
                        "share token cannot be empty".to_string(),
                    ));
                }
            }
        }

        if self.auth_method == AuthMethod::Key && self.credential.is_none() {
            return Err(Error::InvalidArguments(
                "key path required for key authentication".to_string(),
            ));
        }

        Ok(())
    }

    /// SSH host block pointing at the current endpoint
    ///
    /// Public endpoints are addressed directly; private endpoints go through
    /// the local bridge on `localhost:<local_port>`.
    pub fn ssh_host_block(&self, strict_host_key_checking: bool) -> SshHostBlock {
        let (host_name, port) = match &self.endpoint {
            EndpointDescriptor::Public { host, port } => (host.clone(), *port),
            EndpointDescriptor::Private { .. } => ("localhost".to_string(), self.local_port),
        };

        let identity_file = match self.auth_method {
            AuthMethod::Key => self.credential.as_ref().map(PathBuf::from),
            AuthMethod::Password => None,
        };

        SshHostBlock {
            alias: self.name.clone(),
            host_name,
            port,
            user: self.user.clone(),
            identity_file,
            strict_host_key_checking,
            server_alive_interval: DEFAULT_SERVER_ALIVE_INTERVAL,
        }
    }
}

fn is_alias_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

pub const DEFAULT_SERVER_ALIVE_INTERVAL: u32 = 60;

/// A named stanza in the SSH client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHostBlock {
    pub alias: String,
    pub host_name: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub strict_host_key_checking: bool,
    /// 0 disables keepalives
    pub server_alive_interval: u32,
}

impl SshHostBlock {
    /// Render the block as ssh_config lines (header first)
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Host {}", self.alias),
            format!("    HostName {}", self.host_name),
            format!("    User {}", self.user),
            format!("    Port {}", self.port),
        ];

        if let Some(identity) = &self.identity_file {
            let path = identity.display().to_string();
            lines.push(format!("    IdentityFile {}", quote_if_needed(&path)));
        }

        if self.strict_host_key_checking {
            lines.push("    StrictHostKeyChecking yes".to_string());
        } else {
            lines.push("    StrictHostKeyChecking no".to_string());
            lines.push("    UserKnownHostsFile /dev/null".to_string());
        }

        if self.server_alive_interval > 0 {
            lines.push(format!("    ServerAliveInterval {}", self.server_alive_interval));
        }

        lines
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

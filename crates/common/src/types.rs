// Common types for Notebook Relay

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the remote session is reached
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Directly reachable hostname, no local relay process
    Public,
    /// Share token bridged to a local port by the relay access client
    Private,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Public => write!(f, "public"),
            ConnectionMode::Private => write!(f, "private"),
        }
    }
}

/// Authentication type for the SSH login
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Password authentication
    Password,
    /// SSH key authentication
    Key,
}

/// Concrete address of a remote session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EndpointDescriptor {
    Public { host: String, port: u16 },
    Private { share_token: String },
}

impl EndpointDescriptor {
    pub fn mode(&self) -> ConnectionMode {
        match self {
            EndpointDescriptor::Public { .. } => ConnectionMode::Public,
            EndpointDescriptor::Private { .. } => ConnectionMode::Private,
        }
    }

    /// Parse `host` or `host:port` for a public endpoint (port defaults to 22)
    pub fn public_from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArguments(format!(
                "'{}' is not a valid hostname",
                value
            )));
        }

        // Bracketed IPv6 with port, e.g. [::1]:2222
        if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                Error::InvalidArguments(format!("unterminated '[' in '{}'", value))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => 22,
                None => {
                    return Err(Error::InvalidArguments(format!(
                        "unexpected '{}' after host",
                        tail
                    )))
                }
            };
            return Ok(EndpointDescriptor::Public {
                host: host.to_string(),
                port,
            });
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Ok(EndpointDescriptor::Public {
                host: host.to_string(),
                port: parse_port(port)?,
            }),
            _ => Ok(EndpointDescriptor::Public {
                host: value.to_string(),
                port: 22,
            }),
        }
    }

    /// Validate a share token for a private endpoint
    pub fn private_from_token(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidArguments(format!(
                "'{}' is not a valid share token",
                token
            )));
        }
        Ok(EndpointDescriptor::Private {
            share_token: token.to_string(),
        })
    }

    /// Short form for display; share tokens are truncated
    pub fn summary(&self) -> String {
        match self {
            EndpointDescriptor::Public { host, port } => {
                if *port == 22 {
                    host.clone()
                } else {
                    format!("{}:{}", host, port)
                }
            }
            // Hand-edited state may hold non-ASCII tokens; cut on chars
            EndpointDescriptor::Private { share_token } => {
                if share_token.chars().count() > 16 {
                    format!("{}...", share_token.chars().take(16).collect::<String>())
                } else {
                    share_token.clone()
                }
            }
        }
    }
}

fn parse_port(value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::InvalidArguments(format!(
            "'{}' is not a valid port",
            value
        ))),
        Ok(port) => Ok(port),
    }
}

/// Lifecycle of a relay access client process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Starting, // spawned, waiting for the readiness marker
    Ready,    // local bridge bound
    Crashed,  // exited without an explicit stop
    Stopped,  // explicitly stopped
}

impl TunnelStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, TunnelStatus::Ready)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Starting => "starting",
            TunnelStatus::Ready => "ready",
            TunnelStatus::Crashed => "crashed",
            TunnelStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Persisted handle to a relay access client invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelProcessRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub local_port: u16,
    pub status: TunnelStatus,
    /// Share token the process was started for
    pub share_token: String,
    /// Combined stdout/stderr of the process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Result of a discovery lookup, cached as an offline fallback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub profile_name: String,
    pub endpoint: EndpointDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Row shown by the `list` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub name: String,
    pub mode: ConnectionMode,
    pub endpoint: String,
    pub ssh_target: String,
    pub user: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub tunnel: Option<TunnelProcessRecord>,
    pub is_last_used: bool,
}

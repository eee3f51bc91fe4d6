// Notebook Relay - Discovery Service Module
// Looks up the endpoint a remote session has published under its environment name

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ConnectionMode, DiscoveryRecord, EndpointDescriptor};

/// Outcome of a single discovery query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(DiscoveryRecord),
    /// Not published (yet); worth retrying
    NotFound,
}

/// Query contract of the discovery service
///
/// Implementations return `Error::AuthenticationRejected` for credentials
/// the service refuses and `Error::Discovery` for transport failures.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn lookup(&self, profile_name: &str, mode: ConnectionMode) -> Result<Lookup>;
}

/// Discovery over the relay network's HTTP API (`GET /overview`)
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: Client,
    base_url: String,
    account_token: String,
    remote_ssh_port: u16,
}

impl HttpDiscovery {
    pub fn new(
        base_url: &str,
        account_token: &str,
        request_timeout: Duration,
        remote_ssh_port: u16,
    ) -> Result<Self> {
        validate_account_token(account_token)?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Discovery(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_token: account_token.to_string(),
            remote_ssh_port,
        })
    }
}

#[async_trait]
impl DiscoveryService for HttpDiscovery {
    async fn lookup(&self, profile_name: &str, mode: ConnectionMode) -> Result<Lookup> {
        let url = format!("{}/overview", self.base_url);
        debug!("Querying discovery service at {}", url);

        let response = self
            .client
            .get(&url)
            .header("x-token", &self.account_token)
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("request to {} failed: {}", url, e)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::AuthenticationRejected(format!(
                    "{} returned {}",
                    url,
                    response.status()
                )));
            }
            StatusCode::NOT_FOUND => return Ok(Lookup::NotFound),
            status if !status.is_success() => {
                return Err(Error::Discovery(format!("{} returned {}", url, status)));
            }
            _ => {}
        }

        let overview: Overview = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("invalid response from {}: {}", url, e)))?;

        Ok(match select_endpoint(&overview, profile_name, mode, self.remote_ssh_port) {
            Some(record) => Lookup::Found(record),
            None => Lookup::NotFound,
        })
    }
}

/// Reject empty tokens and unfilled `<placeholder>` values
pub fn validate_account_token(token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() || (token.starts_with('<') && token.ends_with('>')) {
        return Err(Error::InvalidArguments(
            "please provide your actual account token".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct Overview {
    #[serde(default)]
    environments: Vec<EnvironmentEntry>,
}

#[derive(Debug, Deserialize)]
struct EnvironmentEntry {
    #[serde(default)]
    environment: Environment,
    #[serde(default)]
    shares: Vec<Share>,
}

#[derive(Debug, Default, Deserialize)]
struct Environment {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Share {
    #[serde(default)]
    share_token: Option<String>,
    #[serde(default)]
    share_mode: Option<String>,
    #[serde(default)]
    backend_mode: Option<String>,
    #[serde(default)]
    backend_proxy_endpoint: Option<String>,
    #[serde(default)]
    frontend_endpoint: Option<String>,
    /// Milliseconds since the epoch
    #[serde(default)]
    created_at: Option<i64>,
}

impl Share {
    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    fn endpoint(&self, mode: ConnectionMode, remote_ssh_port: u16) -> Option<EndpointDescriptor> {
        match mode {
            ConnectionMode::Private => {
                let is_private = self.share_mode.as_deref().map_or(true, |m| m == "private");
                let is_tunnel = self.backend_mode.as_deref() == Some("tcpTunnel");
                let backend_port = self
                    .backend_proxy_endpoint
                    .as_deref()
                    .and_then(|e| e.rsplit_once(':'))
                    .and_then(|(_, port)| port.parse::<u16>().ok());

                if is_private && is_tunnel && backend_port == Some(remote_ssh_port) {
                    self.share_token
                        .as_deref()
                        .and_then(|t| EndpointDescriptor::private_from_token(t).ok())
                } else {
                    None
                }
            }
            ConnectionMode::Public => {
                if self.share_mode.as_deref() != Some("public") {
                    return None;
                }
                let frontend = self.frontend_endpoint.as_deref()?;
                let without_scheme = frontend
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(frontend);
                let authority = without_scheme.split('/').next().unwrap_or_default();
                EndpointDescriptor::public_from_str(authority).ok()
            }
        }
    }
}

/// Pick the newest share of the named environment matching the mode
pub fn select_endpoint(
    overview: &Overview,
    profile_name: &str,
    mode: ConnectionMode,
    remote_ssh_port: u16,
) -> Option<DiscoveryRecord> {
    overview
        .environments
        .iter()
        .filter(|env| env.environment.description.eq_ignore_ascii_case(profile_name))
        .flat_map(|env| env.shares.iter())
        .filter_map(|share| {
            share
                .endpoint(mode, remote_ssh_port)
                .map(|endpoint| (share.created_at(), endpoint))
        })
        .max_by_key(|(created_at, _)| *created_at)
        .map(|(created_at, endpoint)| DiscoveryRecord {
            profile_name: profile_name.to_string(),
            endpoint,
            created_at,
        })
}

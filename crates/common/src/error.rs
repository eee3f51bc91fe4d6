// Error types for Notebook Relay

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No endpoint published for '{profile}' after {attempts} attempt(s)")]
    EndpointNotFound { profile: String, attempts: u32 },

    #[error("Authentication rejected by discovery service: {0}")]
    AuthenticationRejected(String),

    #[error("Discovery service error: {0}")]
    Discovery(String),

    #[error("Tunnel failed to start: {reason}")]
    TunnelStartFailed {
        reason: String,
        /// Last lines the relay client printed before giving up
        output: Vec<String>,
    },

    #[error(
        "Local port {port} is already in use{}",
        .holder.as_ref().map(|h| format!(" by profile '{}'", h)).unwrap_or_default()
    )]
    PortInUse { port: u16, holder: Option<String> },

    #[error("Failed to write {}: {source}", .path.display())]
    ConfigWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {} is corrupt: {reason}", .path.display())]
    StateCorrupt { path: PathBuf, reason: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this failure class
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::EndpointNotFound { .. }
            | Error::AuthenticationRejected(_)
            | Error::Discovery(_) => 1,
            Error::TunnelStartFailed { .. } | Error::PortInUse { .. } => 2,
            Error::ConfigWriteFailed { .. } | Error::StateCorrupt { .. } | Error::Io(_) => 3,
            Error::InvalidArguments(_) => 4,
            Error::Interrupted => 130,
        }
    }

    /// One-line remediation shown under the error message
    pub fn hint(&self) -> Option<String> {
        match self {
            Error::EndpointNotFound { .. } => Some(
                "Ensure the remote bootstrap step is running and has published its tunnel"
                    .to_string(),
            ),
            Error::AuthenticationRejected(_) => {
                Some("Check your account token (it may have expired)".to_string())
            }
            Error::Discovery(_) => {
                Some("Check your network connection and try again".to_string())
            }
            Error::TunnelStartFailed { .. } => Some(
                "If the relay environment was never enabled on this machine, pass --account-token \
                 so it can be enabled"
                    .to_string(),
            ),
            Error::PortInUse { holder: Some(h), .. } => Some(format!(
                "Stop the other profile with 'nbrelay stop --profile {}' or pick another --port",
                h
            )),
            Error::PortInUse { holder: None, .. } => {
                Some("Pick another local port with --port".to_string())
            }
            Error::ConfigWriteFailed { path, .. } => Some(format!(
                "Check permissions of {} (previous contents were left untouched)",
                path.display()
            )),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_classes() {
        let not_found = Error::EndpointNotFound {
            profile: "kaggle".to_string(),
            attempts: 5,
        };
        assert_eq!(not_found.exit_code(), 1);
        assert_eq!(Error::AuthenticationRejected("401".into()).exit_code(), 1);
        assert_eq!(
            Error::TunnelStartFailed {
                reason: "exited".into(),
                output: vec![]
            }
            .exit_code(),
            2
        );
        assert_eq!(
            Error::PortInUse {
                port: 9191,
                holder: None
            }
            .exit_code(),
            2
        );
        assert_eq!(
            Error::ConfigWriteFailed {
                path: PathBuf::from("/x"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }
            .exit_code(),
            3
        );
        assert_eq!(Error::InvalidArguments("both".into()).exit_code(), 4);
    }

    #[test]
    fn test_port_in_use_message_names_holder() {
        let err = Error::PortInUse {
            port: 9191,
            holder: Some("colab".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Local port 9191 is already in use by profile 'colab'"
        );
        assert!(err.hint().unwrap().contains("--profile colab"));
    }

    #[test]
    fn test_endpoint_not_found_hint_mentions_bootstrap() {
        let err = Error::EndpointNotFound {
            profile: "kaggle".to_string(),
            attempts: 5,
        };
        assert!(err.hint().unwrap().contains("bootstrap"));
    }

    #[test]
    fn test_tunnel_start_hint_mentions_environment_enable() {
        let err = Error::TunnelStartFailed {
            reason: "relay process exited before becoming ready".to_string(),
            output: vec!["unable to load environment; did you 'zrok enable'?".to_string()],
        };
        assert!(err.hint().unwrap().contains("--account-token"));
    }
}

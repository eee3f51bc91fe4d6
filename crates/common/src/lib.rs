// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Notebook Relay Contributors

// Notebook Relay - Common Library
// Connection orchestration: endpoint resolution, relay supervision, SSH config

pub mod config;
pub mod discovery;
pub mod error;
pub mod fsutil;
pub mod launcher;
pub mod network;
pub mod process;
pub mod resolver;
pub mod ssh_config;
pub mod state;
pub mod supervisor;
pub mod types;

pub use config::{ConnectionProfile, SshHostBlock, DEFAULT_LOCAL_PORT, DEFAULT_USER};
pub use discovery::{DiscoveryService, HttpDiscovery, Lookup};
pub use error::{Error, Result};
pub use launcher::{LaunchOutcome, SessionLauncher};
pub use resolver::{EndpointResolver, Resolution, ResolutionSource, ResolveRequest, RetryPolicy};
pub use ssh_config::{SshConfigReconciler, UpsertOutcome};
pub use state::{StateFile, StateStore};
pub use supervisor::{RelayCommand, TunnelSupervisor};
pub use types::{
    AuthMethod, ConnectionMode, DiscoveryRecord, EndpointDescriptor, ProfileSummary,
    TunnelProcessRecord, TunnelStatus,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};

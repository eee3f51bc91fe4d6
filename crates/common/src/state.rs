// Notebook Relay - State Store Module
// Persisted profiles, tunnel process bookkeeping and discovery cache

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConnectionProfile;
use crate::error::{Error, Result};
use crate::fsutil::write_atomic;
use crate::types::{
    ConnectionMode, DiscoveryRecord, EndpointDescriptor, ProfileSummary, TunnelProcessRecord,
};

/// On-disk layout of the state file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateFile {
    /// Account token for the discovery service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_token: Option<String>,
    /// Name of the most recently saved profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ConnectionProfile>,
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelProcessRecord>,
    #[serde(default)]
    pub discovery: BTreeMap<String, DiscoveryRecord>,
}

/// Handle to the state file; every operation is a read-modify-write
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State store at `~/.notebook-relay/state.toml`
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(default_state_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the state file (relay logs live below it)
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Read the state file strictly
    ///
    /// A missing file is an empty state; an unparseable one is `StateCorrupt`.
    pub fn read(&self) -> Result<StateFile> {
        if !self.path.exists() {
            debug!("State file does not exist: {}", self.path.display());
            return Ok(StateFile::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        toml::from_str(&contents).map_err(|e| Error::StateCorrupt {
            path: self.path.clone(),
            reason: e.message().to_string(),
        })
    }

    /// Read the state file, recovering from corruption
    ///
    /// Corrupt contents are copied to `<file>.corrupt` for inspection and an
    /// empty state is returned.
    pub fn snapshot(&self) -> Result<StateFile> {
        match self.read() {
            Ok(state) => Ok(state),
            Err(err @ Error::StateCorrupt { .. }) => {
                warn!("{}; continuing with empty state", err);
                let backup = self.path.with_extension("toml.corrupt");
                if !backup.exists() {
                    if let Err(e) = fs::copy(&self.path, &backup) {
                        warn!("Failed to back up corrupt state to {}: {}", backup.display(), e);
                    }
                }
                Ok(StateFile::default())
            }
            Err(e) => Err(e),
        }
    }

    fn write(&self, state: &StateFile) -> Result<()> {
        let contents = toml::to_string_pretty(state)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        write_atomic(&self.path, contents.as_bytes())?;
        debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    fn update<T>(&self, f: impl FnOnce(&mut StateFile) -> T) -> Result<T> {
        let mut state = self.snapshot()?;
        let out = f(&mut state);
        self.write(&state)?;
        Ok(out)
    }

    /// Load a saved profile by name
    pub fn load(&self, name: &str) -> Result<Option<ConnectionProfile>> {
        Ok(self.snapshot()?.profiles.remove(name))
    }

    /// Most recently saved profile
    pub fn last_used(&self) -> Result<Option<ConnectionProfile>> {
        let mut state = self.snapshot()?;
        Ok(state
            .last_profile
            .take()
            .and_then(|name| state.profiles.remove(&name)))
    }

    /// Save a profile, stamping it as last used
    pub fn save(&self, profile: &ConnectionProfile) -> Result<ConnectionProfile> {
        let mut profile = profile.clone();
        profile.last_used_at = Some(Utc::now());

        let saved = profile.clone();
        self.update(move |state| {
            state.last_profile = Some(profile.name.clone());
            state.profiles.insert(profile.name.clone(), profile);
        })?;

        debug!("Saved profile '{}'", saved.name);
        Ok(saved)
    }

    /// Forget a saved profile (its tunnel record is kept until stopped)
    pub fn delete(&self, name: &str) -> Result<bool> {
        self.update(|state| {
            if state.last_profile.as_deref() == Some(name) {
                state.last_profile = None;
            }
            state.profiles.remove(name).is_some()
        })
    }

    pub fn record_process(&self, name: &str, record: &TunnelProcessRecord) -> Result<()> {
        let record = record.clone();
        self.update(|state| {
            state.tunnels.insert(name.to_string(), record);
        })
    }

    pub fn clear_process(&self, name: &str) -> Result<Option<TunnelProcessRecord>> {
        // Avoid creating a state file just to remove nothing
        if !self.snapshot()?.tunnels.contains_key(name) {
            return Ok(None);
        }
        self.update(|state| state.tunnels.remove(name))
    }

    pub fn process(&self, name: &str) -> Result<Option<TunnelProcessRecord>> {
        Ok(self.snapshot()?.tunnels.remove(name))
    }

    pub fn processes(&self) -> Result<BTreeMap<String, TunnelProcessRecord>> {
        Ok(self.snapshot()?.tunnels)
    }

    /// Summaries of every saved profile, sorted by name
    ///
    /// Tunnel records without a saved profile (a run killed between starting
    /// the relay and saving) are listed too, so they can still be stopped.
    pub fn list_saved(&self) -> Result<Vec<ProfileSummary>> {
        let state = self.snapshot()?;

        let mut summaries: Vec<ProfileSummary> = state
            .profiles
            .values()
            .map(|profile| {
                let block = profile.ssh_host_block(false);
                ProfileSummary {
                    name: profile.name.clone(),
                    mode: profile.mode(),
                    endpoint: profile.endpoint.summary(),
                    ssh_target: format!("{}@{}:{}", block.user, block.host_name, block.port),
                    user: profile.user.clone(),
                    last_used_at: profile.last_used_at,
                    tunnel: state.tunnels.get(&profile.name).cloned(),
                    is_last_used: state.last_profile.as_deref() == Some(profile.name.as_str()),
                }
            })
            .collect();

        for (name, record) in &state.tunnels {
            if state.profiles.contains_key(name) {
                continue;
            }
            let endpoint = EndpointDescriptor::Private {
                share_token: record.share_token.clone(),
            };
            summaries.push(ProfileSummary {
                name: name.clone(),
                mode: ConnectionMode::Private,
                endpoint: endpoint.summary(),
                ssh_target: "-".to_string(),
                user: "-".to_string(),
                last_used_at: None,
                tunnel: Some(record.clone()),
                is_last_used: false,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(summaries)
    }

    pub fn cache_discovery(&self, record: &DiscoveryRecord) -> Result<()> {
        let record = record.clone();
        self.update(|state| {
            state.discovery.insert(record.profile_name.clone(), record);
        })
    }

    pub fn cached_discovery(&self, profile_name: &str) -> Result<Option<DiscoveryRecord>> {
        Ok(self.snapshot()?.discovery.remove(profile_name))
    }

    pub fn account_token(&self) -> Result<Option<String>> {
        Ok(self.snapshot()?.account_token)
    }

    pub fn set_account_token(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        self.update(|state| state.account_token = Some(token))
    }
}

/// Get the default state file path
pub fn default_state_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "could not determine home directory",
        ))
    })?;
    Ok(home.join(".notebook-relay").join("state.toml"))
}

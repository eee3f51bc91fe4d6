// Notebook Relay - Session Launcher
// Opens the editor's remote session against a reconciled SSH alias

use std::io::ErrorKind;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DEFAULT_EDITOR_PROGRAM: &str = "code";
pub const DEFAULT_WORKSPACE: &str = "/kaggle/working";

pub fn default_editor_args() -> Vec<String> {
    ["--remote", "ssh-remote+{alias}", "{workspace}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched,
    /// Editor not installed; carries the command to run by hand
    ManualFallback(String),
}

#[derive(Debug, Clone)]
pub struct SessionLauncher {
    pub program: String,
    /// Arguments with `{alias}` and `{workspace}` placeholders
    pub args: Vec<String>,
    pub workspace: String,
}

impl Default for SessionLauncher {
    fn default() -> Self {
        Self {
            program: DEFAULT_EDITOR_PROGRAM.to_string(),
            args: default_editor_args(),
            workspace: DEFAULT_WORKSPACE.to_string(),
        }
    }
}

impl SessionLauncher {
    pub fn render_args(&self, alias: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{alias}", alias)
                    .replace("{workspace}", &self.workspace)
            })
            .collect()
    }

    pub fn command_line(&self, alias: &str) -> String {
        std::iter::once(self.program.clone())
            .chain(self.render_args(alias))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Launch the editor detached; a missing binary is not an error
    pub fn open(&self, alias: &str) -> Result<LaunchOutcome> {
        let args = self.render_args(alias);
        debug!("Launching {} {:?}", self.program, args);

        let spawned = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(_child) => {
                info!("Opened editor session for '{}'", alias);
                Ok(LaunchOutcome::Launched)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Editor '{}' not found, falling back to manual command", self.program);
                Ok(LaunchOutcome::ManualFallback(self.command_line(alias)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

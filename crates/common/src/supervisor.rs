// Notebook Relay - Tunnel Process Supervisor
// Owns the relay access client subprocess: start, readiness, crash detection, stop

use std::collections::HashMap;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fsutil::ensure_private_dir;
use crate::network::{format_host_port, is_local_port_available, BRIDGE_BIND_ADDRESS};
use crate::process::{is_process_running, is_recorded_process, send_signal, Signal};
use crate::state::StateStore;
use crate::types::{EndpointDescriptor, TunnelProcessRecord, TunnelStatus};

pub const DEFAULT_RELAY_PROGRAM: &str = "zrok";
pub const DEFAULT_READY_MARKER: &str = "at the following endpoint";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Output lines attached to start failures
const OUTPUT_TAIL_LINES: usize = 20;
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn default_relay_args() -> Vec<String> {
    ["access", "private", "--headless", "--bind", "{bind}", "{token}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Enables the local relay environment under the profile's name
pub fn default_prepare_args() -> Vec<String> {
    ["enable", "{account_token}", "-d", "{name}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// File the relay client writes once its local environment is enabled
pub fn default_environment_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".zrok").join("environment.json"))
}

/// How to invoke the relay access client
#[derive(Debug, Clone)]
pub struct RelayCommand {
    pub program: String,
    /// Arguments with `{token}`, `{port}` and `{bind}` placeholders
    pub args: Vec<String>,
    /// Output substring that means the local bridge is bound
    pub ready_marker: String,
    pub startup_timeout: Duration,
    /// Wait between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    /// One `<profile>.log` per tunnel
    pub log_dir: PathBuf,
    /// Environment setup with `{account_token}` and `{name}` placeholders;
    /// empty disables it
    pub prepare_args: Vec<String>,
    /// Present once the environment is enabled; setup only runs without it
    pub environment_file: Option<PathBuf>,
}

impl RelayCommand {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: DEFAULT_RELAY_PROGRAM.to_string(),
            args: default_relay_args(),
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            log_dir: log_dir.into(),
            prepare_args: default_prepare_args(),
            environment_file: default_environment_file(),
        }
    }

    pub fn render_args(&self, share_token: &str, local_port: u16) -> Vec<String> {
        let bind = format_host_port(&BRIDGE_BIND_ADDRESS.to_string(), local_port);
        let port = local_port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{token}", share_token)
                    .replace("{port}", &port)
                    .replace("{bind}", &bind)
            })
            .collect()
    }

    /// Shell-style command line, for messages telling the user what to run
    pub fn command_line(&self, share_token: &str, local_port: u16) -> String {
        std::iter::once(self.program.clone())
            .chain(self.render_args(share_token, local_port))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn render_prepare_args(&self, account_token: &str, name: &str) -> Vec<String> {
        self.prepare_args
            .iter()
            .map(|arg| {
                arg.replace("{account_token}", account_token)
                    .replace("{name}", name)
            })
            .collect()
    }

    fn environment_enabled(&self) -> bool {
        self.environment_file.as_deref().is_some_and(Path::exists)
    }

    fn launch_error(&self, e: std::io::Error) -> Error {
        Error::TunnelStartFailed {
            reason: if e.kind() == std::io::ErrorKind::NotFound {
                format!(
                    "'{}' not found; install the relay access client and make sure it is on PATH",
                    self.program
                )
            } else {
                format!("failed to launch '{}': {}", self.program, e)
            },
            output: Vec::new(),
        }
    }

    fn log_path(&self, profile: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", profile))
    }
}

enum WaitOutcome {
    Ready,
    Exited(String),
    TimedOut,
    Cancelled,
}

/// Tracks one relay process per profile
///
/// Records live in the state store so a later invocation can find, reuse or
/// stop a tunnel started by an earlier one.
pub struct TunnelSupervisor {
    store: StateStore,
    relay: RelayCommand,
    /// Processes spawned by this instance, reaped with `try_wait`
    children: HashMap<String, Child>,
}

impl TunnelSupervisor {
    pub fn new(store: StateStore, relay: RelayCommand) -> Self {
        Self {
            store,
            relay,
            children: HashMap::new(),
        }
    }

    pub fn relay(&self) -> &RelayCommand {
        &self.relay
    }

    /// Start (or reuse) the tunnel for `profile`; Ctrl-C aborts the wait
    pub async fn start(
        &mut self,
        profile: &str,
        endpoint: &EndpointDescriptor,
        local_port: u16,
    ) -> Result<TunnelProcessRecord> {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                // No signal handler available: never cancel
                std::future::pending::<()>().await;
            }
        };
        self.start_with_cancel(profile, endpoint, local_port, ctrl_c)
            .await
    }

    /// Start the tunnel, giving up with `Interrupted` when `cancel` resolves
    pub async fn start_with_cancel(
        &mut self,
        profile: &str,
        endpoint: &EndpointDescriptor,
        local_port: u16,
        cancel: impl Future<Output = ()>,
    ) -> Result<TunnelProcessRecord> {
        let share_token = match endpoint {
            EndpointDescriptor::Private { share_token } => share_token.clone(),
            EndpointDescriptor::Public { .. } => {
                return Err(Error::InvalidArguments(
                    "public endpoints are reached directly and need no relay process".to_string(),
                ))
            }
        };

        let existing = match self.store.process(profile)? {
            Some(record) => {
                let alive = self.is_alive(profile, &record);
                Some((record, alive))
            }
            None => None,
        };

        if let Some((record, true)) = &existing {
            if record.status.is_ready()
                && record.share_token == share_token
                && record.local_port == local_port
            {
                info!(
                    "Tunnel for '{}' already running (pid {})",
                    profile, record.pid
                );
                return Ok(record.clone());
            }
        }

        // A rejected start must leave the current tunnel running
        let own_port = existing
            .as_ref()
            .filter(|(_, alive)| *alive)
            .map(|(record, _)| record.local_port);
        self.check_port(profile, local_port, own_port)?;

        if let Some((record, alive)) = existing {
            if alive {
                info!(
                    "Replacing {} tunnel for '{}' (pid {})",
                    record.status, profile, record.pid
                );
                self.terminate(profile, record.pid).await;
            } else {
                debug!(
                    "Discarding stale tunnel record for '{}' (pid {} is gone)",
                    profile, record.pid
                );
            }
            self.children.remove(profile);
            self.store.clear_process(profile)?;
        }

        let log_path = self.relay.log_path(profile);
        let mut child = self.spawn(&share_token, local_port, &log_path)?;
        let pid = child.id().ok_or_else(|| Error::TunnelStartFailed {
            reason: "relay process exited immediately".to_string(),
            output: tail_lines(&log_path, OUTPUT_TAIL_LINES),
        })?;

        let mut record = TunnelProcessRecord {
            pid,
            started_at: Utc::now(),
            local_port,
            status: TunnelStatus::Starting,
            share_token,
            log_path: Some(log_path.clone()),
        };
        if let Err(e) = self.store.record_process(profile, &record) {
            terminate_child(&mut child, self.relay.stop_grace).await;
            return Err(e);
        }

        debug!(
            "Waiting up to {:?} for relay readiness (pid {})",
            self.relay.startup_timeout, pid
        );
        let outcome = {
            let ready = wait_for_marker(&log_path, &self.relay.ready_marker);
            tokio::pin!(ready);
            tokio::pin!(cancel);

            tokio::select! {
                biased;
                res = &mut ready => match res {
                    Ok(()) => WaitOutcome::Ready,
                    Err(e) => WaitOutcome::Exited(format!("failed to read relay output: {}", e)),
                },
                status = child.wait() => WaitOutcome::Exited(match status {
                    Ok(status) => {
                        format!("relay process exited before becoming ready ({})", status)
                    }
                    Err(e) => format!("failed to wait for relay process: {}", e),
                }),
                _ = tokio::time::sleep(self.relay.startup_timeout) => WaitOutcome::TimedOut,
                _ = &mut cancel => WaitOutcome::Cancelled,
            }
        };

        let failure = match outcome {
            WaitOutcome::Ready => None,
            WaitOutcome::Exited(reason) => Some(Error::TunnelStartFailed {
                reason,
                output: Vec::new(),
            }),
            WaitOutcome::TimedOut => Some(Error::TunnelStartFailed {
                reason: format!(
                    "no readiness signal within {}s",
                    self.relay.startup_timeout.as_secs_f32()
                ),
                output: Vec::new(),
            }),
            WaitOutcome::Cancelled => Some(Error::Interrupted),
        };

        if let Some(err) = failure {
            terminate_child(&mut child, self.relay.stop_grace).await;
            self.store.clear_process(profile)?;
            return Err(match err {
                Error::TunnelStartFailed { reason, .. } => Error::TunnelStartFailed {
                    reason,
                    output: tail_lines(&log_path, OUTPUT_TAIL_LINES),
                },
                other => other,
            });
        }

        record.status = TunnelStatus::Ready;
        if let Err(e) = self.store.record_process(profile, &record) {
            terminate_child(&mut child, self.relay.stop_grace).await;
            let _ = self.store.clear_process(profile);
            return Err(e);
        }
        self.children.insert(profile.to_string(), child);

        info!(
            "Tunnel for '{}' ready on {} (pid {})",
            profile,
            format_host_port(&BRIDGE_BIND_ADDRESS.to_string(), local_port),
            pid
        );
        Ok(record)
    }

    /// Enable the local relay environment unless it already is
    ///
    /// Returns true when the setup command ran. Without an account token
    /// nothing can be enabled; the start attempt then reports the relay's
    /// own error.
    pub async fn prepare(&self, account_token: Option<&str>, name: &str) -> Result<bool> {
        if self.relay.prepare_args.is_empty() || self.relay.environment_enabled() {
            return Ok(false);
        }
        let Some(account_token) = account_token else {
            warn!("Relay environment is not enabled and no account token is known");
            return Ok(false);
        };

        // Arguments carry the account token; keep them out of the logs
        debug!("Enabling relay environment '{}'", name);
        let mut command = Command::new(&self.relay.program);
        command
            .args(self.relay.render_prepare_args(account_token, name))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let finished = tokio::time::timeout(self.relay.startup_timeout, command.output()).await;
        let output = match finished {
            Ok(result) => result.map_err(|e| self.relay.launch_error(e))?,
            Err(_) => {
                return Err(Error::TunnelStartFailed {
                    reason: format!(
                        "enabling the relay environment took longer than {}s",
                        self.relay.startup_timeout.as_secs_f32()
                    ),
                    output: Vec::new(),
                })
            }
        };

        if !output.status.success() {
            let text = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(Error::TunnelStartFailed {
                reason: format!("failed to enable the relay environment ({})", output.status),
                output: last_lines(&text, OUTPUT_TAIL_LINES),
            });
        }

        info!("Relay environment '{}' enabled", name);
        Ok(true)
    }

    /// Stop the tunnel for `profile` and clear its record
    ///
    /// Returns the record that was cleared, if there was one.
    pub async fn stop(&mut self, profile: &str) -> Result<Option<TunnelProcessRecord>> {
        let Some(mut record) = self.store.process(profile)? else {
            debug!("No tunnel recorded for '{}'", profile);
            return Ok(None);
        };

        if self.is_alive(profile, &record) {
            info!("Stopping tunnel for '{}' (pid {})", profile, record.pid);
            self.terminate(profile, record.pid).await;
        } else {
            debug!("Tunnel process {} already gone", record.pid);
        }

        self.children.remove(profile);
        self.store.clear_process(profile)?;
        record.status = TunnelStatus::Stopped;
        Ok(Some(record))
    }

    /// Current record for `profile`, marking dead processes as crashed
    pub fn status(&mut self, profile: &str) -> Result<Option<TunnelProcessRecord>> {
        let Some(mut record) = self.store.process(profile)? else {
            return Ok(None);
        };

        if matches!(record.status, TunnelStatus::Starting | TunnelStatus::Ready)
            && !self.is_alive(profile, &record)
        {
            warn!(
                "Tunnel process {} for '{}' is no longer running",
                record.pid, profile
            );
            record.status = TunnelStatus::Crashed;
            self.store.record_process(profile, &record)?;
        }

        Ok(Some(record))
    }

    fn is_alive(&mut self, profile: &str, record: &TunnelProcessRecord) -> bool {
        if let Some(child) = self.children.get_mut(profile) {
            if child.id() == Some(record.pid) {
                return matches!(child.try_wait(), Ok(None));
            }
        }
        is_recorded_process(record.pid, record.started_at)
    }

    /// `own_port` is held by this profile's live tunnel, which a replacement
    /// frees before binding
    fn check_port(
        &mut self,
        profile: &str,
        local_port: u16,
        own_port: Option<u16>,
    ) -> Result<()> {
        for (name, record) in self.store.processes()? {
            if name != profile && record.local_port == local_port && self.is_alive(&name, &record)
            {
                return Err(Error::PortInUse {
                    port: local_port,
                    holder: Some(name),
                });
            }
        }

        if own_port != Some(local_port) && !is_local_port_available(local_port) {
            return Err(Error::PortInUse {
                port: local_port,
                holder: None,
            });
        }
        Ok(())
    }

    fn spawn(&self, share_token: &str, local_port: u16, log_path: &Path) -> Result<Child> {
        ensure_private_dir(&self.relay.log_dir)?;
        let log = File::create(log_path)?;
        let log_err = log.try_clone()?;

        let args = self.relay.render_args(share_token, local_port);
        debug!("Spawning {} {:?}", self.relay.program, args);

        let mut command = Command::new(&self.relay.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // Own process group so terminal signals don't hit the relay
        #[cfg(unix)]
        command.process_group(0);

        command.spawn().map_err(|e| self.relay.launch_error(e))
    }

    async fn terminate(&mut self, profile: &str, pid: u32) {
        let grace = self.relay.stop_grace;
        match self.children.remove(profile) {
            Some(mut child) if child.id() == Some(pid) => terminate_child(&mut child, grace).await,
            _ => terminate_pid(pid, grace).await,
        }
    }
}

/// Follow a growing log file until a line contains `marker`
async fn wait_for_marker(path: &Path, marker: &str) -> std::io::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        let n = reader.read_line(&mut line).await?;
        if n == 0 || !line.ends_with('\n') {
            // At EOF; keep any partial line until the rest is written
            if line.contains(marker) {
                return Ok(());
            }
            tokio::time::sleep(LOG_POLL_INTERVAL).await;
            continue;
        }

        debug!("relay: {}", line.trim_end());
        if line.contains(marker) {
            return Ok(());
        }
        line.clear();
    }
}

async fn terminate_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    send_signal(pid, Signal::Terminate);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Relay process {} ignored SIGTERM, killing it", pid);
        send_signal(pid, Signal::Kill);
        let _ = child.wait().await;
    }
}

async fn terminate_pid(pid: u32, grace: Duration) {
    send_signal(pid, Signal::Terminate);
    if wait_for_exit(pid, grace).await {
        return;
    }

    warn!("Relay process {} ignored SIGTERM, killing it", pid);
    send_signal(pid, Signal::Kill);
    if !wait_for_exit(pid, Duration::from_secs(1)).await {
        warn!("Relay process {} is still running after SIGKILL", pid);
    }
}

async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while is_process_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

/// Last `n` lines of a log file (empty if unreadable)
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => last_lines(&text, n),
        Err(_) => Vec::new(),
    }
}

fn last_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    const READY_SCRIPT: &str =
        "sleep 0.2; echo \"relay bound at the following endpoint: {bind}\"; exec sleep 30";

    fn free_port() -> u16 {
        let listener = TcpListener::bind((BRIDGE_BIND_ADDRESS, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn private(token: &str) -> EndpointDescriptor {
        EndpointDescriptor::Private {
            share_token: token.to_string(),
        }
    }

    fn supervisor_with(dir: &TempDir, script: &str) -> TunnelSupervisor {
        let mut relay = RelayCommand::new(dir.path().join("logs"));
        relay.program = "/bin/sh".to_string();
        relay.args = vec![
            "-c".to_string(),
            script.to_string(),
            "relay".to_string(),
            "{token}".to_string(),
        ];
        relay.startup_timeout = Duration::from_secs(5);
        relay.stop_grace = Duration::from_millis(500);
        TunnelSupervisor::new(StateStore::new(dir.path().join("state.toml")), relay)
    }

    fn store_of(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.toml"))
    }

    #[test]
    fn test_render_args_placeholders() {
        let relay = RelayCommand::new("/tmp/logs");
        assert_eq!(
            relay.render_args("xyz789", 9191),
            vec!["access", "private", "--headless", "--bind", "127.0.0.1:9191", "xyz789"]
        );
        assert_eq!(
            relay.command_line("xyz789", 9191),
            "zrok access private --headless --bind 127.0.0.1:9191 xyz789"
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_kills() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        let port = free_port();

        let record = supervisor.start("kaggle", &private("xyz789"), port).await.unwrap();
        assert_eq!(record.status, TunnelStatus::Ready);
        assert_eq!(record.local_port, port);
        assert!(is_process_running(record.pid));
        assert_eq!(store_of(&temp_dir).process("kaggle").unwrap(), Some(record.clone()));

        // Second start reuses the live process
        let again = supervisor.start("kaggle", &private("xyz789"), port).await.unwrap();
        assert_eq!(again, record);

        let stopped = supervisor.stop("kaggle").await.unwrap().unwrap();
        assert_eq!(stopped.status, TunnelStatus::Stopped);
        assert!(!is_process_running(record.pid));
        assert!(store_of(&temp_dir).process("kaggle").unwrap().is_none());
        assert!(supervisor.stop("kaggle").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_token_replaces_process() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        let port = free_port();

        let first = supervisor.start("kaggle", &private("first1"), port).await.unwrap();
        let second = supervisor.start("kaggle", &private("second2"), port).await.unwrap();

        assert_ne!(first.pid, second.pid);
        assert!(!is_process_running(first.pid));
        assert_eq!(second.share_token, "second2");
        supervisor.stop("kaggle").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_record_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        let port = free_port();

        let stale = TunnelProcessRecord {
            pid: 999_999_999,
            started_at: Utc::now(),
            local_port: port,
            status: TunnelStatus::Ready,
            share_token: "xyz789".to_string(),
            log_path: None,
        };
        store_of(&temp_dir).record_process("kaggle", &stale).unwrap();

        let record = supervisor.start("kaggle", &private("xyz789"), port).await.unwrap();
        assert_ne!(record.pid, stale.pid);
        assert_eq!(record.status, TunnelStatus::Ready);
        supervisor.stop("kaggle").await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_before_ready_reports_output() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, "echo 'share not found'; exit 3");

        let err = supervisor
            .start("kaggle", &private("xyz789"), free_port())
            .await
            .unwrap_err();

        match err {
            Error::TunnelStartFailed { output, .. } => {
                assert_eq!(output, vec!["share not found".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(store_of(&temp_dir).process("kaggle").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_startup_timeout_kills_process() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, "echo $$ > \"$0.pid\"; exec sleep 30");
        supervisor.relay.args[2] = temp_dir.path().join("relay").display().to_string();
        supervisor.relay.startup_timeout = Duration::from_millis(300);

        let err = supervisor
            .start("kaggle", &private("xyz789"), free_port())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelStartFailed { .. }));
        assert!(store_of(&temp_dir).process("kaggle").unwrap().is_none());

        let pid: u32 = std::fs::read_to_string(temp_dir.path().join("relay.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!is_process_running(pid));
    }

    #[tokio::test]
    async fn test_cancel_during_wait_terminates_child() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, "exec sleep 30");

        let err = supervisor
            .start_with_cancel(
                "kaggle",
                &private("xyz789"),
                free_port(),
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Interrupted));
        assert!(store_of(&temp_dir).process("kaggle").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_port_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        let port = free_port();

        supervisor.start("kaggle", &private("xyz789"), port).await.unwrap();
        let err = supervisor
            .start("colab", &private("abc123"), port)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PortInUse { holder: Some(ref h), .. } if h == "kaggle"
        ));
        supervisor.stop("kaggle").await.unwrap();

        // Port held by something this tool does not track
        let listener = TcpListener::bind((BRIDGE_BIND_ADDRESS, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let err = supervisor
            .start("colab", &private("abc123"), busy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortInUse { holder: None, .. }));
    }

    #[tokio::test]
    async fn test_rejected_start_keeps_running_tunnel() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        let kaggle_port = free_port();
        let colab_port = free_port();

        supervisor.start("colab", &private("abc123"), colab_port).await.unwrap();
        let kaggle = supervisor
            .start("kaggle", &private("xyz789"), kaggle_port)
            .await
            .unwrap();

        // Moving kaggle onto colab's port is refused before kaggle is touched
        let err = supervisor
            .start("kaggle", &private("xyz789"), colab_port)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PortInUse { holder: Some(ref h), .. } if h == "colab"
        ));
        assert!(is_process_running(kaggle.pid));
        assert_eq!(store_of(&temp_dir).process("kaggle").unwrap(), Some(kaggle.clone()));

        // Same for a port held outside this tool
        let listener = TcpListener::bind((BRIDGE_BIND_ADDRESS, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let err = supervisor
            .start("kaggle", &private("other42"), busy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortInUse { holder: None, .. }));
        assert!(is_process_running(kaggle.pid));
        assert_eq!(store_of(&temp_dir).process("kaggle").unwrap(), Some(kaggle));

        supervisor.stop("kaggle").await.unwrap();
        supervisor.stop("colab").await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reused_pid_is_not_trusted() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        let port = free_port();

        // The recorded relay is long gone and its PID now belongs to this test
        let reused = TunnelProcessRecord {
            pid: std::process::id(),
            started_at: Utc::now() - chrono::Duration::days(1),
            local_port: port,
            status: TunnelStatus::Ready,
            share_token: "xyz789".to_string(),
            log_path: None,
        };
        store_of(&temp_dir).record_process("kaggle", &reused).unwrap();

        assert_eq!(
            supervisor.status("kaggle").unwrap().unwrap().status,
            TunnelStatus::Crashed
        );

        let record = supervisor.start("kaggle", &private("xyz789"), port).await.unwrap();
        assert_ne!(record.pid, reused.pid);
        supervisor.stop("kaggle").await.unwrap();

        // Stopping a reused record clears it without signalling anything
        store_of(&temp_dir).record_process("kaggle", &reused).unwrap();
        let stopped = supervisor.stop("kaggle").await.unwrap().unwrap();
        assert_eq!(stopped.pid, reused.pid);
        assert!(store_of(&temp_dir).process("kaggle").unwrap().is_none());
        assert!(is_process_running(std::process::id()));
    }

    #[tokio::test]
    async fn test_prepare_enables_environment_once() {
        let temp_dir = TempDir::new().unwrap();
        let env_file = temp_dir.path().join("environment.json");
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        supervisor.relay.environment_file = Some(env_file.clone());
        supervisor.relay.prepare_args = vec![
            "-c".to_string(),
            format!("echo \"$1 $2\" > '{}'", env_file.display()),
            "enable".to_string(),
            "{account_token}".to_string(),
            "{name}".to_string(),
        ];

        // Nothing to enable with
        assert!(!supervisor.prepare(None, "kaggle").await.unwrap());
        assert!(!env_file.exists());

        assert!(supervisor.prepare(Some("acct123"), "kaggle").await.unwrap());
        assert_eq!(std::fs::read_to_string(&env_file).unwrap().trim(), "acct123 kaggle");

        // Already enabled
        assert!(!supervisor.prepare(Some("acct123"), "kaggle").await.unwrap());
    }

    #[tokio::test]
    async fn test_prepare_failure_reports_output() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        supervisor.relay.environment_file = Some(temp_dir.path().join("environment.json"));
        supervisor.relay.prepare_args = vec![
            "-c".to_string(),
            "echo 'account token rejected' >&2; exit 1".to_string(),
        ];

        let err = supervisor.prepare(Some("acct123"), "kaggle").await.unwrap_err();
        match err {
            Error::TunnelStartFailed { reason, output } => {
                assert!(reason.contains("enable the relay environment"));
                assert_eq!(output, vec!["account token rejected".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_render_prepare_args() {
        let relay = RelayCommand::new("/tmp/logs");
        assert_eq!(
            relay.render_prepare_args("acct123", "kaggle"),
            vec!["enable", "acct123", "-d", "kaggle"]
        );
    }

    #[tokio::test]
    async fn test_status_detects_crash() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        let port = free_port();

        let record = supervisor.start("kaggle", &private("xyz789"), port).await.unwrap();
        assert_eq!(supervisor.status("kaggle").unwrap().unwrap().status, TunnelStatus::Ready);

        send_signal(record.pid, Signal::Kill);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = supervisor.status("kaggle").unwrap().unwrap();
        assert_eq!(status.status, TunnelStatus::Crashed);
        assert_eq!(
            store_of(&temp_dir).process("kaggle").unwrap().unwrap().status,
            TunnelStatus::Crashed
        );

        // The next start heals the crashed record
        let fresh = supervisor.start("kaggle", &private("xyz789"), port).await.unwrap();
        assert_ne!(fresh.pid, record.pid);
        supervisor.stop("kaggle").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_and_public_endpoint() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&temp_dir, READY_SCRIPT);
        supervisor.relay.program = temp_dir.path().join("no-such-relay").display().to_string();

        let err = supervisor
            .start("kaggle", &private("xyz789"), free_port())
            .await
            .unwrap_err();
        match err {
            Error::TunnelStartFailed { reason, .. } => assert!(reason.contains("not found")),
            other => panic!("unexpected error: {}", other),
        }

        let public = EndpointDescriptor::Public {
            host: "example.com".to_string(),
            port: 22,
        };
        assert!(matches!(
            supervisor.start("kaggle", &public, free_port()).await,
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_tail_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("relay.log");
        let text: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, text).unwrap();

        let tail = tail_lines(&path, 20);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], "line 11");
        assert_eq!(tail[19], "line 30");
        assert!(tail_lines(&temp_dir.path().join("missing"), 20).is_empty());
    }
}

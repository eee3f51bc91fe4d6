// Notebook Relay - CLI Commands
// connect / stop / list / setup-ssh-only flows over the common core

use std::io::IsTerminal;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

use notebook_relay_common::process::is_recorded_process;
use notebook_relay_common::supervisor::tail_lines;
use notebook_relay_common::{
    AuthMethod, ConnectionMode, ConnectionProfile, EndpointDescriptor, EndpointResolver, Error,
    LaunchOutcome, ProfileSummary, ResolutionSource, ResolveRequest, StateStore,
    TunnelProcessRecord, TunnelStatus, TunnelSupervisor, UpsertOutcome,
};

use crate::config::AppConfig;

/// Profile used when none is given and nothing was saved yet
pub const DEFAULT_PROFILE_NAME: &str = "kaggle_server";
pub const DEFAULT_KEY_PATH: &str = "~/.ssh/id_ed25519";

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Public,
    Private,
}

impl From<ModeArg> for ConnectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Public => ConnectionMode::Public,
            ModeArg::Private => ConnectionMode::Private,
        }
    }
}

/// SSH login options shared by `connect` and `setup-ssh-only`
#[derive(Debug, Clone, Default, Args)]
pub struct LoginArgs {
    /// Remote login user (default: root)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Password for the remote user (saved in the state file)
    #[arg(long, conflicts_with = "key")]
    pub password: Option<String>,

    /// Authenticate with a private key (default: ~/.ssh/id_ed25519)
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_KEY_PATH, value_name = "PATH")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ConnectArgs {
    /// Connection mode (inferred from --host / --token when omitted)
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Public host of the remote session, as host[:port]
    #[arg(long, conflicts_with = "token")]
    pub host: Option<String>,

    /// Share token of the remote session
    #[arg(long)]
    pub token: Option<String>,

    /// Local port for the relay bridge (default: 9191)
    #[arg(short, long)]
    pub port: Option<u16>,

    #[command(flatten)]
    pub login: LoginArgs,

    /// Skip launching the editor
    #[arg(long)]
    pub no_editor: bool,

    /// Profile name, also used as the SSH host alias
    #[arg(long)]
    pub profile: Option<String>,

    /// Environment name to look up on the discovery service (default: profile name)
    #[arg(long)]
    pub server_name: Option<String>,

    /// Account token for the discovery service
    #[arg(long, env = "NBRELAY_ACCOUNT_TOKEN", hide_env_values = true)]
    pub account_token: Option<String>,

    /// Stay attached; Ctrl+C stops the tunnel
    #[arg(long)]
    pub wait: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct StopArgs {
    /// Profile to stop (default: last used)
    #[arg(long)]
    pub profile: Option<String>,

    /// Also remove the profile's Host block from the SSH config
    #[arg(long)]
    pub remove_ssh_config: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct SetupSshArgs {
    /// Public host of the remote session, as host[:port]
    #[arg(long, conflicts_with = "token", required_unless_present = "token")]
    pub host: Option<String>,

    /// Share token of the remote session
    #[arg(long)]
    pub token: Option<String>,

    /// Local port the relay bridge will use (default: 9191)
    #[arg(short, long)]
    pub port: Option<u16>,

    #[command(flatten)]
    pub login: LoginArgs,

    /// Profile name, also used as the SSH host alias
    #[arg(long)]
    pub profile: Option<String>,
}

/// Everything a command needs: configuration plus the state store
pub struct App {
    pub config: AppConfig,
    pub store: StateStore,
    interactive: bool,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = config.state_store()?;
        Ok(Self {
            config,
            store,
            interactive: std::io::stdin().is_terminal(),
        })
    }

    fn supervisor(&self) -> TunnelSupervisor {
        TunnelSupervisor::new(self.store.clone(), self.config.relay_command(&self.store))
    }

    /// Saved profile by name, or the last used one
    fn saved_profile(&self, name: Option<&str>) -> Result<Option<ConnectionProfile>> {
        Ok(match name {
            Some(name) => self.store.load(name)?,
            None => self.store.last_used()?,
        })
    }

    /// Account token: flag/env, then state file, then config file
    fn account_token(&self, flag: Option<&str>) -> Result<Option<String>> {
        if let Some(token) = flag {
            return Ok(Some(token.to_string()));
        }
        if let Some(token) = self.store.account_token()? {
            return Ok(Some(token));
        }
        Ok(self.config.discovery.account_token.clone())
    }
}

/// Pick the connection mode, rejecting contradictory flags
pub fn infer_mode(
    mode: Option<ModeArg>,
    host: Option<&str>,
    token: Option<&str>,
    saved: Option<ConnectionMode>,
) -> Result<ConnectionMode, Error> {
    match (mode.map(ConnectionMode::from), host, token) {
        (_, Some(_), Some(_)) => Err(Error::InvalidArguments(
            "--host and --token are mutually exclusive".to_string(),
        )),
        (Some(ConnectionMode::Private), Some(_), None) => Err(Error::InvalidArguments(
            "--host cannot be used with --mode private".to_string(),
        )),
        (Some(ConnectionMode::Public), None, Some(_)) => Err(Error::InvalidArguments(
            "--token cannot be used with --mode public".to_string(),
        )),
        (Some(mode), _, _) => Ok(mode),
        (None, Some(_), None) => Ok(ConnectionMode::Public),
        (None, None, Some(_)) => Ok(ConnectionMode::Private),
        (None, None, None) => Ok(saved.unwrap_or(ConnectionMode::Private)),
    }
}

/// Apply login flags on top of a saved (or fresh) profile
fn apply_login(profile: &mut ConnectionProfile, login: &LoginArgs) {
    if let Some(user) = &login.user {
        profile.user = user.clone();
    }
    if let Some(password) = &login.password {
        profile.auth_method = AuthMethod::Password;
        profile.credential = Some(password.clone());
    } else if let Some(key) = &login.key {
        profile.auth_method = AuthMethod::Key;
        profile.credential = Some(shellexpand::tilde(key).into_owned());
    }
}

/// Start from the saved profile of the same name so unspecified flags keep
/// their previous values
fn base_profile(
    name: &str,
    saved: Option<ConnectionProfile>,
    endpoint: EndpointDescriptor,
) -> ConnectionProfile {
    match saved.filter(|p| p.name == name) {
        Some(mut profile) => {
            profile.endpoint = endpoint;
            profile
        }
        None => ConnectionProfile::new(name, endpoint),
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

enum Prompted {
    AccountToken(String),
    Host(String),
}

/// Interactive fallback when no endpoint source was given
fn prompt_missing_source(mode: ConnectionMode) -> Result<Prompted> {
    match mode {
        ConnectionMode::Private => {
            let token = Password::new()
                .with_prompt("Account token for endpoint discovery")
                .interact()
                .context("Failed to read account token")?;
            Ok(Prompted::AccountToken(token.trim().to_string()))
        }
        ConnectionMode::Public => {
            let host: String = Input::new()
                .with_prompt("Public host of the remote session (host[:port])")
                .interact_text()
                .context("Failed to read host")?;
            Ok(Prompted::Host(host.trim().to_string()))
        }
    }
}

pub async fn connect(app: &App, args: ConnectArgs) -> Result<()> {
    let saved = app.saved_profile(args.profile.as_deref())?;
    let name = args
        .profile
        .clone()
        .or_else(|| saved.as_ref().map(|p| p.name.clone()))
        .unwrap_or_else(|| DEFAULT_PROFILE_NAME.to_string());

    let mode = infer_mode(
        args.mode,
        args.host.as_deref(),
        args.token.as_deref(),
        saved.as_ref().map(ConnectionProfile::mode),
    )?;
    let discovery_name = args
        .server_name
        .clone()
        .or_else(|| saved.as_ref().and_then(|p| p.server_name.clone()))
        .unwrap_or_else(|| name.clone());
    debug!("Connecting '{}' in {} mode", name, mode);

    // Endpoint sources: explicit flag, discovery, saved profile, prompt
    let mut explicit_host = args.host.clone();
    let mut account_token = args.account_token.clone();
    let mut prompted_token = false;
    let has_explicit = args.host.is_some() || args.token.is_some();
    let saved_endpoint = saved
        .as_ref()
        .map(|p| p.endpoint.clone())
        .filter(|e| e.mode() == mode);

    let known_token = app.account_token(account_token.as_deref())?;
    if !has_explicit && known_token.is_none() && saved_endpoint.is_none() {
        if !app.interactive {
            return Err(Error::InvalidArguments(format!(
                "no endpoint for '{}': pass {} or --account-token",
                name,
                match mode {
                    ConnectionMode::Public => "--host",
                    ConnectionMode::Private => "--token",
                }
            ))
            .into());
        }
        match prompt_missing_source(mode)? {
            Prompted::AccountToken(token) => {
                account_token = Some(token);
                prompted_token = true;
            }
            Prompted::Host(host) => explicit_host = Some(host),
        }
    }

    let mut resolver = EndpointResolver::new(app.store.clone(), app.config.retry_policy());
    let token_for_discovery = if has_explicit || explicit_host.is_some() {
        None
    } else {
        app.account_token(account_token.as_deref())?
    };
    if let Some(token) = &token_for_discovery {
        resolver = resolver.with_discovery(Box::new(app.config.discovery_client(token)?));
    }

    let pb = resolver
        .has_discovery()
        .then(|| spinner(format!("Looking for '{}' on the discovery service...", discovery_name)));
    let resolution = resolver
        .resolve(ResolveRequest {
            mode,
            explicit_host: explicit_host.as_deref(),
            explicit_token: args.token.as_deref(),
            discovery_name: &discovery_name,
            saved: saved_endpoint.as_ref(),
        })
        .await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let resolution = resolution?;

    match resolution.source {
        ResolutionSource::Discovered => {
            println!("{} Found endpoint: {}", "✓".green(), resolution.endpoint.summary());
            if prompted_token || args.account_token.is_some() {
                if let Some(token) = &token_for_discovery {
                    app.store.set_account_token(token)?;
                }
            }
        }
        ResolutionSource::Cached => println!(
            "{} Discovery service unreachable, using cached endpoint {}",
            "⚠".yellow(),
            resolution.endpoint.summary()
        ),
        ResolutionSource::Saved => println!(
            "{} Using saved endpoint {}",
            "✓".green(),
            resolution.endpoint.summary()
        ),
        ResolutionSource::Explicit => {}
    }

    let mut profile = base_profile(&name, saved, resolution.endpoint);
    if let Some(port) = args.port {
        profile.local_port = port;
    }
    if args.server_name.is_some() {
        profile.server_name = args.server_name.clone();
    }
    apply_login(&mut profile, &args.login);
    profile.validate()?;

    // Tunnel first; the SSH block and profile commit only once it is up
    let mut supervisor = app.supervisor();
    let mut fresh_tunnel = false;
    let previous = app
        .store
        .process(&name)?
        .filter(|r| r.status.is_ready() && is_recorded_process(r.pid, r.started_at));

    if let EndpointDescriptor::Private { .. } = &profile.endpoint {
        let relay_token = app.account_token(account_token.as_deref())?;
        if supervisor.prepare(relay_token.as_deref(), &name).await? {
            println!("{} Relay environment enabled", "✓".green());
        }

        let pb = spinner(format!(
            "Starting relay on port {}...",
            profile.local_port
        ));
        let started = supervisor
            .start(&name, &profile.endpoint, profile.local_port)
            .await;
        pb.finish_and_clear();
        let record = started?;

        fresh_tunnel = previous.as_ref().map(|r| r.pid) != Some(record.pid);
        if fresh_tunnel {
            println!("{} Tunnel started (PID: {})", "✓".green(), record.pid);
        } else {
            println!("{} Tunnel already running (PID: {})", "✓".green(), record.pid);
        }
    }

    let profile = match reconcile_and_save(app, &profile) {
        Ok(profile) => profile,
        Err(err) => {
            if fresh_tunnel {
                restore_tunnel(&mut supervisor, &name, previous.as_ref()).await;
            }
            return Err(err);
        }
    };

    // The relay of an earlier private session goes only once public is committed
    if profile.mode() == ConnectionMode::Public {
        if let Some(old) = supervisor.stop(&name).await? {
            println!(
                "{} Stopped relay left from a private session (PID: {})",
                "✓".green(),
                old.pid
            );
        }
    }

    let launcher = app.config.launcher();
    if !args.no_editor {
        match launcher.open(&profile.name) {
            Ok(LaunchOutcome::Launched) => println!("{} Editor launched", "✓".green()),
            Ok(LaunchOutcome::ManualFallback(command)) => {
                println!("{} Editor '{}' not found", "⚠".yellow(), launcher.program);
                println!("  Connect manually: {}", command.cyan());
            }
            Err(e) => {
                println!("{} Could not launch editor: {}", "⚠".yellow(), e);
                println!("  Connect manually: {}", launcher.command_line(&profile.name).cyan());
            }
        }
    }

    print_banner(app, &profile);

    if args.wait && profile.mode() == ConnectionMode::Private {
        wait_attached(&mut supervisor, &profile.name).await?;
    }

    Ok(())
}

/// Undo a fresh tunnel after a failed commit, bringing back the one it replaced
async fn restore_tunnel(
    supervisor: &mut TunnelSupervisor,
    name: &str,
    previous: Option<&TunnelProcessRecord>,
) {
    warn!("Rolling back tunnel for '{}'", name);
    if let Err(e) = supervisor.stop(name).await {
        warn!("Failed to stop tunnel during rollback: {}", e);
    }

    let Some(previous) = previous else {
        return;
    };
    let endpoint = EndpointDescriptor::Private {
        share_token: previous.share_token.clone(),
    };
    match supervisor.start(name, &endpoint, previous.local_port).await {
        Ok(record) => println!(
            "{} Restored previous tunnel on port {} (PID: {})",
            "⚠".yellow(),
            record.local_port,
            record.pid
        ),
        Err(e) => warn!("Failed to restore previous tunnel for '{}': {}", name, e),
    }
}

/// Write the SSH block then the profile; nothing is saved if the block fails
fn reconcile_and_save(app: &App, profile: &ConnectionProfile) -> Result<ConnectionProfile> {
    let reconciler = app.config.ssh_reconciler()?;
    let mut block = profile.ssh_host_block(app.config.ssh.strict_host_key_checking);
    block.server_alive_interval = app.config.ssh.server_alive_interval;

    match reconciler.upsert(&block)? {
        UpsertOutcome::Inserted => println!(
            "{} Added Host {} to {}",
            "✓".green(),
            block.alias,
            reconciler.path().display()
        ),
        UpsertOutcome::Updated => println!(
            "{} Updated Host {} in {}",
            "✓".green(),
            block.alias,
            reconciler.path().display()
        ),
        UpsertOutcome::Unchanged => println!(
            "{} Host {} already up to date",
            "✓".green(),
            block.alias
        ),
    }

    Ok(app.store.save(profile)?)
}

fn print_banner(app: &App, profile: &ConnectionProfile) {
    let block = profile.ssh_host_block(app.config.ssh.strict_host_key_checking);
    let rule = "═".repeat(55);

    println!();
    println!("{}", rule.dimmed());
    println!("{}", format!("Connected to '{}'", profile.name).green().bold());
    println!("{}", rule.dimmed());
    println!();
    println!("SSH:     {}", format!("ssh {}", profile.name).cyan());
    println!(
        "         ssh {}@{} -p {}",
        block.user, block.host_name, block.port
    );
    println!();
    println!("Editor:  {}", app.config.launcher().command_line(&profile.name));
    if profile.auth_method == AuthMethod::Password {
        println!();
        println!(
            "{}",
            "Password: the one set when bootstrapping the remote session".dimmed()
        );
    }
    if profile.mode() == ConnectionMode::Private {
        println!();
        println!(
            "{}",
            format!("Stop the tunnel with 'nbrelay stop --profile {}'", profile.name).dimmed()
        );
    }
    println!("{}", rule.dimmed());
}

/// Stay in the foreground until Ctrl+C or until the relay dies
async fn wait_attached(supervisor: &mut TunnelSupervisor, name: &str) -> Result<()> {
    println!("{}", "Press Ctrl+C to disconnect.".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("{}", "Disconnecting...".yellow());
                supervisor.stop(name).await?;
                println!("{}", "✓ Tunnel stopped".green().bold());
                return Ok(());
            }
            _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {
                let record = supervisor.status(name)?;
                if let Some(TunnelProcessRecord {
                    status: TunnelStatus::Crashed,
                    log_path,
                    ..
                }) = record
                {
                    let output = log_path
                        .map(|p| tail_lines(&p, 20))
                        .unwrap_or_default();
                    supervisor.stop(name).await?;
                    return Err(Error::TunnelStartFailed {
                        reason: "relay process exited unexpectedly".to_string(),
                        output,
                    }
                    .into());
                }
            }
        }
    }
}

pub async fn stop(app: &App, args: StopArgs) -> Result<()> {
    let name = match args.profile {
        Some(name) => name,
        None => default_stop_target(app)?,
    };

    let mut supervisor = app.supervisor();
    match supervisor.stop(&name).await? {
        Some(record) => println!(
            "{} Stopped tunnel for '{}' (PID: {})",
            "✓".green(),
            name,
            record.pid
        ),
        None => println!("{} No tunnel running for '{}'", "✓".green(), name),
    }

    if args.remove_ssh_config {
        let reconciler = app.config.ssh_reconciler()?;
        if reconciler.remove(&name)? {
            println!(
                "{} Removed Host {} from {}",
                "✓".green(),
                name,
                reconciler.path().display()
            );
        }
    }

    Ok(())
}

/// Last used profile, else the only tunnel on record (one whose run died
/// before saving its profile)
fn default_stop_target(app: &App) -> Result<String> {
    if let Some(profile) = app.store.last_used()? {
        return Ok(profile.name);
    }

    let mut names = app.store.processes()?.into_keys();
    match (names.next(), names.next()) {
        (Some(name), None) => Ok(name),
        _ => Err(Error::InvalidArguments("no saved profile; pass --profile".to_string()).into()),
    }
}

pub async fn list(app: &App, json: bool) -> Result<()> {
    let mut summaries = app.store.list_saved()?;

    // Refresh tunnel liveness so crashed relays show up as such
    let mut supervisor = app.supervisor();
    for summary in &mut summaries {
        if summary.tunnel.is_some() {
            summary.tunnel = supervisor.status(&summary.name)?;
        }
    }

    if json {
        let json_output = serde_json::to_string_pretty(&summaries)?;
        println!("{}", json_output);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("{}", "No saved profiles.".yellow());
        println!("Create one with: {}", "nbrelay connect --token <share-token>".cyan());
        return Ok(());
    }

    print_profiles_table(&summaries);
    Ok(())
}

fn print_profiles_table(summaries: &[ProfileSummary]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Name").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Mode").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Endpoint").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("SSH").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Tunnel").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Last used").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);

    for summary in summaries {
        let name = if summary.is_last_used {
            format!("{} *", summary.name)
        } else {
            summary.name.clone()
        };

        let tunnel = match &summary.tunnel {
            Some(record) => {
                let color = match record.status {
                    TunnelStatus::Ready => Color::Green,
                    TunnelStatus::Starting => Color::Yellow,
                    TunnelStatus::Crashed | TunnelStatus::Stopped => Color::Red,
                };
                Cell::new(format!(
                    "{} (pid {}, port {})",
                    record.status, record.pid, record.local_port
                ))
                .fg(color)
            }
            None => Cell::new("-").fg(Color::DarkGrey),
        };

        let last_used = summary
            .last_used_at
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(name).fg(Color::Green),
            Cell::new(summary.mode.to_string()),
            Cell::new(&summary.endpoint),
            Cell::new(&summary.ssh_target),
            tunnel,
            Cell::new(last_used).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} profile(s) found", summaries.len().to_string().cyan());
    println!();
}

pub async fn setup_ssh_only(app: &App, args: SetupSshArgs) -> Result<()> {
    let mode = infer_mode(None, args.host.as_deref(), args.token.as_deref(), None)?;
    let saved = app.saved_profile(args.profile.as_deref())?;
    let name = args
        .profile
        .clone()
        .or_else(|| saved.as_ref().map(|p| p.name.clone()))
        .unwrap_or_else(|| DEFAULT_PROFILE_NAME.to_string());

    // Explicit values only: the resolver never touches the network here
    let resolution = EndpointResolver::new(app.store.clone(), app.config.retry_policy())
        .resolve(ResolveRequest {
            mode,
            explicit_host: args.host.as_deref(),
            explicit_token: args.token.as_deref(),
            discovery_name: &name,
            saved: None,
        })
        .await?;

    let mut profile = base_profile(&name, saved, resolution.endpoint);
    if let Some(port) = args.port {
        profile.local_port = port;
    }
    apply_login(&mut profile, &args.login);
    profile.validate()?;

    let profile = reconcile_and_save(app, &profile)?;

    println!();
    println!("SSH:     {}", format!("ssh {}", profile.name).cyan());
    if let EndpointDescriptor::Private { share_token } = &profile.endpoint {
        let relay = app.config.relay_command(&app.store);
        println!();
        println!("Start the relay yourself before connecting:");
        println!(
            "         {}",
            relay.command_line(share_token, profile.local_port).cyan()
        );
    }

    Ok(())
}

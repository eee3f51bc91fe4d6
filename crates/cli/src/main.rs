// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Notebook Relay Contributors

// Notebook Relay - CLI Client
// Reach notebook sessions over a relay network and open them in the editor

mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use notebook_relay_common::Error;

use crate::commands::{App, ConnectArgs, SetupSshArgs, StopArgs};
use crate::config::AppConfig;

const EXIT_INVALID_ARGUMENTS: u8 = 4;
/// Failures outside the core taxonomy (config file, terminal I/O)
const EXIT_IO: u8 = 3;

#[derive(Parser)]
#[command(name = "nbrelay")]
#[command(about = "Connect to notebook sessions through a relay network", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/notebook-relay/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the endpoint, start the tunnel, update SSH config and open the editor
    Connect(ConnectArgs),

    /// Stop a profile's tunnel
    Stop(StopArgs),

    /// List saved profiles and their tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Write the SSH config for an endpoint without starting a tunnel
    SetupSshOnly(SetupSshArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // --help and --version go to stdout and are not failures
            return if err.use_stderr() {
                ExitCode::from(EXIT_INVALID_ARGUMENTS)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_logging(verbose: bool) {
    let default_directives = if verbose {
        "notebook_relay_common=debug,nbrelay=debug"
    } else {
        "notebook_relay_common=warn,nbrelay=warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let app = App::new(config)?;

    match cli.command {
        Commands::Connect(args) => commands::connect(&app, args).await,
        Commands::Stop(args) => commands::stop(&app, args).await,
        Commands::List { json } => commands::list(&app, json).await,
        Commands::SetupSshOnly(args) => commands::setup_ssh_only(&app, args).await,
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<Error>()
        .map(Error::exit_code)
        .unwrap_or(EXIT_IO)
}

fn report_error(err: &anyhow::Error) {
    let core = err.downcast_ref::<Error>();

    if matches!(core, Some(Error::Interrupted)) {
        eprintln!();
        eprintln!("{}", "Interrupted, nothing left running".yellow());
        return;
    }

    eprintln!("{} {:#}", "✗".red().bold(), err);

    if let Some(Error::TunnelStartFailed { output, .. }) = core {
        if !output.is_empty() {
            eprintln!();
            eprintln!("{}", "Relay output:".dimmed());
            for line in output {
                eprintln!("  {}", line.dimmed());
            }
        }
    }

    if let Some(hint) = core.and_then(Error::hint) {
        eprintln!("  {}", hint.cyan());
    }
}

//! CLI for the ignite service launcher.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use ignite::ServiceConfig;

#[derive(Parser)]
#[command(name = "ignite", version, about = "Launch a service with race-free failure reporting")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a service and report whether it started.
    Run(run::RunArgs),

    /// Validate a service description without launching it.
    Check {
        /// Path to the service description (JSON).
        service: PathBuf,

        /// Print the parsed description as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.dispatch() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ignite: {e:#}");
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` wins; otherwise the `-v` count picks the level.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::Run(args) => args.run(),
            Command::Check { service, json } => check(&service, json).map(|()| 0),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "ignite", &mut std::io::stdout());
                Ok(0)
            }
        }
    }
}

fn check(path: &Path, json: bool) -> Result<()> {
    let config = ServiceConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let identity = config.identity()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    println!("command:  {}", config.command.join(" "));
    if let Some(notification) = config.notification()? {
        println!("ready:    {notification}");
    }
    if let Some(run_as) = identity {
        match run_as.gid {
            Some(gid) => println!("run as:   uid {} gid {gid}", run_as.uid),
            None => println!("run as:   uid {}", run_as.uid),
        }
    }
    for limit in config.resource_limits()? {
        println!("rlimit:   {:?} soft={:?} hard={:?}", limit.resource, limit.soft, limit.hard);
    }
    println!("{}: ok", path.display());
    Ok(())
}

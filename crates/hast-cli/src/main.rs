#![deny(unsafe_code)]

//! hastd: replication daemon and its control client.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hast_config::HastConfig;
use hast_core::{ControlClient, Daemon, ProcessLauncher, ResourceStatus, Role};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Highly available block storage replication.
#[derive(Parser)]
#[command(name = "hastd", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/hast.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Start,

    /// Change the role of resources.
    Role {
        /// init, primary or secondary.
        role: Role,

        /// Resource names, or "all".
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Show resource status.
    Status {
        /// Resource names; every resource when omitted.
        names: Vec<String>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Worker process entry point, started by the daemon.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        ctrl_fd: RawFd,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Worker { ctrl_fd } = cli.command {
        init_tracing(filter_for(cli.verbose, "info"));
        std::process::exit(hast_core::worker::session::run(ctrl_fd).await);
    }

    let config = load_config(&cli.config).await?;
    init_tracing(filter_for(cli.verbose, &config.logging.level));

    match cli.command {
        Commands::Start => cmd_start(config, cli.config).await?,
        Commands::Role { role, names } => cmd_role(&config, role, names).await?,
        Commands::Status { names } => cmd_status(&config, &names).await?,
        Commands::Config { show } => cmd_config(&config, &cli.config, show)?,
        Commands::Worker { .. } => {}
    }

    Ok(())
}

fn filter_for(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn init_tracing(filter: String) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}

async fn cmd_start(config: HastConfig, config_path: PathBuf) -> Result<()> {
    info!(config = %config_path.display(), "Starting hast daemon");
    let launcher = ProcessLauncher::current_exe()
        .context("unable to locate own executable")?
        .with_log_filter(config.logging.level.clone());
    let daemon = Daemon::start(config, Some(config_path), launcher).await?;
    daemon.run().await?;
    Ok(())
}

async fn cmd_role(config: &HastConfig, role: Role, names: Vec<String>) -> Result<()> {
    let names = resolve_names(names);
    let client = ControlClient::new(&config.daemon.control);
    let resources = client.set_role(&names, role).await?;
    print_status(&resources);
    Ok(())
}

async fn cmd_status(config: &HastConfig, names: &[String]) -> Result<()> {
    let client = ControlClient::new(&config.daemon.control);
    let resources = client.status(names).await?;
    print_status(&resources);
    Ok(())
}

fn cmd_config(config: &HastConfig, config_path: &Path, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// `all` anywhere in the list selects every resource.
fn resolve_names(names: Vec<String>) -> Vec<String> {
    if names.iter().any(|n| n == "all") {
        Vec::new()
    } else {
        names
    }
}

fn print_status(resources: &[ResourceStatus]) {
    println!(
        "{:<16} {:<10} {:<10} {:<8} {:<8} {:<24} REMOTE",
        "NAME", "ROLE", "REPL", "WORKER", "PEER", "LOCAL"
    );
    for res in resources {
        let worker = res
            .worker_pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let peer = if res.connected { "up" } else { "down" };
        println!(
            "{:<16} {:<10} {:<10} {:<8} {:<8} {:<24} {}",
            res.name,
            res.role.as_str(),
            res.replication.to_string(),
            worker,
            peer,
            res.local,
            res.remote
        );
    }
}

async fn load_config(path: &Path) -> Result<HastConfig> {
    if !path.exists() {
        bail!("configuration file {} not found", path.display());
    }
    HastConfig::load(path)
        .await
        .with_context(|| format!("unable to load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_all_selects_every_resource() {
        assert!(resolve_names(vec!["all".into()]).is_empty());
        assert_eq!(
            resolve_names(vec!["r0".into(), "r1".into()]),
            vec!["r0".to_string(), "r1".to_string()]
        );
    }

    #[test]
    fn test_verbosity_overrides_configured_level() {
        assert_eq!(filter_for(0, "warn"), "warn");
        assert_eq!(filter_for(1, "warn"), "debug");
        assert_eq!(filter_for(3, "warn"), "trace");
    }

    #[test]
    fn test_role_command_parses() {
        let cli = Cli::try_parse_from(["hastd", "role", "primary", "r0", "r1"]).unwrap();
        match cli.command {
            Commands::Role { role, names } => {
                assert_eq!(role, Role::Primary);
                assert_eq!(names, vec!["r0".to_string(), "r1".to_string()]);
            }
            _ => panic!("expected role command"),
        }
        assert!(Cli::try_parse_from(["hastd", "role", "master", "r0"]).is_err());
    }

    #[test]
    fn test_worker_command_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["hastd", "worker", "--ctrl-fd", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Worker { ctrl_fd: 7 }));
    }
}

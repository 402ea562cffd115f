//! termgate
//!
//! Remote interactive shells over websocket, one PTY per session.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use gateway::config::{default_config_path, Config, EnvOverride};
use gateway::orchestrator::{GatewayOrchestrator, OrchestratorEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// termgate - remote interactive shells over websocket.
#[derive(Parser, Debug)]
#[command(name = "termgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the gateway
    Start {
        /// Address to listen on, overriding the configuration
        #[arg(long, short, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Start { listen } => {
            let (mut config, overrides) = load_config(&config_path)?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            config.validate()?;

            let _guard = init_logging(&config, cli.verbose)?;
            tracing::info!("termgate starting...");
            tracing::debug!("Using config file: {:?}", config_path);
            for EnvOverride { variable, value } in &overrides {
                tracing::info!("Overriding from environment: {}={}", variable, value);
            }

            let mut orchestrator = GatewayOrchestrator::new(config)?;
            run(&mut orchestrator).await?;
        }
        Commands::Config(cmd) => run_config_command(cmd, &config_path)?,
    }

    Ok(())
}

/// Loads the configuration file and applies environment overrides.
///
/// The overrides are returned for logging once the subscriber is installed.
fn load_config(path: &Path) -> anyhow::Result<(Config, Vec<EnvOverride>)> {
    let mut config = Config::load(path)?;
    let overrides = config.apply_env_overrides();
    Ok((config, overrides))
}

/// Installs the tracing subscriber.
///
/// Logs go to stderr, or to a daily rolling file when `log_file` is set. The
/// returned guard must be kept alive for buffered file output to be flushed.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let filter = EnvFilter::try_new(level).context("Invalid log level")?;

    match &config.server.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .context("log_file must name a file")?;
            std::fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Runs the gateway until SIGINT or SIGTERM.
async fn run(orchestrator: &mut GatewayOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionOpened { session_id } => {
                    tracing::debug!("Session opened: {}", session_id);
                }
                OrchestratorEvent::SessionClosed { session_id, reason } => {
                    tracing::debug!("Session closed: {} ({})", session_id, reason);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Gateway error: {}", message);
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

fn run_config_command(cmd: ConfigCommands, path: &Path) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let (config, _) = load_config(path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["termgate", "start"]).unwrap();
        match cli.command {
            Commands::Start { listen } => assert!(listen.is_none()),
            _ => panic!("Expected Start command"),
        }
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_start_with_listen() {
        let cli =
            Cli::try_parse_from(["termgate", "start", "--listen", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Start { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["termgate", "start", "-v", "-c", "/tmp/tg.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tg.toml")));
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["termgate", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["termgate", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));

        let cli = Cli::try_parse_from(["termgate", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Path)));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["termgate"]).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_load_config_reports_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        Config::default().save(&path).unwrap();

        std::env::remove_var("TERMGATE_LOG_LEVEL");
        std::env::set_var("TERMGATE_LISTEN", "127.0.0.1:7001");
        let (config, overrides) = load_config(&path).unwrap();
        std::env::remove_var("TERMGATE_LISTEN");

        assert_eq!(config.server.listen, "127.0.0.1:7001");
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].variable, "TERMGATE_LISTEN");
        assert_eq!(overrides[0].value, "127.0.0.1:7001");
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("termgate").join("config.toml");

        run_config_command(ConfigCommands::Init { force: false }, &path).unwrap();
        assert!(path.exists());

        assert!(run_config_command(ConfigCommands::Init { force: false }, &path).is_err());
        assert!(run_config_command(ConfigCommands::Init { force: true }, &path).is_ok());

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.listen, gateway::config::DEFAULT_LISTEN);
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bmp::config::PlatformConfig;
use bmp::logging::{LogOptions, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "bmp")]
#[command(version, about = "Bare-metal application platform")]
pub struct Cli {
    /// Data directory holding the store, app checkouts and bmp.toml
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to a bmp.toml (defaults to <data-dir>/bmp.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane HTTP server
    Serve {
        /// Port to serve on (defaults to platform.listen_port)
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Enable dev mode (CORS permissive)
        #[arg(long)]
        dev: bool,
    },
    /// Create the data directory, store and a default bmp.toml
    Init,
    /// List registered apps
    Apps,
    /// Export every app's configuration as a snapshot
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge a snapshot file into the store
    Import { file: PathBuf },
    /// Validate a snapshot file without changing anything
    Validate { file: PathBuf },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = PlatformConfig::load(cli.data_dir.clone(), cli.config.as_deref())?;
    if cli.log_json {
        config.settings.logging.json = true;
    }
    let _log_guard = init_tracing(LogOptions {
        verbose: cli.verbose,
        json: config.settings.logging.json,
        dir: config.settings.logging.dir.as_deref(),
    })?;

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, *port, host, *dev).await?;
        }
        Commands::Init => cmd::cmd_init(&config, cli.config.as_deref())?,
        Commands::Apps => cmd::cmd_apps(&config)?,
        Commands::Export { output } => cmd::cmd_export(&config, output.as_deref())?,
        Commands::Import { file } => cmd::cmd_import(&config, file)?,
        Commands::Validate { file } => cmd::cmd_validate(file)?,
        Commands::Config { command } => {
            cmd::cmd_config(&config, cli.config.as_deref(), command.clone())?
        }
    }

    Ok(())
}

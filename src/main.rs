use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-sandbox")]
#[command(version, about = "Sandbox lifecycle and fault recovery for AI development sessions")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the health monitor, lifecycle manager and HTTP API
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "3142")]
        port: u16,

        /// Initialize database only (don't start server)
        #[arg(long)]
        init: bool,

        /// Database path (relative paths resolve against the project directory)
        #[arg(long, default_value = ".forge/sandbox.db")]
        db_path: String,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (API key redacted)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default .forge/sandbox.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    forge_sandbox::logging::init(&cli.log_level, cli.json_logs);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            port,
            init,
            db_path,
            dev,
        } => {
            let db_path = PathBuf::from(db_path);
            cmd::cmd_serve(&project_dir, *port, *init, db_path, *dev).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}

mod api;
mod config;
mod serve_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use config::{ConfigFile, ShepherdConfig, default_config_path};

#[derive(Parser)]
#[command(name = "shepherd", about = "Background coding-agent orchestrator")]
struct Cli {
    /// Config file path (defaults to $SHEPHERD_CONFIG or ./shepherd.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (overrides SHEPHERD_DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with a freshly generated callback secret
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the orchestrator: reconcile loop plus HTTP surfaces
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "config file {} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            let mut file = ConfigFile::default();
            file.callback.secret = Some(config::generate_secret());
            config::save_config(&config_path, &file)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
            println!("wrote {}", config_path.display());
            Ok(())
        }
        Commands::Serve => {
            let config = ShepherdConfig::resolve(&config_path, cli.database_url.as_deref())?;
            serve_cmd::run_serve(config).await
        }
    }
}

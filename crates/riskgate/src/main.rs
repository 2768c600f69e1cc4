//! riskgate daemon - ext_proc gRPC filter for LLM prompt and completion screening

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use riskgate::classifier::{GuardianClassifier, RiskClassifier};
use riskgate::config::FilterConfig;
use riskgate::error::Result;
use riskgate::server::GuardServer;

/// riskgate - screens LLM prompts and completions passing through Envoy
#[derive(Parser)]
#[command(name = "riskgate")]
#[command(about = "Envoy ext_proc filter that blocks risky LLM prompts and completions")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Listen address, overrides config and environment
    #[arg(long, global = true)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gRPC server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config, cli.listen).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,riskgate=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<PathBuf>, listen: Option<String>) -> Result<FilterConfig> {
    let mut config =
        FilterConfig::load(config_path.as_deref())?.apply_env(|key| std::env::var(key).ok())?;
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    tracing::info!("Starting riskgate");

    let config = load_config(config_path, listen)?;
    tracing::debug!("Config loaded: {:?}", config);

    let classifier: Arc<dyn RiskClassifier> = Arc::new(GuardianClassifier::new(&config.classifier)?);
    let server = GuardServer::new(Arc::new(config), classifier);

    server.serve().await?;

    tracing::info!("riskgate stopped");
    Ok(())
}

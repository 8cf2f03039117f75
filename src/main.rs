use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod cluster;
mod config;
mod detector;
mod error;
mod graph;
mod ingest;
mod io;
mod normalize;
mod oracle;
mod workspace;

use config::ServiceCfg;
use detector::DuplicateDetector;
use normalize::FormatNormalizer;
use workspace::Workspaces;

/// Image duplicate detection service.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "IMGDEDUP_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides config and environment
    #[arg(long)]
    bind: Option<String>,

    /// More log output (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = ServiceCfg::load(cli.config.as_deref()).await?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }

    let workspaces = Arc::new(Workspaces::new(&cfg.upload_dir));
    workspaces
        .ensure_root()
        .await
        .with_context(|| format!("Failed to create upload dir {}", cfg.upload_dir.display()))?;
    info!(upload_dir = %workspaces.root().display(), "workspace root ready");

    let normalizer = Arc::new(FormatNormalizer::from_cfg(&cfg.convert));
    let oracle = oracle::from_cfg(&cfg.oracle)?;
    info!(oracle = oracle.name(), "similarity oracle configured");

    let detector = DuplicateDetector::new(workspaces, normalizer, oracle);
    api::serve(&cfg, detector).await
}

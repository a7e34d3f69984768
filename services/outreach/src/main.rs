mod commands;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use outreach::{AppConfig, ChannelConfig, HttpJobsApi, JobsApi, ProgressChannel};
use progress::ProgressHub;
use tracing_subscriber::EnvFilter;

use crate::commands::Commands;

#[derive(Parser)]
#[command(name = "outreach", version, about = "Bulk influencer import/export jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::from_env()?;

    let api: Arc<dyn JobsApi> = Arc::new(HttpJobsApi::from_config(&cfg)?);
    let channel = ProgressChannel::new(ChannelConfig::from_app(&cfg), Arc::new(ProgressHub::new()));

    let result = commands::run(cli.command, &cfg, api, &channel).await;
    channel.shutdown().await;
    result
}

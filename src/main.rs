use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use autoupdate_server::{autoupdate::AllowAll, config::Config, server::run_with_config_until_ctrl_c};
use clap::Parser;

#[derive(Parser, Debug)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let config = if let Some(path) = args.config {
        Config::load(path).await?
    } else {
        Config::default()
    };

    run_with_config_until_ctrl_c(config, Arc::new(AllowAll)).await
}

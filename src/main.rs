mod analyzer;
mod bot;
mod breaker;
mod capital;
mod config;
mod daily_loss;
mod engine;
mod exchange;
mod executor;
mod fill_manager;
mod http;
mod indicators;
mod kelly;
mod lifecycle;
mod optimizer;
mod oracle;
mod order_queue;
mod orderbook;
mod rate_limiter;
mod scanner;
mod store;
mod utils;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use clap::Parser;

use crate::config::Settings;

#[derive(Debug, Parser)]
#[command(name = "gabagool", version)]
struct Cli {
    /// Override RUN_MODE (trade|scanner)
    #[arg(long)]
    mode: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(mode) = cli.mode {
        settings.run_mode = mode.to_lowercase();
        settings.validate()?;
    }

    log::info!(
        "app.start run_mode={} trade_mode={} data_dir={}",
        settings.run_mode,
        settings.trade_mode,
        settings.data_dir
    );

    bot::run(settings).await?;
    Ok(())
}

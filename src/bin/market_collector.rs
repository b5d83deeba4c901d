use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use market_collector::http::{self, AppState};
use market_collector::{Config, DataCollector, ExchangeClient, FileWriterPool, PairManager, Repository};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging regardless of RUST_LOG
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.debug {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    info!("starting market collector");
    info!("data root: {}", config.data_root);
    info!(
        "default currency pair: {}",
        config.default_currency_pair.symbol()
    );

    let repository = std::sync::Arc::new(
        Repository::open(PathBuf::from(&config.data_root).join("currency_pairs.json"))
            .context("failed to open pair repository")?,
    );
    let file_pool = std::sync::Arc::new(
        FileWriterPool::new(config.data_root.clone())
            .with_pattern(config.file_name_pattern.clone()),
    );
    let collector = DataCollector::new(config.default_currency_pair.clone(), file_pool.clone());
    let pair_manager = PairManager::new(
        repository.clone(),
        collector.clone(),
        ExchangeClient::default(),
        config.snapshot_period_s,
    );

    let manager_task = {
        let pair_manager = pair_manager.clone();
        tokio::spawn(pair_manager.run())
    };

    let app = http::router(AppState {
        repository,
        collector: collector.clone(),
        pair_manager: pair_manager.clone(),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("failed to bind http listener")?;
    info!("http control surface listening on port {}", config.port);

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("http server exited: {e}");
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    pair_manager.stop();
    collector.shutdown();
    file_pool.shutdown().ok();
    server_task.abort();
    manager_task.abort();

    Ok(())
}

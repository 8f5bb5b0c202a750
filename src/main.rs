mod cache;
mod config;
mod error;
mod exchange;
mod indicator;
mod model;
mod notifier;
mod store;
mod watcher;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use exchange::Exchange;
use exchange::binance::BinanceExchange;
use exchange::upbit::UpbitExchange;
use notifier::Notifier;
use notifier::telegram::TelegramNotifier;
use store::AlarmStore;
use store::sqlite::SqliteAlarmStore;
use watcher::Watcher;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Store,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(
    name = "whale-watcher",
    about = "Crypto-market whale and indicator alarm watcher"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    let store: Arc<dyn AlarmStore> = Arc::new(
        SqliteAlarmStore::open(&config.database_url)
            .await
            .change_context(AppError::Store)?,
    );
    let notifier: Arc<dyn Notifier> =
        Arc::new(TelegramNotifier::new(config.telegram_bot_token.as_str()));
    let upbit: Arc<dyn Exchange> = Arc::new(UpbitExchange::new());
    let binance: Arc<dyn Exchange> = Arc::new(BinanceExchange::new());

    let watcher = Arc::new(Watcher::new(store, notifier, upbit, binance));

    let cancel = CancellationToken::new();
    let watcher_handle = tokio::spawn(Arc::clone(&watcher).run(cancel.clone()));

    info!("watcher running");

    tokio::signal::ctrl_c()
        .await
        .change_context(AppError::Runtime)?;

    info!("ctrl+c received, shutting down");
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), watcher_handle).await;

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

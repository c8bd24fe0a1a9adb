//! Grid Engine Binary
//!
//! Runs every configured bot against the paper exchange (or the live venue
//! once an adapter is registered), with the status server and optional
//! Telegram notifications.
//!
//! ## Setup
//!
//! 1. Create a `.env` file in the project root for secrets:
//!    ```
//!    APP_NOTIFICATIONS__TELEGRAM__BOT_TOKEN=123:abc
//!    APP_NOTIFICATIONS__TELEGRAM__CHAT_ID=42
//!    ```
//!
//! 2. Run the engine:
//!    ```bash
//!    cargo run --bin grid_engine -- config.toml
//!    ```

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;

use grid_engine::config::Settings;
use grid_engine::grid::{
    engine_channels, GridEngine, GridRepository, HttpPriceFeed, LocalRepository, LogNotifier,
    ModeSwitchingGateway, NotificationGateway, Notifier, PaperExchange, StaticDecisionSource,
    SystemClock, TelegramNotifier,
};
use grid_engine::server::{start_server, ServerState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_file = dotenvy::dotenv();

    let args: Vec<String> = env::args().collect();
    let default_config = "config.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let settings = Settings::new(config_path)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str())).init();
    match env_file {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }
    settings.validate()?;

    // Paper venue
    let mut paper = PaperExchange::new(settings.exchange.fees, settings.exchange.min_order_value);
    for balance in &settings.exchange.paper_balances {
        paper = paper.with_balance(&balance.currency, balance.amount);
    }
    for price in &settings.exchange.paper_prices {
        paper = paper.with_price(&price.pair, price.price);
    }
    let paper = Arc::new(paper);
    let gateway = Arc::new(ModeSwitchingGateway::new(paper.clone()).starting_in(settings.exchange.mode)?);

    let mut local = match &settings.repository.path {
        Some(path) => {
            info!("Using repository snapshot at {}", path);
            LocalRepository::open(path)?
        }
        None => {
            warn!("No repository path configured, state will not survive a restart");
            LocalRepository::in_memory()
        }
    };
    if let Some(hours) = settings.repository.cancelled_order_retention_hours {
        local = local.with_cancelled_retention(chrono::Duration::hours(hours as i64));
    }
    let repository: Arc<dyn GridRepository> = Arc::new(local);

    let decisions = settings
        .decisions
        .iter()
        .fold(StaticDecisionSource::new(), |source, entry| {
            source.with_decision(&entry.pair, entry.decision.clone())
        });

    let transport: Arc<dyn NotificationGateway> = match &settings.notifications.telegram {
        Some(telegram) => Arc::new(TelegramNotifier::new(&telegram.bot_token, &telegram.chat_id)),
        None => Arc::new(LogNotifier),
    };

    let engine = Arc::new(GridEngine::new(
        settings.engine.clone(),
        gateway,
        Arc::new(SystemClock),
        repository,
        Arc::new(decisions),
        Notifier::spawn(transport),
    ));

    let added = engine.register_bots(&settings.bots).await?;
    info!("{} bots configured, {} newly registered", settings.bots.len(), added);

    let report = engine.startup().await?;
    info!(
        "Restart safety: {} orders cancelled, safe to continue: {}",
        report.total_orders_cancelled, report.is_safe_to_continue
    );

    let (handle, channels) = engine_channels(16);

    if settings.server.enabled {
        let state = ServerState {
            engine: engine.clone(),
            handle: handle.clone(),
        };
        let host = settings.server.host.clone();
        let port = settings.server.port;
        tokio::spawn(async move {
            if let Err(e) = start_server(state, &host, port).await {
                error!("Status server stopped: {}", e);
            }
        });
    }

    let (feed_stop, feed_rx) = watch::channel(false);
    if let Some(feed) = &settings.exchange.price_feed {
        let pairs = settings.bots.iter().map(|b| b.pair.clone()).collect();
        let feed = HttpPriceFeed::new(
            feed.url.clone(),
            pairs,
            Duration::from_secs(feed.poll_interval_secs.max(1)),
            paper,
        );
        tokio::spawn(feed.run(feed_rx));
    }

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_handle.shutdown();
        }
    });

    engine.run(channels).await?;
    let _ = feed_stop.send(true);
    Ok(())
}

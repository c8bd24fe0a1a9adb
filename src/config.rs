use std::collections::HashSet;

use config::{Config, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{BotConfig, Decision, EngineConfig, FeeSchedule, GridError, GridResult, TradingMode};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Scheduler intervals, retry schedules and safety margins
    #[serde(default)]
    pub engine: EngineConfig,
    /// Venue selection and paper exchange seed
    #[serde(default)]
    pub exchange: ExchangeSettings,
    /// Bots registered at startup; stored bots keep their persisted status
    #[serde(default)]
    pub bots: Vec<BotConfig>,
    /// Initial directives per pair
    #[serde(default)]
    pub decisions: Vec<DecisionEntry>,
    #[serde(default)]
    pub repository: RepositorySettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeSettings {
    /// "paper" or "live"
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    #[serde(default)]
    pub fees: FeeSchedule,
    /// Minimum order value in quote currency
    #[serde(default = "default_min_order_value")]
    pub min_order_value: f64,
    /// Starting balances of the paper exchange
    #[serde(default)]
    pub paper_balances: Vec<PaperBalance>,
    /// Starting prices of the paper exchange
    #[serde(default)]
    pub paper_prices: Vec<PaperPrice>,
    #[serde(default)]
    pub price_feed: Option<PriceFeedSettings>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            mode: TradingMode::default(),
            quote_currency: default_quote_currency(),
            fees: FeeSchedule::default(),
            min_order_value: default_min_order_value(),
            paper_balances: Vec::new(),
            paper_prices: Vec::new(),
            price_feed: None,
        }
    }
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_min_order_value() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperBalance {
    pub currency: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperPrice {
    pub pair: String,
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceFeedSettings {
    /// Ticker URL with a `{symbol}` placeholder
    pub url: String,
    #[serde(default = "default_price_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_price_poll_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionEntry {
    pub pair: String,
    pub decision: Decision,
}

#[derive(Debug, Default, Deserialize)]
pub struct RepositorySettings {
    /// JSON snapshot file; in-memory only when unset
    #[serde(default)]
    pub path: Option<String>,
    /// Hours a cancelled order is kept before it is dropped from the snapshot
    #[serde(default)]
    pub cancelled_order_retention_hours: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationSettings {
    /// Telegram delivery; notifications only go to the log when unset
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Enable the status server
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    /// Server port (default 3000)
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Server host (default 127.0.0.1)
    #[serde(default = "default_server_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            host: default_server_host(),
        }
    }
}

fn default_server_enabled() -> bool {
    false
}

fn default_server_port() -> u16 {
    3000
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment overrides the file
            // e.g. APP_NOTIFICATIONS__TELEGRAM__BOT_TOKEN=...
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Load settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> GridResult<()> {
        self.engine.validate()?;

        let mut pairs = HashSet::new();
        for bot in &self.bots {
            bot.validate()?;
            if !pairs.insert(bot.pair.as_str()) {
                return Err(GridError::InvalidConfig(format!("duplicate bot for {}", bot.pair)));
            }
            if bot.quote_currency() != self.exchange.quote_currency {
                return Err(GridError::InvalidConfig(format!(
                    "{} is not quoted in {}",
                    bot.pair, self.exchange.quote_currency
                )));
            }
        }

        for entry in &self.decisions {
            if !pairs.contains(entry.pair.as_str()) {
                return Err(GridError::InvalidConfig(format!(
                    "decision for unknown bot {}",
                    entry.pair
                )));
            }
        }

        if self.exchange.min_order_value < 0.0 {
            return Err(GridError::InvalidConfig("min_order_value cannot be negative".into()));
        }
        Ok(())
    }
}

//! Bot and engine configuration

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::{split_pair, Decision};

/// Configuration and lifecycle flags for one grid bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Trading pair (e.g., "ETH/USDT"); one bot per pair
    pub pair: String,
    /// Optional owner for multi-tenant setups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Capital ceiling this bot may ever touch, in quote currency
    pub total_capital: f64,
    /// Number of price levels in the ladder (at least 2)
    #[serde(default = "default_grid_levels")]
    pub grid_levels: u32,
    /// Full width of the ladder as a percent of the reference price
    #[serde(default = "default_price_range_percent")]
    pub price_range_percent: f64,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    #[serde(default = "default_true")]
    pub enable_stop_loss: bool,
    #[serde(default = "default_true")]
    pub trailing_up_enabled: bool,
    /// Rise above the highest sell level that re-centers the ladder
    #[serde(default = "default_trailing_up_percent")]
    pub trailing_up_percent: f64,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<Decision>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_grid_levels() -> u32 {
    30
}

fn default_price_range_percent() -> f64 {
    10.0
}

fn default_stop_loss_percent() -> f64 {
    5.0
}

fn default_trailing_up_percent() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl BotConfig {
    /// Create a stopped bot with default ladder parameters
    pub fn new(pair: impl Into<String>, total_capital: f64) -> Self {
        let now = Utc::now();
        Self {
            pair: pair.into(),
            owner: None,
            total_capital,
            grid_levels: default_grid_levels(),
            price_range_percent: default_price_range_percent(),
            stop_loss_percent: default_stop_loss_percent(),
            enable_stop_loss: true,
            trailing_up_enabled: true,
            trailing_up_percent: default_trailing_up_percent(),
            is_running: false,
            last_decision: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set ladder size and width
    pub fn with_grid(mut self, grid_levels: u32, price_range_percent: f64) -> Self {
        self.grid_levels = grid_levels;
        self.price_range_percent = price_range_percent;
        self
    }

    /// Builder: configure stop-loss
    pub fn with_stop_loss(mut self, enabled: bool, percent: f64) -> Self {
        self.enable_stop_loss = enabled;
        self.stop_loss_percent = percent;
        self
    }

    /// Builder: configure trailing-up
    pub fn with_trailing_up(mut self, enabled: bool, percent: f64) -> Self {
        self.trailing_up_enabled = enabled;
        self.trailing_up_percent = percent;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Builder: set lifecycle flags (mostly for restoring state)
    pub fn with_status(mut self, is_running: bool, last_decision: Option<Decision>) -> Self {
        self.is_running = is_running;
        self.last_decision = last_decision;
        self
    }

    pub fn base_currency(&self) -> &str {
        split_pair(&self.pair).0
    }

    pub fn quote_currency(&self) -> &str {
        split_pair(&self.pair).1
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        let (base, quote) = split_pair(&self.pair);
        if base.is_empty() || quote.is_empty() {
            return Err(GridError::InvalidConfig(format!(
                "pair '{}' must be formatted as BASE/QUOTE",
                self.pair
            )));
        }

        if self.grid_levels < 2 {
            return Err(GridError::InvalidConfig(
                "grid_levels must be at least 2".into(),
            ));
        }

        if self.total_capital <= 0.0 {
            return Err(GridError::InvalidConfig(
                "total_capital must be positive".into(),
            ));
        }

        if self.price_range_percent <= 0.0 || self.price_range_percent >= 200.0 {
            return Err(GridError::InvalidConfig(
                "price_range_percent must be in (0, 200)".into(),
            ));
        }

        if self.enable_stop_loss && !(0.0..100.0).contains(&self.stop_loss_percent) {
            return Err(GridError::InvalidConfig(
                "stop_loss_percent must be in [0, 100)".into(),
            ));
        }

        if self.trailing_up_enabled && self.trailing_up_percent < 0.0 {
            return Err(GridError::InvalidConfig(
                "trailing_up_percent cannot be negative".into(),
            ));
        }

        Ok(())
    }
}

/// Timing, retry and safety parameters shared by all bots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often directives are evaluated
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval_secs: u64,
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_secs: u64,
    #[serde(default = "default_risk_interval")]
    pub risk_interval_secs: u64,
    #[serde(default = "default_summary_interval")]
    pub summary_interval_secs: u64,
    /// Minimum gap between two status queries for the same order
    #[serde(default = "default_order_recheck")]
    pub order_recheck_secs: u64,
    /// Lifetime of the active-config cache used by reconciliation
    #[serde(default = "default_config_cache_ttl")]
    pub config_cache_ttl_secs: u64,
    /// Delays between re-reads before a running bot's ladder is declared empty
    #[serde(default = "default_empty_ladder_retry_delays")]
    pub empty_ladder_retry_delays_secs: Vec<u64>,
    /// Rebuild even when local records still list open orders
    #[serde(default)]
    pub rebuild_on_ambiguous_empty_ladder: bool,
    #[serde(default = "default_balance_wait_attempts")]
    pub balance_wait_attempts: u32,
    #[serde(default = "default_balance_wait_delay")]
    pub balance_wait_delay_secs: u64,
    /// Attempts for exchange writes (place/cancel)
    #[serde(default = "default_write_attempts")]
    pub write_max_attempts: u32,
    #[serde(default = "default_write_base_delay")]
    pub write_base_delay_ms: u64,
    #[serde(default = "default_write_attempts")]
    pub sell_position_attempts: u32,
    /// Allowed capital shortfall at restart, as a percent of allocation
    #[serde(default = "default_restart_margin")]
    pub restart_safety_margin_percent: f64,
    /// Error streak on one bot that triggers an alert
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_monitoring_interval() -> u64 {
    3600
}

fn default_reconciliation_interval() -> u64 {
    10
}

fn default_risk_interval() -> u64 {
    10
}

fn default_summary_interval() -> u64 {
    3600
}

fn default_order_recheck() -> u64 {
    5
}

fn default_config_cache_ttl() -> u64 {
    300
}

fn default_empty_ladder_retry_delays() -> Vec<u64> {
    vec![2, 5, 10]
}

fn default_balance_wait_attempts() -> u32 {
    10
}

fn default_balance_wait_delay() -> u64 {
    2
}

fn default_write_attempts() -> u32 {
    3
}

fn default_write_base_delay() -> u64 {
    500
}

fn default_restart_margin() -> f64 {
    5.0
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: default_monitoring_interval(),
            reconciliation_interval_secs: default_reconciliation_interval(),
            risk_interval_secs: default_risk_interval(),
            summary_interval_secs: default_summary_interval(),
            order_recheck_secs: default_order_recheck(),
            config_cache_ttl_secs: default_config_cache_ttl(),
            empty_ladder_retry_delays_secs: default_empty_ladder_retry_delays(),
            rebuild_on_ambiguous_empty_ladder: false,
            balance_wait_attempts: default_balance_wait_attempts(),
            balance_wait_delay_secs: default_balance_wait_delay(),
            write_max_attempts: default_write_attempts(),
            write_base_delay_ms: default_write_base_delay(),
            sell_position_attempts: default_write_attempts(),
            restart_safety_margin_percent: default_restart_margin(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl EngineConfig {
    pub fn empty_ladder_retry_delays(&self) -> Vec<Duration> {
        self.empty_ladder_retry_delays_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    /// Delay schedule while waiting for a market buy to settle
    pub fn balance_wait_delays(&self) -> Vec<Duration> {
        vec![Duration::from_secs(self.balance_wait_delay_secs); self.balance_wait_attempts as usize]
    }

    pub fn order_recheck(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.order_recheck_secs as i64)
    }

    pub fn config_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config_cache_ttl_secs as i64)
    }

    /// Builder: set all retry schedules to zero delay (tests, dry runs)
    pub fn without_delays(mut self) -> Self {
        self.empty_ladder_retry_delays_secs = vec![0; self.empty_ladder_retry_delays_secs.len()];
        self.balance_wait_delay_secs = 0;
        self.write_base_delay_ms = 0;
        self
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.reconciliation_interval_secs == 0
            || self.risk_interval_secs == 0
            || self.monitoring_interval_secs == 0
            || self.summary_interval_secs == 0
        {
            return Err(GridError::InvalidConfig(
                "engine intervals must be positive".into(),
            ));
        }

        if self.write_max_attempts == 0 || self.sell_position_attempts == 0 {
            return Err(GridError::InvalidConfig(
                "retry attempts must be at least 1".into(),
            ));
        }

        if self.restart_safety_margin_percent < 0.0 {
            return Err(GridError::InvalidConfig(
                "restart_safety_margin_percent cannot be negative".into(),
            ));
        }

        Ok(())
    }
}

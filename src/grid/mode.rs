//! Paper/live mode switching
//!
//! Both gateways stay constructed; [`ModeSwitchingGateway`] routes every call
//! to the active one. A switch flattens every bot on the old venue first and
//! re-verifies capital on the new one. Bots come back through activation.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::exchange::ExchangeGateway;
use super::ladder::LadderBuilder;
use super::notifier::{Notification, Notifier};
use super::repository::GridRepository;
use super::restart::{RestartSafetyCheck, RestartSafetyReport};
use super::types::{Balance, ExchangeOrder, FeeSchedule, OrderRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Simulated or sandbox venue
    #[default]
    Paper,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradingMode {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "sandbox" => Ok(TradingMode::Paper),
            "live" | "production" => Ok(TradingMode::Live),
            other => Err(GridError::InvalidConfig(format!("unknown trading mode: {}", other))),
        }
    }
}

/// Gateway that forwards to the paper or live venue
pub struct ModeSwitchingGateway {
    paper: Arc<dyn ExchangeGateway>,
    live: Option<Arc<dyn ExchangeGateway>>,
    is_live: AtomicBool,
}

impl ModeSwitchingGateway {
    pub fn new(paper: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            paper,
            live: None,
            is_live: AtomicBool::new(false),
        }
    }

    /// Builder: register the live venue
    pub fn with_live(mut self, live: Arc<dyn ExchangeGateway>) -> Self {
        self.live = Some(live);
        self
    }

    /// Builder: start in the given mode
    pub fn starting_in(self, mode: TradingMode) -> GridResult<Self> {
        self.set_mode(mode)?;
        Ok(self)
    }

    pub fn mode(&self) -> TradingMode {
        if self.is_live.load(Ordering::SeqCst) {
            TradingMode::Live
        } else {
            TradingMode::Paper
        }
    }

    pub fn has_live(&self) -> bool {
        self.live.is_some()
    }

    fn set_mode(&self, mode: TradingMode) -> GridResult<()> {
        if mode == TradingMode::Live && self.live.is_none() {
            return Err(GridError::InvalidConfig("no live exchange configured".into()));
        }
        self.is_live.store(mode == TradingMode::Live, Ordering::SeqCst);
        Ok(())
    }

    fn active(&self) -> &Arc<dyn ExchangeGateway> {
        match (&self.live, self.is_live.load(Ordering::SeqCst)) {
            (Some(live), true) => live,
            _ => &self.paper,
        }
    }
}

#[async_trait]
impl ExchangeGateway for ModeSwitchingGateway {
    fn name(&self) -> &str {
        self.active().name()
    }

    async fn get_price(&self, pair: &str) -> GridResult<f64> {
        self.active().get_price(pair).await
    }

    async fn get_balance(&self, currency: &str) -> GridResult<Balance> {
        self.active().get_balance(currency).await
    }

    async fn place_order(&self, request: &OrderRequest) -> GridResult<ExchangeOrder> {
        self.active().place_order(request).await
    }

    async fn cancel_order(&self, pair: &str, order_id: &str) -> GridResult<bool> {
        self.active().cancel_order(pair, order_id).await
    }

    async fn get_open_orders(&self, pair: &str) -> GridResult<Vec<ExchangeOrder>> {
        self.active().get_open_orders(pair).await
    }

    async fn get_order(&self, pair: &str, order_id: &str) -> GridResult<ExchangeOrder> {
        self.active().get_order(pair, order_id).await
    }

    async fn get_trading_fees(&self, pair: &str) -> GridResult<FeeSchedule> {
        self.active().get_trading_fees(pair).await
    }

    async fn get_minimum_order_value(&self, pair: &str) -> GridResult<f64> {
        self.active().get_minimum_order_value(pair).await
    }
}

/// Result of a completed mode switch
#[derive(Debug, Clone, Serialize)]
pub struct ModeSwitchReport {
    pub from: TradingMode,
    pub to: TradingMode,
    pub orders_cancelled: u32,
    pub positions_sold: usize,
    pub bots_stopped: usize,
    pub verification: RestartSafetyReport,
}

pub struct ModeSwitcher {
    gateway: Arc<ModeSwitchingGateway>,
    ladder: Arc<LadderBuilder>,
    repository: Arc<dyn GridRepository>,
    restart: Arc<RestartSafetyCheck>,
    notifier: Notifier,
}

impl ModeSwitcher {
    /// The ladder's exchange service must wrap `gateway`
    pub fn new(
        gateway: Arc<ModeSwitchingGateway>,
        ladder: Arc<LadderBuilder>,
        repository: Arc<dyn GridRepository>,
        restart: Arc<RestartSafetyCheck>,
        notifier: Notifier,
    ) -> Self {
        Self {
            gateway,
            ladder,
            repository,
            restart,
            notifier,
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.gateway.mode()
    }

    /// Flatten every bot on the current venue, flip, and verify capital on
    /// the new venue. Any failure before the flip leaves the mode unchanged.
    pub async fn switch(&self, target: TradingMode) -> GridResult<ModeSwitchReport> {
        let from = self.gateway.mode();
        if from == target {
            return Err(GridError::InvalidState {
                current_state: format!("already in {} mode", target),
            });
        }
        if target == TradingMode::Live && !self.gateway.has_live() {
            return Err(GridError::InvalidConfig("no live exchange configured".into()));
        }

        info!("Switching trading mode {} -> {}", from, target);
        let configs = self.repository.get_all_configs().await?;
        let mut orders_cancelled = 0;
        let mut positions_sold = 0;
        let mut bots_stopped = 0;

        for config in &configs {
            let teardown = self.ladder.teardown(config).await?;
            orders_cancelled += teardown.cancelled;
            for trade in teardown.trades {
                self.notifier.notify(Notification::TradeCompleted(trade));
            }
            if self.ladder.exchange().sell_position_with_retry(config).await?.is_some() {
                positions_sold += 1;
            }
            if config.is_running {
                self.repository.update_bot_status(&config.pair, false, None).await?;
                bots_stopped += 1;
            }
        }

        self.gateway.set_mode(target)?;
        info!("Trading mode is now {} ({})", target, self.gateway.name());

        let verifications = self.restart.verify_capital(&configs).await;
        let verification = RestartSafetyReport::new(orders_cancelled, Vec::new(), verifications);
        if !verification.is_safe_to_continue {
            warn!("Capital on the {} venue does not cover every allocation", target);
        }

        self.notifier.notify(Notification::BotStatus {
            pair: "*".into(),
            status: format!("MODE {}", target.as_str().to_uppercase()),
            detail: format!(
                "Switched from {}: {} orders cancelled, {} positions sold, {} bots stopped",
                from, orders_cancelled, positions_sold, bots_stopped
            ),
        });
        self.notifier.notify(Notification::RestartSafety(verification.clone()));

        Ok(ModeSwitchReport {
            from,
            to: target,
            orders_cancelled,
            positions_sold,
            bots_stopped,
            verification,
        })
    }
}

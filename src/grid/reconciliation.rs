//! Fill detection and complementary order placement
//!
//! Each pass diffs the local open orders against the exchange book, resolves
//! every order that disappeared, and answers each fill with an order on the
//! opposite side of the same level.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use super::calculator::{quantize, GridCalculator, AMOUNT_DECIMALS};
use super::config::{BotConfig, EngineConfig};
use super::errors::{GridError, GridResult};
use super::ladder::{LadderBuilder, PlacementOutcome};
use super::notifier::{Notification, Notifier};
use super::repository::GridRepository;
use super::retry::Clock;
use super::types::{ExchangeOrder, GridOrder, OrderSide};

/// Active bot configs with a time-based expiry
pub struct ConfigCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entry: Option<(DateTime<Utc>, Vec<BotConfig>)>,
}

impl ConfigCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entry: None,
        }
    }

    /// Cached configs, reloaded from the repository once expired
    pub async fn get(&mut self, repository: &dyn GridRepository) -> GridResult<Vec<BotConfig>> {
        let now = self.clock.now();
        if let Some((loaded_at, configs)) = &self.entry {
            if now - *loaded_at < self.ttl {
                return Ok(configs.clone());
            }
        }

        let configs = repository.get_active_configs().await?;
        debug!("Config cache refreshed with {} active bots", configs.len());
        self.entry = Some((now, configs.clone()));
        Ok(configs)
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

/// Counters for one reconciliation pass over one bot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub pair: String,
    pub fills_detected: usize,
    pub complements_placed: usize,
    pub complements_skipped: usize,
    pub trades_recorded: usize,
    pub cancelled_externally: usize,
    /// Disappeared orders whose final state is not known yet
    pub unresolved: usize,
    pub errors: usize,
}

pub struct ReconciliationLoop {
    ladder: Arc<LadderBuilder>,
    repository: Arc<dyn GridRepository>,
    notifier: Notifier,
    settings: EngineConfig,
    cache: Mutex<ConfigCache>,
    /// Last status query per pair and exchange order id
    last_checked: Mutex<HashMap<String, HashMap<String, DateTime<Utc>>>>,
}

impl ReconciliationLoop {
    pub fn new(
        ladder: Arc<LadderBuilder>,
        repository: Arc<dyn GridRepository>,
        notifier: Notifier,
        settings: EngineConfig,
    ) -> Self {
        let cache = ConfigCache::new(ladder.exchange().clock().clone(), settings.config_cache_ttl());
        Self {
            ladder,
            repository,
            notifier,
            settings,
            cache: Mutex::new(cache),
            last_checked: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_configs(&self) -> GridResult<Vec<BotConfig>> {
        self.cache.lock().await.get(self.repository.as_ref()).await
    }

    /// Drop cached configs so the next pass sees status changes immediately
    pub async fn invalidate_cache(&self) {
        self.cache.lock().await.invalidate();
    }

    /// One reconciliation pass for one bot.
    ///
    /// Data integrity and persistence errors abort the pass; placement
    /// failures are counted and the pass continues.
    pub async fn reconcile_bot(&self, config: &BotConfig) -> GridResult<ReconcileReport> {
        let exchange = self.ladder.exchange();
        let clock = exchange.clock().clone();
        let mut report = ReconcileReport {
            pair: config.pair.clone(),
            ..Default::default()
        };

        let current = exchange.get_open_orders(&config.pair).await?;
        let local_open = self.repository.get_open_orders(&config.pair).await?;
        let candidates = self
            .due_for_check(&config.pair, &local_open_ids(&local_open), &current, clock.now())
            .await;
        if candidates.is_empty() {
            return Ok(report);
        }

        let detection = exchange
            .detect_fills_by_comparison(&config.pair, &candidates, &current)
            .await;
        report.unresolved = detection.unresolved.len();

        for id in &detection.cancelled {
            if self.repository.mark_order_cancelled(&config.pair, id).await? {
                warn!("{}: order {} was cancelled outside the engine", config.pair, id);
                report.cancelled_externally += 1;
            }
        }

        let min_value = exchange.get_minimum_order_value(&config.pair).await;
        let calculator = GridCalculator::new(min_value);

        for fill in &detection.filled {
            report.fills_detected += 1;
            match self.process_fill(config, fill, &calculator, &mut report).await {
                Ok(()) => {}
                Err(e @ GridError::DataIntegrity(_)) | Err(e @ GridError::Persistence(_)) => {
                    error!("{}: reconciliation aborted at fill {}: {}", config.pair, fill.id, e);
                    return Err(e);
                }
                Err(e) => {
                    error!("{}: failed to process fill {}: {}", config.pair, fill.id, e);
                    report.errors += 1;
                    self.notifier.notify(Notification::Error {
                        context: format!("reconcile {}", config.pair),
                        message: format!("fill {}: {}", fill.id, e),
                    });
                }
            }
        }

        if let Some(checked) = self.last_checked.lock().await.get_mut(&config.pair) {
            for id in detection.cancelled.iter().chain(detection.filled.iter().map(|o| &o.id)) {
                checked.remove(id);
            }
        }

        if report.fills_detected > 0 {
            info!(
                "{}: {} fills, {} complements placed, {} skipped, {} trades",
                config.pair,
                report.fills_detected,
                report.complements_placed,
                report.complements_skipped,
                report.trades_recorded
            );
        }
        Ok(report)
    }

    /// Ids that left the book and were not queried within the recheck window.
    ///
    /// Entries for orders no longer open locally (closed by a teardown, say)
    /// are dropped first.
    async fn due_for_check(
        &self,
        pair: &str,
        previous: &[String],
        current: &[ExchangeOrder],
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let throttle = self.settings.order_recheck();
        let mut checked = self.last_checked.lock().await;
        let last_checked = checked.entry(pair.to_string()).or_default();
        last_checked.retain(|id, _| previous.contains(id));
        let mut due = Vec::new();

        for id in previous {
            if current.iter().any(|o| &o.id == id) {
                continue;
            }
            if let Some(at) = last_checked.get(id) {
                if now - *at < throttle {
                    continue;
                }
            }
            last_checked.insert(id.clone(), now);
            due.push(id.clone());
        }
        due
    }

    async fn process_fill(
        &self,
        config: &BotConfig,
        fill: &ExchangeOrder,
        calculator: &GridCalculator,
        report: &mut ReconcileReport,
    ) -> GridResult<()> {
        let exchange = self.ladder.exchange();
        let fill_price = fill.fill_price();

        let Some(settled) = self.ladder.settle_fill(config, fill).await? else {
            return Ok(());
        };
        if let Some(trade) = settled.trade {
            report.trades_recorded += 1;
            self.notifier.notify(Notification::TradeCompleted(trade));
        }
        let Some(level) = settled.order.grid_level else {
            info!("{}: ad-hoc order {} filled, no complement", config.pair, fill.id);
            return Ok(());
        };

        let side = fill.side.opposite();
        let price = calculator.complementary_price(fill_price, fill.side, config);
        let fees = exchange.get_trading_fees(&config.pair).await;
        let amount = match fill.side {
            OrderSide::Buy => exchange.calculate_net_amount_after_fees(fill.filled, fill_price, OrderSide::Buy, &fees),
            OrderSide::Sell => {
                let proceeds = fill.filled * fill_price * (1.0 - fees.taker);
                quantize(proceeds / price, AMOUNT_DECIMALS)
            }
        };

        match self.ladder.place_level(config, level, side, amount, price).await? {
            PlacementOutcome::Placed(order) => {
                debug!(
                    "{}: level {} complement {} {:.6} @ {:.4}",
                    config.pair, level, side, order.amount, order.price
                );
                report.complements_placed += 1;
            }
            PlacementOutcome::Skipped(reason) => {
                warn!("{}: level {} complement skipped: {}", config.pair, level, reason);
                report.complements_skipped += 1;
            }
        }
        Ok(())
    }
}

fn local_open_ids(orders: &[GridOrder]) -> Vec<String> {
    orders
        .iter()
        .filter_map(|o| o.exchange_order_id.clone())
        .collect()
}

//! Ladder construction and teardown
//!
//! Used by activation, order re-initialization and trailing-up. A build always
//! starts from a clean book: every exchange order for the pair is cancelled
//! and the local records are settled before new levels are laid out. Orders
//! that filled before the cancel reached them are booked as fills, so their
//! round trips are never lost.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;

use super::calculator::{quantize, quantize_up, GridCalculator, AMOUNT_DECIMALS};
use super::config::{BotConfig, EngineConfig};
use super::errors::{GridError, GridResult};
use super::exchange::ExchangeService;
use super::repository::GridRepository;
use super::retry::{poll_until, Polled, RetryPolicy};
use super::types::{
    BotBalanceView, ExchangeOrder, GridOrder, GridStep, GridTrade, OrderKind, OrderRequest, OrderSide,
    OrderStatus, EPSILON,
};

/// What a ladder build did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LadderReport {
    pub pair: String,
    pub reference_price: f64,
    pub capital: f64,
    /// Exchange id of the market buy that seeded the base position
    pub entry_order_id: Option<String>,
    pub entry_amount: f64,
    pub cancelled_before_build: u32,
    /// Round trips closed by fills found while clearing the old ladder
    pub settled_trades: Vec<GridTrade>,
    pub buys_placed: usize,
    pub sells_placed: usize,
    /// Levels skipped by capital, ceiling or notional checks
    pub skipped: usize,
    /// Levels whose placement failed after retries
    pub failed: usize,
}

impl LadderReport {
    pub fn orders_placed(&self) -> usize {
        self.buys_placed + self.sells_placed
    }
}

/// What clearing a bot's book did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Teardown {
    /// Exchange orders cancelled
    pub cancelled: u32,
    /// Orders that filled before the cancel reached them
    pub fills_settled: usize,
    pub trades: Vec<GridTrade>,
    /// Local records closed without a known final state
    pub closed_unresolved: u32,
}

/// A fill booked against the local records
#[derive(Debug, Clone, PartialEq)]
pub struct SettledFill {
    pub order: GridOrder,
    /// Round trip closed by this fill, if it was a sell after a buy
    pub trade: Option<GridTrade>,
}

/// Result of trying to put one order on the book
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    Placed(GridOrder),
    /// Expected control-flow outcome (capital, ceiling, notional)
    Skipped(String),
}

/// Builds and tears down a bot's order ladder
pub struct LadderBuilder {
    exchange: Arc<ExchangeService>,
    repository: Arc<dyn GridRepository>,
    settings: EngineConfig,
}

impl LadderBuilder {
    pub fn new(exchange: Arc<ExchangeService>, repository: Arc<dyn GridRepository>, settings: EngineConfig) -> Self {
        Self {
            exchange,
            repository,
            settings,
        }
    }

    pub fn exchange(&self) -> &Arc<ExchangeService> {
        &self.exchange
    }

    /// Cancel every exchange order for the pair and settle the local records.
    ///
    /// Each locally open order is resolved by its exchange status: fills are
    /// booked with their round trips (no complement is placed), cancels are
    /// closed, and only orders of unknown state are closed blind.
    pub async fn teardown(&self, config: &BotConfig) -> GridResult<Teardown> {
        let local_ids: Vec<String> = self
            .repository
            .get_open_orders(&config.pair)
            .await?
            .into_iter()
            .filter_map(|o| o.exchange_order_id)
            .collect();

        let mut teardown = Teardown {
            cancelled: self.exchange.cancel_all_orders_for_pair(&config.pair).await?,
            ..Default::default()
        };

        // The book is empty now, every local id gets a status query
        let detection = self
            .exchange
            .detect_fills_by_comparison(&config.pair, &local_ids, &[])
            .await;

        for fill in &detection.filled {
            match self.settle_fill(config, fill).await {
                Ok(Some(settled)) => {
                    teardown.fills_settled += 1;
                    teardown.trades.extend(settled.trade);
                }
                Ok(None) => {}
                Err(e @ GridError::Persistence(_)) => return Err(e),
                Err(e) => error!("{}: fill {} not settled during teardown: {}", config.pair, fill.id, e),
            }
        }
        for id in &detection.cancelled {
            self.repository.mark_order_cancelled(&config.pair, id).await?;
        }

        teardown.closed_unresolved = self.repository.cancel_open_orders(&config.pair).await?;
        if teardown.closed_unresolved > 0 {
            warn!(
                "{}: closed {} local orders with unknown exchange state",
                config.pair, teardown.closed_unresolved
            );
        }
        if teardown.fills_settled > 0 {
            info!(
                "{}: {} fills settled during teardown, {} trades",
                config.pair,
                teardown.fills_settled,
                teardown.trades.len()
            );
        }
        Ok(teardown)
    }

    /// Book one exchange fill: mark the order, advance its step and record
    /// the round trip a sell closes.
    ///
    /// Returns `None` when the fill was booked before.
    pub async fn settle_fill(&self, config: &BotConfig, fill: &ExchangeOrder) -> GridResult<Option<SettledFill>> {
        let now = self.exchange.clock().now();
        let fill_price = fill.fill_price();

        let Some(order) = self.repository.mark_order_filled(&config.pair, &fill.id, now).await? else {
            debug!("{}: fill {} already processed", config.pair, fill.id);
            return Ok(None);
        };
        let Some(level) = order.grid_level else {
            return Ok(Some(SettledFill { order, trade: None }));
        };

        let mut step = self.repository.get_step(&config.pair, level).await?.ok_or_else(|| {
            GridError::DataIntegrity(format!(
                "{}: filled order {} has no step for level {}",
                config.pair, fill.id, level
            ))
        })?;
        let previous_side = step.last_filled_side;
        let previous_fill = step.last_fill_order_id.clone().zip(step.last_fill_price);

        step.record_fill(&fill.id, fill.side, fill_price, now);
        self.repository.save_step(&step).await?;

        let mut trade = None;
        if fill.side == OrderSide::Sell && previous_side == Some(OrderSide::Buy) {
            if let Some((buy_id, buy_price)) = previous_fill {
                let round_trip =
                    GridTrade::from_round_trip(&config.pair, &buy_id, buy_price, &fill.id, fill_price, fill.filled, now);
                self.repository.save_trade(&round_trip).await?;
                info!(
                    "{}: round trip {:.4} -> {:.4}, profit {:.4}",
                    config.pair, round_trip.buy_price, round_trip.sell_price, round_trip.profit
                );
                trade = Some(round_trip);
            }
        }
        Ok(Some(SettledFill { order, trade }))
    }

    /// Build a full ladder around the current price.
    ///
    /// The base position is topped up to half the capital with a market buy,
    /// the other half funds the buy side.
    pub async fn build(&self, config: &BotConfig) -> GridResult<LadderReport> {
        let mut report = LadderReport {
            pair: config.pair.clone(),
            ..Default::default()
        };
        let teardown = self.teardown(config).await?;
        report.cancelled_before_build = teardown.cancelled;
        report.settled_trades = teardown.trades;

        let price = self.exchange.get_current_price(&config.pair).await?;
        report.reference_price = price;

        let view = self.exchange.get_bot_allocated_balance(config).await?;
        let capital = if view.total_available_in_account < config.total_capital {
            warn!(
                "{}: account holds {:.2}, below allocated {:.2}; using what is available",
                config.pair, view.total_available_in_account, config.total_capital
            );
            view.total_available_in_account
        } else {
            config.total_capital
        };
        if capital <= 0.0 {
            return Err(GridError::InsufficientBalance {
                required: config.total_capital,
                available: capital,
            });
        }
        report.capital = capital;

        let min_value = self.exchange.get_minimum_order_value(&config.pair).await;
        let calculator = GridCalculator::new(min_value);
        let half = capital / 2.0;

        let sell_base = self.acquire_base(config, &view, half, price, &mut report).await?;

        let levels = calculator.calculate_grid_levels(price, config);
        let (lower, upper) = calculator.split_levels(&levels, price);
        let now = self.exchange.clock().now();

        let mut steps: Vec<GridStep> = levels
            .iter()
            .enumerate()
            .map(|(i, p)| GridStep::new(&config.pair, i as u32, *p, now))
            .collect();
        if let Some(entry_id) = &report.entry_order_id {
            // Upper levels sell inventory bought by the entry order
            for (index, _) in &upper {
                if let Some(step) = steps.get_mut(*index as usize) {
                    step.record_fill(entry_id, OrderSide::Buy, price, now);
                }
            }
        }
        self.repository.replace_steps(&config.pair, &steps).await?;

        let ladder: Vec<f64> = lower.iter().chain(upper.iter()).map(|(_, p)| *p).collect();

        // Buy side, nearest level first
        let mut attempted: Vec<GridOrder> = Vec::new();
        let mut quote_used = 0.0;
        while let Some(level_price) = calculator.should_create_buy_order(price, &attempted, &ladder) {
            let level = level_index(&lower, level_price);
            let amount = calculator.calculate_order_amount(half, config.grid_levels, level_price);

            if quote_used + amount * level_price > half + EPSILON {
                debug!("{}: buy budget exhausted at level {}", config.pair, level);
                report.skipped += 1;
                attempted.push(placeholder(config, OrderSide::Buy, level_price, now));
                continue;
            }

            match self.place_level(config, level, OrderSide::Buy, amount, level_price).await {
                Ok(PlacementOutcome::Placed(order)) => {
                    quote_used += order.notional();
                    report.buys_placed += 1;
                    attempted.push(order);
                }
                Ok(PlacementOutcome::Skipped(reason)) => {
                    debug!("{}: buy level {} skipped: {}", config.pair, level, reason);
                    report.skipped += 1;
                    attempted.push(placeholder(config, OrderSide::Buy, level_price, now));
                }
                Err(e @ GridError::Persistence(_)) => return Err(e),
                Err(e) => {
                    error!("{}: buy level {} failed: {}", config.pair, level, e);
                    report.failed += 1;
                    attempted.push(placeholder(config, OrderSide::Buy, level_price, now));
                }
            }
        }

        // Sell side, split the available base evenly
        let per_sell = if upper.is_empty() {
            0.0
        } else {
            quantize(sell_base / upper.len() as f64, AMOUNT_DECIMALS)
        };
        let mut attempted: Vec<GridOrder> = Vec::new();
        let mut base_used = 0.0;
        while let Some(level_price) = calculator.should_create_sell_order(price, &attempted, &ladder) {
            let level = level_index(&upper, level_price);

            if per_sell <= 0.0 || base_used + per_sell > sell_base + EPSILON {
                report.skipped += 1;
                attempted.push(placeholder(config, OrderSide::Sell, level_price, now));
                continue;
            }

            match self.place_level(config, level, OrderSide::Sell, per_sell, level_price).await {
                Ok(PlacementOutcome::Placed(order)) => {
                    base_used += order.amount;
                    report.sells_placed += 1;
                    attempted.push(order);
                }
                Ok(PlacementOutcome::Skipped(reason)) => {
                    debug!("{}: sell level {} skipped: {}", config.pair, level, reason);
                    report.skipped += 1;
                    attempted.push(placeholder(config, OrderSide::Sell, level_price, now));
                }
                Err(e @ GridError::Persistence(_)) => return Err(e),
                Err(e) => {
                    error!("{}: sell level {} failed: {}", config.pair, level, e);
                    report.failed += 1;
                    attempted.push(placeholder(config, OrderSide::Sell, level_price, now));
                }
            }
        }

        info!(
            "{}: ladder built at {:.4} with {} buys / {} sells ({} skipped, {} failed)",
            config.pair, price, report.buys_placed, report.sells_placed, report.skipped, report.failed
        );
        Ok(report)
    }

    /// Top the base position up to `target_value` and return the base
    /// available for the sell side.
    async fn acquire_base(
        &self,
        config: &BotConfig,
        view: &BotBalanceView,
        target_value: f64,
        price: f64,
        report: &mut LadderReport,
    ) -> GridResult<f64> {
        let min_value = self.exchange.get_minimum_order_value(&config.pair).await;
        let topup_value = target_value - view.base_value_usdt;
        if topup_value < min_value {
            debug!(
                "{}: existing base worth {:.2} covers the sell side",
                config.pair, view.base_value_usdt
            );
            return Ok(view.base_balance);
        }

        let check = self
            .exchange
            .can_bot_use_capital(config, topup_value, OrderSide::Buy)
            .await?;
        if !check.can_use {
            warn!(
                "{}: cannot fund entry buy of {:.2} {} (available {:.2})",
                config.pair, topup_value, check.currency, check.available
            );
            return Ok(view.base_balance);
        }

        let amount = quantize(topup_value / price, AMOUNT_DECIMALS);
        let request = OrderRequest::market(&config.pair, OrderSide::Buy, amount);
        let filled = self.exchange.place_order(&request).await?;
        let fill_price = filled.fill_price();
        let now = self.exchange.clock().now();

        let mut record = GridOrder::new(&config.pair, OrderSide::Buy, filled.filled, fill_price, None, now)
            .with_exchange_id(&filled.id);
        record.status = OrderStatus::Filled;
        record.filled_at = Some(now);
        self.persist_order(&record).await?;

        report.entry_order_id = Some(filled.id.clone());
        report.entry_amount = filled.filled;

        let fees = self.exchange.get_trading_fees(&config.pair).await;
        let net = self
            .exchange
            .calculate_net_amount_after_fees(filled.filled, fill_price, OrderSide::Buy, &fees);
        let expected = view.base_balance + net;
        info!(
            "{}: entry buy {} @ {:.4}, waiting for {:.6} {}",
            config.pair,
            filled.filled,
            fill_price,
            expected,
            config.base_currency()
        );

        let gateway = self.exchange.gateway().clone();
        let base_currency = config.base_currency().to_string();
        let delays = self.settings.balance_wait_delays();
        let polled = poll_until(
            self.exchange.clock().as_ref(),
            &delays,
            || {
                let gateway = gateway.clone();
                let base_currency = base_currency.clone();
                async move { gateway.get_balance(&base_currency).await }
            },
            |balance| balance.free + 1e-6 >= expected,
        )
        .await;

        match polled {
            Ok(Polled::Ready(balance)) => Ok(balance.free),
            Ok(Polled::Exhausted(balance)) => {
                warn!(
                    "{}: base balance {:.6} never reached {:.6}, sell side disabled",
                    config.pair, balance.free, expected
                );
                Ok(0.0)
            }
            Err(e) => {
                warn!("{}: base balance unavailable, sell side disabled: {}", config.pair, e);
                Ok(0.0)
            }
        }
    }

    /// Check and place one ladder level
    pub async fn place_level(
        &self,
        config: &BotConfig,
        level: u32,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> GridResult<PlacementOutcome> {
        let open = self.repository.get_open_orders(&config.pair).await?.len();
        if open >= config.grid_levels as usize {
            return Ok(PlacementOutcome::Skipped(format!(
                "open order ceiling reached ({}/{})",
                open, config.grid_levels
            )));
        }

        let mut amount = amount;
        let validation = self
            .exchange
            .validate_order_after_fees(&config.pair, amount, price, side, OrderKind::Limit)
            .await;
        if !validation.valid {
            let raised = quantize_up(validation.min_required / price, AMOUNT_DECIMALS);
            debug!(
                "{}: level {} {} raised from {:.6} to {:.6} to clear minimum {:.4}",
                config.pair, level, side, amount, raised, validation.min_required
            );
            amount = raised;
        }

        let spend = match side {
            OrderSide::Buy => amount * price,
            OrderSide::Sell => amount,
        };
        let check = self.exchange.can_bot_use_capital(config, spend, side).await?;
        if !check.can_use {
            return Ok(PlacementOutcome::Skipped(format!(
                "needs {:.6} {}, bot has {:.6}",
                spend, check.currency, check.available
            )));
        }

        let order = self.place_tracked_order(config, Some(level), side, amount, price).await?;
        Ok(PlacementOutcome::Placed(order))
    }

    /// Place a limit order and persist it together with its step.
    ///
    /// If the local record cannot be written the exchange order is cancelled,
    /// so a live order is never left untracked.
    pub async fn place_tracked_order(
        &self,
        config: &BotConfig,
        level: Option<u32>,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> GridResult<GridOrder> {
        let request = OrderRequest::limit(&config.pair, side, amount, price);
        let placed = self.exchange.place_order(&request).await?;
        let now = self.exchange.clock().now();
        let order = GridOrder::new(&config.pair, side, amount, price, level, now).with_exchange_id(&placed.id);

        if let Err(e) = self.persist_order(&order).await {
            error!(
                "{}: order {} placed but not recorded, cancelling it: {}",
                config.pair, placed.id, e
            );
            if let Err(cancel_err) = self.exchange.cancel_order(&config.pair, &placed.id).await {
                error!(
                    "{}: untracked order {} could not be cancelled: {}",
                    config.pair, placed.id, cancel_err
                );
            }
            return Err(e);
        }

        if let Some(level) = level {
            let mut step = self
                .repository
                .get_step(&config.pair, level)
                .await?
                .unwrap_or_else(|| GridStep::new(&config.pair, level, price, now));
            step.activate(&placed.id, side, now);
            self.repository.save_step(&step).await?;
        }

        Ok(order)
    }

    async fn persist_order(&self, order: &GridOrder) -> GridResult<()> {
        let policy = RetryPolicy::new(self.settings.write_max_attempts, self.settings.write_base_delay_ms);
        let repository = self.repository.clone();
        policy
            .run(self.exchange.clock().as_ref(), "persist order", || {
                let repository = repository.clone();
                async move { repository.save_order(order).await }
            })
            .await
            .map_err(|e| GridError::Persistence(e.to_string()))
    }
}

fn level_index(levels: &[(u32, f64)], price: f64) -> u32 {
    levels
        .iter()
        .find(|(_, p)| (*p - price).abs() <= EPSILON.max(price.abs() * 1e-9))
        .map(|(i, _)| *i)
        .unwrap_or_default()
}

/// Marks a level as attempted without placing anything
fn placeholder(config: &BotConfig, side: OrderSide, price: f64, now: chrono::DateTime<chrono::Utc>) -> GridOrder {
    GridOrder::new(&config.pair, side, 0.0, price, None, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::exchange::ExchangeGateway;
    use crate::grid::paper::PaperExchange;
    use crate::grid::repository::LocalRepository;
    use crate::grid::retry::ManualClock;
    use crate::grid::types::FeeSchedule;

    struct Fixture {
        exchange: Arc<PaperExchange>,
        repository: Arc<LocalRepository>,
        builder: LadderBuilder,
    }

    fn fixture(quote: f64, base: f64) -> Fixture {
        let exchange = Arc::new(
            PaperExchange::new(FeeSchedule::default(), 10.0)
                .with_balance("USDT", quote)
                .with_balance("ETH", base)
                .with_price("ETH/USDT", 1000.0),
        );
        let repository = Arc::new(LocalRepository::in_memory());
        let service = Arc::new(ExchangeService::new(exchange.clone(), Arc::new(ManualClock::default())));
        let builder = LadderBuilder::new(service, repository.clone(), EngineConfig::default().without_delays());
        Fixture {
            exchange,
            repository,
            builder,
        }
    }

    fn bot() -> BotConfig {
        BotConfig::new("ETH/USDT", 1000.0).with_grid(10, 10.0)
    }

    #[tokio::test]
    async fn test_build_full_ladder() {
        let f = fixture(2000.0, 0.0);
        let report = f.builder.build(&bot()).await.unwrap();

        assert!(report.entry_order_id.is_some());
        assert!((report.entry_amount - 0.5).abs() < 1e-9);
        assert_eq!(report.buys_placed, 5);
        assert_eq!(report.sells_placed, 5);
        assert_eq!(report.failed, 0);

        let open = f.exchange.get_open_orders("ETH/USDT").await.unwrap();
        assert_eq!(open.len(), 10);
        assert!(open.iter().filter(|o| o.side == OrderSide::Buy).all(|o| o.price < 1000.0));
        assert!(open.iter().filter(|o| o.side == OrderSide::Sell).all(|o| o.price > 1000.0));

        // Buy side spends at most half of the allocation
        let buy_value: f64 = open
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.amount * o.price)
            .sum();
        assert!(buy_value <= 500.0 + 1e-6);

        assert_eq!(f.repository.get_open_orders("ETH/USDT").await.unwrap().len(), 10);
        let steps = f.repository.get_steps("ETH/USDT").await.unwrap();
        assert_eq!(steps.len(), 10);
        assert_eq!(steps.iter().filter(|s| s.active_order_id.is_some()).count(), 10);
        // Upper steps are seeded with the entry buy
        assert!(steps[5..].iter().all(|s| s.last_filled_side == Some(OrderSide::Buy)));
        assert!(steps[..5].iter().all(|s| s.last_filled_side.is_none()));
    }

    #[tokio::test]
    async fn test_build_reuses_existing_base() {
        // 0.6 ETH already worth more than half the capital
        let f = fixture(2000.0, 0.6);
        let report = f.builder.build(&bot()).await.unwrap();

        assert!(report.entry_order_id.is_none());
        assert_eq!(report.sells_placed, 5);
        assert!(f.exchange.balance("ETH").await.free < 1e-6);
    }

    #[tokio::test]
    async fn test_build_tears_down_previous_ladder() {
        let f = fixture(5000.0, 0.0);
        f.builder.build(&bot()).await.unwrap();
        let second = f.builder.build(&bot()).await.unwrap();

        assert_eq!(second.cancelled_before_build, 10);
        assert_eq!(f.exchange.open_order_count("ETH/USDT").await, 10);
        assert_eq!(f.repository.get_open_orders("ETH/USDT").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_teardown_settles_fills_before_closing() {
        let f = fixture(2000.0, 0.0);
        let config = bot();
        f.builder.build(&config).await.unwrap();

        // Nearest buy and first upper sell both fill, nobody reconciles them
        f.exchange.set_price("ETH/USDT", 994.0).await;
        f.exchange.set_price("ETH/USDT", 1006.0).await;

        let teardown = f.builder.teardown(&config).await.unwrap();
        assert_eq!(teardown.cancelled, 8);
        assert_eq!(teardown.fills_settled, 2);
        assert_eq!(teardown.closed_unresolved, 0);
        assert_eq!(teardown.trades.len(), 1);
        assert!((teardown.trades[0].buy_price - 1000.0).abs() < 1e-9);
        assert_eq!(f.repository.get_trades(None).await.unwrap().len(), 1);

        let orders = f.repository.get_orders("ETH/USDT").await.unwrap();
        let limits = orders.iter().filter(|o| o.grid_level.is_some());
        assert_eq!(limits.clone().filter(|o| o.status == OrderStatus::Filled).count(), 2);
        assert_eq!(limits.filter(|o| o.status == OrderStatus::Cancelled).count(), 8);

        // Buy fill advanced its step without a complement
        let step = f.repository.get_step("ETH/USDT", 4).await.unwrap().unwrap();
        assert_eq!(step.last_filled_side, Some(OrderSide::Buy));
        assert_eq!(f.exchange.open_order_count("ETH/USDT").await, 0);
    }

    #[tokio::test]
    async fn test_settle_fill_is_idempotent() {
        let f = fixture(2000.0, 0.0);
        let config = bot();
        f.builder.build(&config).await.unwrap();
        let fills = f.exchange.set_price("ETH/USDT", 1006.0).await;
        assert_eq!(fills.len(), 1);

        let first = f.builder.settle_fill(&config, &fills[0]).await.unwrap().unwrap();
        assert!(first.trade.is_some());
        assert!(f.builder.settle_fill(&config, &fills[0]).await.unwrap().is_none());
        assert_eq!(f.repository.get_trades(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_build_caps_capital_to_account() {
        // Allocation 1000, account only holds 300
        let f = fixture(300.0, 0.0);
        let report = f.builder.build(&bot()).await.unwrap();

        assert!((report.capital - 300.0).abs() < 1e-9);
        let open = f.exchange.get_open_orders("ETH/USDT").await.unwrap();
        let buy_value: f64 = open
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.amount * o.price)
            .sum();
        assert!(buy_value <= 150.0 + 1e-6);
    }

    #[tokio::test]
    async fn test_persist_failure_cancels_exchange_order() {
        let f = fixture(2000.0, 0.0);
        let config = bot();
        f.repository.fail_next_writes(3);

        let result = f
            .builder
            .place_tracked_order(&config, Some(2), OrderSide::Buy, 0.1, 970.0)
            .await;

        assert!(matches!(result, Err(GridError::Persistence(_))));
        assert_eq!(f.exchange.open_order_count("ETH/USDT").await, 0);
        assert!(f.repository.get_orders("ETH/USDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_place_level_respects_ceiling() {
        let f = fixture(5000.0, 0.0);
        let config = BotConfig::new("ETH/USDT", 1000.0).with_grid(2, 10.0);
        for price in [960.0, 970.0] {
            f.builder
                .place_tracked_order(&config, None, OrderSide::Buy, 0.05, price)
                .await
                .unwrap();
        }

        let outcome = f
            .builder
            .place_level(&config, 0, OrderSide::Buy, 0.05, 950.0)
            .await
            .unwrap();
        assert!(matches!(outcome, PlacementOutcome::Skipped(_)));
        assert_eq!(f.exchange.open_order_count("ETH/USDT").await, 2);
    }

    #[tokio::test]
    async fn test_place_level_raises_amount_to_minimum() {
        let f = fixture(5000.0, 0.0);
        let outcome = f
            .builder
            .place_level(&bot(), 3, OrderSide::Buy, 0.001, 980.0)
            .await
            .unwrap();

        match outcome {
            PlacementOutcome::Placed(order) => assert!(order.amount * order.price >= 10.0),
            other => panic!("expected placement, got {:?}", other),
        }
    }
}

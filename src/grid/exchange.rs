//! Exchange abstraction - raw gateway trait plus the bot-scoped service on top

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};

use super::calculator::{quantize, AMOUNT_DECIMALS};
use super::capital;
use super::config::BotConfig;
use super::errors::{GridError, GridResult};
use super::retry::{Clock, RetryPolicy};
use super::types::{
    Balance, BotBalanceView, CapitalCheckResult, ExchangeOrder, ExchangeOrderStatus, FeeSchedule, OrderKind,
    OrderRequest, OrderSide, OrderValidation,
};

/// Fallback minimum order notional when the exchange does not report one
pub const DEFAULT_MIN_ORDER_VALUE: f64 = 10.0;

/// Exchange operations trait - implemented by live adapters and the paper exchange
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Short name used in logs and status
    fn name(&self) -> &str;

    /// Last traded price for a pair
    async fn get_price(&self, pair: &str) -> GridResult<f64>;

    /// Free/locked balance of a currency
    async fn get_balance(&self, currency: &str) -> GridResult<Balance>;

    async fn place_order(&self, request: &OrderRequest) -> GridResult<ExchangeOrder>;

    /// Cancel an order; `Ok(false)` if it was no longer open
    async fn cancel_order(&self, pair: &str, order_id: &str) -> GridResult<bool>;

    async fn get_open_orders(&self, pair: &str) -> GridResult<Vec<ExchangeOrder>>;

    async fn get_order(&self, pair: &str, order_id: &str) -> GridResult<ExchangeOrder>;

    async fn get_trading_fees(&self, pair: &str) -> GridResult<FeeSchedule>;

    /// Minimum order notional in quote currency
    async fn get_minimum_order_value(&self, pair: &str) -> GridResult<f64>;
}

/// Orders that disappeared from the open set, classified by their final status
#[derive(Debug, Default, Clone)]
pub struct FillDetection {
    pub filled: Vec<ExchangeOrder>,
    pub cancelled: Vec<String>,
    /// Still reported open, or the status query failed
    pub unresolved: Vec<String>,
}

/// Bot-scoped exchange service: retries, capital isolation and fee checks
pub struct ExchangeService {
    gateway: Arc<dyn ExchangeGateway>,
    clock: Arc<dyn Clock>,
    write_policy: RetryPolicy,
    sell_policy: RetryPolicy,
}

impl ExchangeService {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, clock: Arc<dyn Clock>) -> Self {
        Self {
            gateway,
            clock,
            write_policy: RetryPolicy::default(),
            sell_policy: RetryPolicy::default(),
        }
    }

    /// Builder: retry policies for order writes and position liquidation
    pub fn with_retry(mut self, write_policy: RetryPolicy, sell_policy: RetryPolicy) -> Self {
        self.write_policy = write_policy;
        self.sell_policy = sell_policy;
        self
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn get_current_price(&self, pair: &str) -> GridResult<f64> {
        let price = self.gateway.get_price(pair).await?;
        if price <= 0.0 {
            return Err(GridError::Exchange(format!("invalid price {} for {}", price, pair)));
        }
        Ok(price)
    }

    pub async fn get_trading_fees(&self, pair: &str) -> FeeSchedule {
        match self.gateway.get_trading_fees(pair).await {
            Ok(fees) => fees,
            Err(e) => {
                warn!("Fee schedule unavailable for {}, using defaults: {}", pair, e);
                FeeSchedule::default()
            }
        }
    }

    pub async fn get_minimum_order_value(&self, pair: &str) -> f64 {
        match self.gateway.get_minimum_order_value(pair).await {
            Ok(v) if v > 0.0 => v,
            Ok(_) => DEFAULT_MIN_ORDER_VALUE,
            Err(e) => {
                warn!("Minimum order value unavailable for {}, using {}: {}", pair, DEFAULT_MIN_ORDER_VALUE, e);
                DEFAULT_MIN_ORDER_VALUE
            }
        }
    }

    /// Live capital view for one bot
    pub async fn get_bot_allocated_balance(&self, config: &BotConfig) -> GridResult<BotBalanceView> {
        let price = self.get_current_price(&config.pair).await?;
        let base = self.gateway.get_balance(config.base_currency()).await?;
        let quote = self.gateway.get_balance(config.quote_currency()).await?;
        let view = capital::bot_balance_view(config, base, quote, price);
        debug!(
            "{} view: quote {:.4}, base {:.6}, total {:.2} (account {:.2})",
            config.pair, view.quote_balance, view.base_balance, view.total_value_usdt, view.total_available_in_account
        );
        Ok(view)
    }

    /// Check a spend against the bot's view (`amount` is quote for buys, base for sells)
    pub async fn can_bot_use_capital(
        &self,
        config: &BotConfig,
        amount: f64,
        side: OrderSide,
    ) -> GridResult<CapitalCheckResult> {
        let view = self.get_bot_allocated_balance(config).await?;
        let result = capital::check_capital(config, &view, amount, side);
        if !result.can_use {
            debug!(
                "{}: {} {:.6} {} denied, only {:.6} available",
                config.pair, side, amount, result.currency, result.available
            );
        }
        Ok(result)
    }

    pub fn calculate_net_amount_after_fees(&self, amount: f64, price: f64, side: OrderSide, fees: &FeeSchedule) -> f64 {
        capital::net_amount_after_fees(amount, price, side, fees.taker)
    }

    /// Fee-aware minimum notional check for an order
    pub async fn validate_order_after_fees(
        &self,
        pair: &str,
        amount: f64,
        price: f64,
        side: OrderSide,
        kind: OrderKind,
    ) -> OrderValidation {
        let fees = self.get_trading_fees(pair).await;
        let min_value = self.get_minimum_order_value(pair).await;
        let fee_rate = match kind {
            OrderKind::Limit => fees.maker,
            OrderKind::Market => fees.taker,
        };
        capital::validate_order_after_fees(amount, price, side, fee_rate, min_value)
    }

    /// Place an order with bounded retry
    pub async fn place_order(&self, request: &OrderRequest) -> GridResult<ExchangeOrder> {
        let gateway = self.gateway.clone();
        let label = format!("{} {} {}", request.pair, request.side, request.amount);
        let order = self
            .write_policy
            .run(self.clock.as_ref(), &format!("place {}", label), || {
                let gateway = gateway.clone();
                async move { gateway.place_order(request).await }
            })
            .await?;
        info!(
            "Placed {:?} {} {} {} @ {:.6} (id {})",
            request.kind, request.side, request.pair, request.amount, request.price, order.id
        );
        Ok(order)
    }

    /// Cancel an order with bounded retry
    pub async fn cancel_order(&self, pair: &str, order_id: &str) -> GridResult<bool> {
        let gateway = self.gateway.clone();
        self.write_policy
            .run(self.clock.as_ref(), &format!("cancel {}", order_id), || {
                let gateway = gateway.clone();
                async move { gateway.cancel_order(pair, order_id).await }
            })
            .await
    }

    pub async fn get_open_orders(&self, pair: &str) -> GridResult<Vec<ExchangeOrder>> {
        self.gateway.get_open_orders(pair).await
    }

    pub async fn get_order(&self, pair: &str, order_id: &str) -> GridResult<ExchangeOrder> {
        self.gateway.get_order(pair, order_id).await
    }

    /// Cancel every open exchange order for a pair.
    ///
    /// Every cancel is attempted; an error is returned afterwards if any
    /// failed so callers never assume a clean book.
    pub async fn cancel_all_orders_for_pair(&self, pair: &str) -> GridResult<u32> {
        let open = self.get_open_orders(pair).await?;
        let mut cancelled = 0u32;
        let mut failures = Vec::new();

        for order in &open {
            match self.cancel_order(pair, &order.id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => debug!("Order {} already closed", order.id),
                Err(e) => {
                    error!("Failed to cancel {} on {}: {}", order.id, pair, e);
                    failures.push(order.id.clone());
                }
            }
        }

        if !failures.is_empty() {
            return Err(GridError::Exchange(format!(
                "{} of {} cancels failed for {}",
                failures.len(),
                open.len(),
                pair
            )));
        }

        info!("Cancelled {} open orders for {}", cancelled, pair);
        Ok(cancelled)
    }

    /// Detect fills by diffing the previously open ids against the current book.
    ///
    /// Every id that disappeared is queried once; only closed orders with a
    /// non-zero filled quantity count as fills.
    pub async fn detect_fills_by_comparison(
        &self,
        pair: &str,
        previous_ids: &[String],
        current: &[ExchangeOrder],
    ) -> FillDetection {
        let still_open: HashSet<&str> = current.iter().map(|o| o.id.as_str()).collect();
        let mut detection = FillDetection::default();

        for id in previous_ids.iter().filter(|id| !still_open.contains(id.as_str())) {
            match self.get_order(pair, id).await {
                Ok(order) if order.is_filled() => detection.filled.push(order),
                Ok(order) if order.status == ExchangeOrderStatus::Cancelled => {
                    detection.cancelled.push(id.clone())
                }
                Ok(_) => detection.unresolved.push(id.clone()),
                Err(e) => {
                    warn!("Could not query order {} on {}: {}", id, pair, e);
                    detection.unresolved.push(id.clone());
                }
            }
        }

        detection
    }

    /// Market-sell the bot's whole free base balance.
    ///
    /// Returns `None` when the position is below the minimum notional.
    pub async fn sell_position_with_retry(&self, config: &BotConfig) -> GridResult<Option<ExchangeOrder>> {
        let price = self.get_current_price(&config.pair).await?;
        let base = self.gateway.get_balance(config.base_currency()).await?;
        let amount = quantize(base.free, AMOUNT_DECIMALS);
        let min_value = self.get_minimum_order_value(&config.pair).await;

        if amount <= 0.0 || amount * price < min_value {
            info!(
                "{}: position {:.6} below minimum notional, nothing to sell",
                config.pair, amount
            );
            return Ok(None);
        }

        let request = OrderRequest::market(&config.pair, OrderSide::Sell, amount);
        let gateway = self.gateway.clone();
        let order = self
            .sell_policy
            .run(self.clock.as_ref(), &format!("sell position {}", config.pair), || {
                let gateway = gateway.clone();
                let request = request.clone();
                async move { gateway.place_order(&request).await }
            })
            .await?;

        info!("Sold {} {} at market (id {})", amount, config.base_currency(), order.id);
        Ok(Some(order))
    }
}

//! Paper exchange - simulates order execution locally
//!
//! Balances are tracked as free/locked per currency. Limit orders rest until
//! [`PaperExchange::set_price`] crosses them; market orders fill immediately at
//! the current price. Fees are deducted from the asset received.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::errors::{GridError, GridResult};
use super::exchange::ExchangeGateway;
use super::types::{
    split_pair, Balance, ExchangeOrder, ExchangeOrderStatus, FeeSchedule, OrderKind, OrderRequest, OrderSide,
    EPSILON,
};

#[derive(Debug, Default)]
struct PaperBook {
    prices: HashMap<String, f64>,
    balances: HashMap<String, Balance>,
    /// Every order ever placed, by id
    orders: HashMap<String, ExchangeOrder>,
}

impl PaperBook {
    fn balance_mut(&mut self, currency: &str) -> &mut Balance {
        self.balances.entry(currency.to_string()).or_default()
    }

    fn price(&self, pair: &str) -> GridResult<f64> {
        self.prices
            .get(pair)
            .copied()
            .ok_or_else(|| GridError::Exchange(format!("no price for {}", pair)))
    }

    fn lock_funds(&mut self, currency: &str, amount: f64) -> GridResult<()> {
        let balance = self.balance_mut(currency);
        if balance.free + EPSILON < amount {
            return Err(GridError::InsufficientBalance {
                required: amount,
                available: balance.free,
            });
        }
        balance.free = (balance.free - amount).max(0.0);
        balance.locked += amount;
        Ok(())
    }

    fn release_funds(&mut self, currency: &str, amount: f64) {
        let balance = self.balance_mut(currency);
        balance.locked = (balance.locked - amount).max(0.0);
        balance.free += amount;
    }

    fn spend_locked(&mut self, currency: &str, amount: f64) {
        let balance = self.balance_mut(currency);
        balance.locked = (balance.locked - amount).max(0.0);
    }

    fn credit(&mut self, currency: &str, amount: f64) {
        self.balance_mut(currency).free += amount;
    }

    /// Settle a resting limit order at its limit price
    fn settle_limit(&mut self, order_id: &str, fee_rate: f64) -> Option<ExchangeOrder> {
        let order = self.orders.get(order_id)?.clone();
        if order.status != ExchangeOrderStatus::Open {
            return None;
        }

        let (base, quote) = split_pair(&order.pair);
        let (base, quote) = (base.to_string(), quote.to_string());
        match order.side {
            OrderSide::Buy => {
                self.spend_locked(&quote, order.amount * order.price);
                self.credit(&base, order.amount * (1.0 - fee_rate));
            }
            OrderSide::Sell => {
                self.spend_locked(&base, order.amount);
                self.credit(&quote, order.amount * order.price * (1.0 - fee_rate));
            }
        }

        let stored = self.orders.get_mut(order_id)?;
        stored.status = ExchangeOrderStatus::Closed;
        stored.filled = stored.amount;
        stored.average_price = stored.price;
        Some(stored.clone())
    }
}

/// Simulated exchange for paper trading and tests
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    fees: FeeSchedule,
    min_order_value: f64,
    /// Number of upcoming writes that fail with a transient error
    failing_writes: AtomicU32,
    /// Number of upcoming open-order reads that return an empty book
    stale_reads: AtomicU32,
}

impl PaperExchange {
    pub fn new(fees: FeeSchedule, min_order_value: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            fees,
            min_order_value,
            failing_writes: AtomicU32::new(0),
            stale_reads: AtomicU32::new(0),
        }
    }

    /// Builder: seed a free balance
    pub fn with_balance(mut self, currency: &str, amount: f64) -> Self {
        self.book.get_mut().balance_mut(currency).free = amount;
        self
    }

    /// Builder: seed a price
    pub fn with_price(mut self, pair: &str, price: f64) -> Self {
        self.book.get_mut().prices.insert(pair.to_string(), price);
        self
    }

    /// Update a price and fill every resting order it crosses.
    ///
    /// Buys fill when price <= limit, sells when price >= limit.
    pub async fn set_price(&self, pair: &str, price: f64) -> Vec<ExchangeOrder> {
        let mut book = self.book.lock().await;
        book.prices.insert(pair.to_string(), price);

        let crossed: Vec<String> = book
            .orders
            .values()
            .filter(|o| o.pair == pair && o.status == ExchangeOrderStatus::Open && o.kind == OrderKind::Limit)
            .filter(|o| match o.side {
                OrderSide::Buy => price <= o.price,
                OrderSide::Sell => price >= o.price,
            })
            .map(|o| o.id.clone())
            .collect();

        let fills: Vec<ExchangeOrder> = crossed
            .iter()
            .filter_map(|id| book.settle_limit(id, self.fees.maker))
            .collect();

        if !fills.is_empty() {
            debug!("Paper {} @ {}: {} orders filled", pair, price, fills.len());
        }
        fills
    }

    /// Fill a resting order at its limit price regardless of market price
    pub async fn fill_order(&self, order_id: &str) -> GridResult<ExchangeOrder> {
        let mut book = self.book.lock().await;
        book.settle_limit(order_id, self.fees.maker)
            .ok_or_else(|| GridError::OrderNotFound(order_id.to_string()))
    }

    pub async fn set_balance(&self, currency: &str, free: f64) {
        self.book.lock().await.balance_mut(currency).free = free;
    }

    pub async fn balance(&self, currency: &str) -> Balance {
        self.book
            .lock()
            .await
            .balances
            .get(currency)
            .copied()
            .unwrap_or_default()
    }

    pub async fn open_order_count(&self, pair: &str) -> usize {
        self.book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.pair == pair && o.status == ExchangeOrderStatus::Open)
            .count()
    }

    /// All orders ever placed for a pair
    pub async fn orders(&self, pair: &str) -> Vec<ExchangeOrder> {
        self.book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.pair == pair)
            .cloned()
            .collect()
    }

    /// Make the next `n` writes fail with a transient error
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` open-order reads return an empty book
    pub fn stale_next_reads(&self, n: u32) {
        self.stale_reads.store(n, Ordering::SeqCst);
    }

    fn take_token(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_price(&self, pair: &str) -> GridResult<f64> {
        self.book.lock().await.price(pair)
    }

    async fn get_balance(&self, currency: &str) -> GridResult<Balance> {
        Ok(self.balance(currency).await)
    }

    async fn place_order(&self, request: &OrderRequest) -> GridResult<ExchangeOrder> {
        if Self::take_token(&self.failing_writes) {
            return Err(GridError::Exchange("paper: simulated timeout".into()));
        }
        if request.amount <= 0.0 {
            return Err(GridError::OrderRejected("amount must be positive".into()));
        }

        let mut book = self.book.lock().await;
        let market_price = book.price(&request.pair)?;
        let (base, quote) = split_pair(&request.pair);
        let (base, quote) = (base.to_string(), quote.to_string());

        let exec_price = match request.kind {
            OrderKind::Limit => request.price,
            OrderKind::Market => market_price,
        };
        if exec_price <= 0.0 {
            return Err(GridError::OrderRejected("price must be positive".into()));
        }
        let notional = request.amount * exec_price;
        if notional + EPSILON < self.min_order_value {
            return Err(GridError::OrderRejected(format!(
                "notional {:.4} under minimum {:.4}",
                notional, self.min_order_value
            )));
        }

        let mut order = ExchangeOrder {
            id: Uuid::new_v4().to_string(),
            pair: request.pair.clone(),
            side: request.side,
            kind: request.kind,
            price: exec_price,
            amount: request.amount,
            filled: 0.0,
            average_price: 0.0,
            status: ExchangeOrderStatus::Open,
        };

        match (request.kind, request.side) {
            (OrderKind::Limit, OrderSide::Buy) => book.lock_funds(&quote, notional)?,
            (OrderKind::Limit, OrderSide::Sell) => book.lock_funds(&base, request.amount)?,
            (OrderKind::Market, OrderSide::Buy) => {
                book.lock_funds(&quote, notional)?;
                book.spend_locked(&quote, notional);
                book.credit(&base, request.amount * (1.0 - self.fees.taker));
            }
            (OrderKind::Market, OrderSide::Sell) => {
                book.lock_funds(&base, request.amount)?;
                book.spend_locked(&base, request.amount);
                book.credit(&quote, notional * (1.0 - self.fees.taker));
            }
        }

        if request.kind == OrderKind::Market {
            order.status = ExchangeOrderStatus::Closed;
            order.filled = order.amount;
            order.average_price = exec_price;
            info!("Paper market {} {} {} @ {}", order.side, order.amount, order.pair, exec_price);
        }

        book.orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, pair: &str, order_id: &str) -> GridResult<bool> {
        if Self::take_token(&self.failing_writes) {
            return Err(GridError::Exchange("paper: simulated timeout".into()));
        }

        let mut book = self.book.lock().await;
        let Some(order) = book.orders.get(order_id).cloned() else {
            return Err(GridError::OrderNotFound(order_id.to_string()));
        };
        if order.pair != pair || order.status != ExchangeOrderStatus::Open {
            return Ok(false);
        }

        let (base, quote) = split_pair(pair);
        let (base, quote) = (base.to_string(), quote.to_string());
        match order.side {
            OrderSide::Buy => book.release_funds(&quote, order.amount * order.price),
            OrderSide::Sell => book.release_funds(&base, order.amount),
        }
        if let Some(stored) = book.orders.get_mut(order_id) {
            stored.status = ExchangeOrderStatus::Cancelled;
        }
        Ok(true)
    }

    async fn get_open_orders(&self, pair: &str) -> GridResult<Vec<ExchangeOrder>> {
        if Self::take_token(&self.stale_reads) {
            return Ok(Vec::new());
        }
        Ok(self
            .book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.pair == pair && o.status == ExchangeOrderStatus::Open)
            .cloned()
            .collect())
    }

    async fn get_order(&self, _pair: &str, order_id: &str) -> GridResult<ExchangeOrder> {
        self.book
            .lock()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| GridError::OrderNotFound(order_id.to_string()))
    }

    async fn get_trading_fees(&self, _pair: &str) -> GridResult<FeeSchedule> {
        Ok(self.fees)
    }

    async fn get_minimum_order_value(&self, _pair: &str) -> GridResult<f64> {
        Ok(self.min_order_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> PaperExchange {
        PaperExchange::new(FeeSchedule::default(), 10.0)
            .with_balance("USDT", 1000.0)
            .with_balance("ETH", 1.0)
            .with_price("ETH/USDT", 1000.0)
    }

    #[tokio::test]
    async fn test_limit_buy_locks_and_fills() {
        let ex = exchange();
        let order = ex
            .place_order(&OrderRequest::limit("ETH/USDT", OrderSide::Buy, 0.1, 950.0))
            .await
            .unwrap();

        let usdt = ex.balance("USDT").await;
        assert!((usdt.free - 905.0).abs() < 1e-9);
        assert!((usdt.locked - 95.0).abs() < 1e-9);

        // Not crossed yet
        assert!(ex.set_price("ETH/USDT", 960.0).await.is_empty());

        let fills = ex.set_price("ETH/USDT", 949.0).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].id, order.id);
        assert!((fills[0].fill_price() - 950.0).abs() < 1e-9);

        let eth = ex.balance("ETH").await;
        assert!((eth.free - (1.0 + 0.1 * 0.999)).abs() < 1e-9);
        assert!(ex.balance("USDT").await.locked.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancel_releases_funds() {
        let ex = exchange();
        let order = ex
            .place_order(&OrderRequest::limit("ETH/USDT", OrderSide::Sell, 0.5, 1100.0))
            .await
            .unwrap();
        assert!((ex.balance("ETH").await.free - 0.5).abs() < 1e-9);

        assert!(ex.cancel_order("ETH/USDT", &order.id).await.unwrap());
        assert!((ex.balance("ETH").await.free - 1.0).abs() < 1e-9);
        assert!(!ex.cancel_order("ETH/USDT", &order.id).await.unwrap());

        let stored = ex.get_order("ETH/USDT", &order.id).await.unwrap();
        assert_eq!(stored.status, ExchangeOrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_market_buy_pays_taker_fee() {
        let ex = exchange();
        let order = ex
            .place_order(&OrderRequest::market("ETH/USDT", OrderSide::Buy, 0.2))
            .await
            .unwrap();

        assert!(order.is_filled());
        assert!((ex.balance("USDT").await.free - 800.0).abs() < 1e-9);
        assert!((ex.balance("ETH").await.free - (1.0 + 0.2 * 0.999)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejects_under_minimum_and_overspend() {
        let ex = exchange();
        let small = ex
            .place_order(&OrderRequest::limit("ETH/USDT", OrderSide::Buy, 0.005, 1000.0))
            .await;
        assert!(matches!(small, Err(GridError::OrderRejected(_))));

        let huge = ex
            .place_order(&OrderRequest::limit("ETH/USDT", OrderSide::Buy, 5.0, 1000.0))
            .await;
        assert!(matches!(huge, Err(GridError::InsufficientBalance { .. })));
    }

    #[tokio::test]
    async fn test_stale_reads_hide_orders() {
        let ex = exchange();
        ex.place_order(&OrderRequest::limit("ETH/USDT", OrderSide::Buy, 0.1, 900.0))
            .await
            .unwrap();

        ex.stale_next_reads(1);
        assert!(ex.get_open_orders("ETH/USDT").await.unwrap().is_empty());
        assert_eq!(ex.get_open_orders("ETH/USDT").await.unwrap().len(), 1);
    }
}

//! Core data types for the grid engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tolerance used when comparing prices and amounts
pub const EPSILON: f64 = 1e-9;

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local lifecycle of a grid order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

/// Order type sent to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

/// Upstream directive for a bot.
///
/// Tokens are produced by an external decision process, so unknown values are
/// kept verbatim and treated as non-affirmative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Decision {
    /// `OPERAR_GRID`: the bot should be trading
    Operate,
    /// `PAUSAR_GRID`: the bot should hold its position without orders
    Pause,
    /// `STOP_LOSS_ACTIVATED`: written by the risk manager after liquidation
    StopLoss,
    Other(String),
}

impl Decision {
    pub const OPERATE_TOKEN: &'static str = "OPERAR_GRID";
    pub const PAUSE_TOKEN: &'static str = "PAUSAR_GRID";
    pub const STOP_LOSS_TOKEN: &'static str = "STOP_LOSS_ACTIVATED";

    pub fn as_token(&self) -> &str {
        match self {
            Decision::Operate => Self::OPERATE_TOKEN,
            Decision::Pause => Self::PAUSE_TOKEN,
            Decision::StopLoss => Self::STOP_LOSS_TOKEN,
            Decision::Other(token) => token.as_str(),
        }
    }

    /// Whether the directive asks for an active ladder
    pub fn is_affirmative(&self) -> bool {
        matches!(self, Decision::Operate)
    }
}

impl From<String> for Decision {
    fn from(token: String) -> Self {
        match token.trim() {
            Self::OPERATE_TOKEN => Decision::Operate,
            Self::PAUSE_TOKEN => Decision::Pause,
            Self::STOP_LOSS_TOKEN => Decision::StopLoss,
            _ => Decision::Other(token),
        }
    }
}

impl From<&str> for Decision {
    fn from(token: &str) -> Self {
        Decision::from(token.to_string())
    }
}

impl From<Decision> for String {
    fn from(decision: Decision) -> Self {
        decision.as_token().to_string()
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Lifecycle phase of a bot as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotPhase {
    Stopped,
    Activating,
    Running,
    Pausing,
}

impl BotPhase {
    pub fn from_running(is_running: bool) -> Self {
        if is_running {
            BotPhase::Running
        } else {
            BotPhase::Stopped
        }
    }
}

/// Local record of an order owned by one bot.
///
/// This is a cache of exchange truth and is reconciled every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    /// Local identifier, stable even before the exchange assigns one
    pub id: String,
    pub exchange_order_id: Option<String>,
    pub pair: String,
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
    pub status: OrderStatus,
    /// Index into the computed ladder, `None` for ad-hoc orders
    pub grid_level: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl GridOrder {
    pub fn new(
        pair: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
        grid_level: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            exchange_order_id: None,
            pair: pair.to_string(),
            side,
            amount,
            price,
            status: OrderStatus::Open,
            grid_level,
            created_at: now,
            filled_at: None,
        }
    }

    pub fn with_exchange_id(mut self, exchange_order_id: impl Into<String>) -> Self {
        self.exchange_order_id = Some(exchange_order_id.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    pub fn notional(&self) -> f64 {
        self.amount * self.price
    }
}

/// Per-level state driving the "alternate side on fill" rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridStep {
    pub pair: String,
    pub level: u32,
    /// Ladder price this step was created at
    pub price: f64,
    pub last_filled_side: Option<OrderSide>,
    /// Exchange id of the last fill, used to pair round trips
    pub last_fill_order_id: Option<String>,
    pub last_fill_price: Option<f64>,
    pub active_order_id: Option<String>,
    pub active_side: Option<OrderSide>,
    pub updated_at: DateTime<Utc>,
}

impl GridStep {
    pub fn new(pair: &str, level: u32, price: f64, now: DateTime<Utc>) -> Self {
        Self {
            pair: pair.to_string(),
            level,
            price,
            last_filled_side: None,
            last_fill_order_id: None,
            last_fill_price: None,
            active_order_id: None,
            active_side: None,
            updated_at: now,
        }
    }

    /// Attach the order currently resting for this level
    pub fn activate(&mut self, order_id: &str, side: OrderSide, now: DateTime<Utc>) {
        self.active_order_id = Some(order_id.to_string());
        self.active_side = Some(side);
        self.updated_at = now;
    }

    /// Record a fill and clear the active order
    pub fn record_fill(&mut self, order_id: &str, side: OrderSide, price: f64, now: DateTime<Utc>) {
        self.last_filled_side = Some(side);
        self.last_fill_order_id = Some(order_id.to_string());
        self.last_fill_price = Some(price);
        self.active_order_id = None;
        self.active_side = None;
        self.updated_at = now;
    }
}

/// A realized buy→sell round trip; the only input to P&L reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridTrade {
    pub id: String,
    pub pair: String,
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub amount: f64,
    pub profit: f64,
    pub profit_percent: f64,
    pub executed_at: DateTime<Utc>,
}

impl GridTrade {
    pub fn from_round_trip(
        pair: &str,
        buy_order_id: &str,
        buy_price: f64,
        sell_order_id: &str,
        sell_price: f64,
        amount: f64,
        executed_at: DateTime<Utc>,
    ) -> Self {
        let profit = (sell_price - buy_price) * amount;
        let profit_percent = if buy_price > 0.0 {
            (sell_price - buy_price) / buy_price * 100.0
        } else {
            0.0
        };
        Self {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            buy_order_id: buy_order_id.to_string(),
            sell_order_id: sell_order_id.to_string(),
            buy_price,
            sell_price,
            amount,
            profit,
            profit_percent,
            executed_at,
        }
    }
}

/// Capital slice of a shared account attributed to one bot.
///
/// Recomputed from live balances every time it is needed; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotBalanceView {
    pub pair: String,
    pub allocated_capital: f64,
    pub base_balance: f64,
    pub quote_balance: f64,
    pub base_value_usdt: f64,
    pub quote_value_usdt: f64,
    pub total_value_usdt: f64,
    /// Quote plus base value across the whole account
    pub total_available_in_account: f64,
    pub price: f64,
}

/// Outcome of a bot-scoped spend check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalCheckResult {
    pub can_use: bool,
    pub requested: f64,
    pub available: f64,
    pub currency: String,
    pub remaining: f64,
}

/// Outcome of the fee-aware minimum notional check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderValidation {
    pub valid: bool,
    pub gross_value: f64,
    pub net_value: f64,
    /// Gross quantity-times-price needed to clear the minimum after fees
    pub min_required: f64,
    pub net_amount: f64,
}

/// Maker/taker fee rates as fractions (0.001 = 0.1%)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker: 0.001,
            taker: 0.001,
        }
    }
}

/// Balance of one currency on the exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Exchange-side order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    Open,
    Closed,
    Cancelled,
}

/// Order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: f64,
    pub amount: f64,
    pub filled: f64,
    /// Average execution price, zero until something fills
    pub average_price: f64,
    pub status: ExchangeOrderStatus,
}

impl ExchangeOrder {
    pub fn is_filled(&self) -> bool {
        self.status == ExchangeOrderStatus::Closed && self.filled > 0.0
    }

    /// Execution price, falling back to the limit price
    pub fn fill_price(&self) -> f64 {
        if self.average_price > 0.0 {
            self.average_price
        } else {
            self.price
        }
    }
}

/// Order request sent to the exchange gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub amount: f64,
    /// Limit price; ignored for market orders
    pub price: f64,
}

impl OrderRequest {
    pub fn limit(pair: &str, side: OrderSide, amount: f64, price: f64) -> Self {
        Self {
            pair: pair.to_string(),
            side,
            kind: OrderKind::Limit,
            amount,
            price,
        }
    }

    pub fn market(pair: &str, side: OrderSide, amount: f64) -> Self {
        Self {
            pair: pair.to_string(),
            side,
            kind: OrderKind::Market,
            amount,
            price: 0.0,
        }
    }
}

/// Split a `BASE/QUOTE` pair into its currencies
pub fn split_pair(pair: &str) -> (&str, &str) {
    match pair.split_once('/') {
        Some((base, quote)) => (base, quote),
        None => (pair, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_tokens() {
        assert_eq!(Decision::from("OPERAR_GRID"), Decision::Operate);
        assert_eq!(Decision::from("PAUSAR_GRID"), Decision::Pause);
        assert_eq!(Decision::from("STOP_LOSS_ACTIVATED"), Decision::StopLoss);
        assert_eq!(
            Decision::from("ESPERAR"),
            Decision::Other("ESPERAR".to_string())
        );
        assert!(Decision::Operate.is_affirmative());
        assert!(!Decision::Other("x".into()).is_affirmative());

        let json = serde_json::to_string(&Decision::Pause).unwrap();
        assert_eq!(json, "\"PAUSAR_GRID\"");
        let back: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Decision::Pause);
    }

    #[test]
    fn test_trade_profit() {
        let trade = GridTrade::from_round_trip("ETH/USDT", "b1", 1000.0, "s1", 1010.0, 0.5, Utc::now());
        assert!((trade.profit - 5.0).abs() < 1e-9);
        assert!((trade.profit_percent - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_step_fill_clears_active_order() {
        let now = Utc::now();
        let mut step = GridStep::new("ETH/USDT", 3, 990.0, now);
        step.activate("oid-1", OrderSide::Buy, now);
        step.record_fill("oid-1", OrderSide::Buy, 990.0, now);

        assert_eq!(step.last_filled_side, Some(OrderSide::Buy));
        assert_eq!(step.last_fill_order_id.as_deref(), Some("oid-1"));
        assert!(step.active_order_id.is_none());
        assert!(step.active_side.is_none());
    }

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("BTC/USDT"), ("BTC", "USDT"));
        assert_eq!(split_pair("BTC"), ("BTC", ""));
    }
}

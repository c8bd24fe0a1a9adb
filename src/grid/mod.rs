//! Multi-bot grid trading engine
//!
//! Each bot trades one pair with its own capital allocation. The engine
//! follows an external directive per bot, keeps a ladder of limit orders
//! around the current price, replaces every fill with its complement one
//! level away, and protects the position with stop-loss and trailing-up
//! checks.
//!
//! # Architecture
//!
//! - [`config`] - Bot and engine configuration
//! - [`types`] - Orders, steps, trades and balance views
//! - [`errors`] - Engine error type
//! - [`calculator`] - Pure ladder math and risk triggers
//! - [`exchange`] - Exchange seam plus the capital-aware [`ExchangeService`]
//! - [`paper`] - Simulated exchange for paper mode and tests
//! - [`price_feed`] - Public ticker polling for the paper exchange
//! - [`repository`] - Persistent store of configs, orders, steps and trades
//! - [`capital`] - Per-bot balance attribution
//! - [`ladder`] - Ladder construction and teardown
//! - [`transitions`] - Directive-driven lifecycle
//! - [`reconciliation`] - Fill detection and complementary orders
//! - [`risk`] - Stop-loss and trailing-up
//! - [`restart`] - Startup cleanup and capital verification
//! - [`mode`] - Paper / live switching
//! - [`engine`] - Scheduler tying everything together
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use grid_engine::grid::{
//!     engine_channels, BotConfig, EngineConfig, GridEngine, LocalRepository, LogNotifier,
//!     ModeSwitchingGateway, Notifier, PaperExchange, StaticDecisionSource, SystemClock,
//! };
//!
//! let paper = Arc::new(PaperExchange::new(Default::default(), 10.0).with_balance("USDT", 5000.0));
//! let engine = GridEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(ModeSwitchingGateway::new(paper)),
//!     Arc::new(SystemClock),
//!     Arc::new(LocalRepository::in_memory()),
//!     Arc::new(StaticDecisionSource::new()),
//!     Notifier::spawn(Arc::new(LogNotifier)),
//! );
//! engine.register_bots(&[BotConfig::new("ETH/USDT", 1000.0)]).await?;
//! engine.startup().await?;
//!
//! let (handle, channels) = engine_channels(16);
//! engine.run(channels).await?;
//! ```

pub mod calculator;
pub mod capital;
pub mod config;
pub mod decision;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod ladder;
pub mod mode;
pub mod notifier;
pub mod paper;
pub mod pnl;
pub mod price_feed;
pub mod reconciliation;
pub mod repository;
pub mod restart;
pub mod retry;
pub mod risk;
pub mod transitions;
pub mod types;

pub use calculator::GridCalculator;
pub use config::{BotConfig, EngineConfig};
pub use decision::{DecisionSource, StaticDecisionSource};
pub use engine::{engine_channels, EngineChannels, EngineCommand, EngineHandle, EngineStatus, GridEngine};
pub use errors::{GridError, GridResult};
pub use exchange::{ExchangeGateway, ExchangeService};
pub use ladder::{LadderBuilder, LadderReport, SettledFill, Teardown};
pub use mode::{ModeSwitchReport, ModeSwitcher, ModeSwitchingGateway, TradingMode};
pub use notifier::{LogNotifier, Notification, NotificationGateway, Notifier, TelegramNotifier};
pub use paper::PaperExchange;
pub use pnl::PnlSummary;
pub use price_feed::HttpPriceFeed;
pub use reconciliation::{ReconcileReport, ReconciliationLoop};
pub use repository::{GridRepository, LocalRepository};
pub use restart::{CapitalVerification, RestartSafetyCheck, RestartSafetyReport};
pub use retry::{Clock, ManualClock, RetryPolicy, SystemClock};
pub use risk::{RiskAction, RiskManager};
pub use transitions::{Transition, TransitionManager};
pub use types::{
    BotBalanceView, BotPhase, Decision, ExchangeOrder, FeeSchedule, GridOrder, GridStep, GridTrade,
    OrderSide, OrderStatus,
};

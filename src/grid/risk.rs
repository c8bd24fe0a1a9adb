//! Stop-loss and trailing-up protection

use std::sync::Arc;

use log::{error, info, warn};

use super::calculator::GridCalculator;
use super::config::BotConfig;
use super::errors::GridResult;
use super::ladder::{LadderBuilder, LadderReport};
use super::notifier::{Notification, Notifier, RiskEventKind};
use super::repository::GridRepository;
use super::types::{Decision, ExchangeOrder, GridOrder, GridTrade, OrderSide, OrderStatus};

/// Protective action taken for a bot in one risk pass
#[derive(Debug, Clone)]
pub enum RiskAction {
    None,
    /// Orders cancelled, position sold, bot stopped
    StopLoss {
        price: f64,
        last_buy_price: f64,
        sale: Option<ExchangeOrder>,
    },
    /// Ladder rebuilt around a higher price
    TrailingUp {
        price: f64,
        highest_sell_price: f64,
        report: LadderReport,
    },
}

impl RiskAction {
    pub fn is_none(&self) -> bool {
        matches!(self, RiskAction::None)
    }
}

pub struct RiskManager {
    ladder: Arc<LadderBuilder>,
    repository: Arc<dyn GridRepository>,
    notifier: Notifier,
}

impl RiskManager {
    pub fn new(ladder: Arc<LadderBuilder>, repository: Arc<dyn GridRepository>, notifier: Notifier) -> Self {
        Self {
            ladder,
            repository,
            notifier,
        }
    }

    /// Evaluate both triggers for a running bot and act on the first that fires
    pub async fn evaluate(&self, config: &BotConfig) -> GridResult<RiskAction> {
        if !config.is_running || !(config.enable_stop_loss || config.trailing_up_enabled) {
            return Ok(RiskAction::None);
        }

        let exchange = self.ladder.exchange();
        let price = exchange.get_current_price(&config.pair).await?;
        let calculator = GridCalculator::new(exchange.get_minimum_order_value(&config.pair).await);

        if config.enable_stop_loss {
            if let Some(last_buy) = self.repository.get_last_filled_buy(&config.pair).await? {
                if calculator.check_stop_loss_triggered(price, last_buy.price, config) {
                    return self.execute_stop_loss(config, price, last_buy.price).await;
                }
            }
        }

        if config.trailing_up_enabled {
            if let Some(highest) = self.highest_sell_price(config, &calculator).await? {
                if calculator.check_trailing_up_triggered(price, highest, config) {
                    return self.execute_trailing_up(config, price, highest).await;
                }
            }
        }

        Ok(RiskAction::None)
    }

    /// Highest open sell, or the highest sell ever filled when none is open
    async fn highest_sell_price(&self, config: &BotConfig, calculator: &GridCalculator) -> GridResult<Option<f64>> {
        let orders = self.repository.get_orders(&config.pair).await?;
        if let Some(price) = calculator.highest_sell_price(&orders) {
            return Ok(Some(price));
        }
        Ok(orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell && o.status != OrderStatus::Cancelled)
            .map(|o| o.price)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p)))))
    }

    async fn execute_stop_loss(&self, config: &BotConfig, price: f64, last_buy_price: f64) -> GridResult<RiskAction> {
        warn!(
            "{}: STOP LOSS at {:.4} (last buy {:.4}, limit {}%)",
            config.pair, price, last_buy_price, config.stop_loss_percent
        );

        let teardown = self.ladder.teardown(config).await?;
        self.announce_trades(&teardown.trades);
        let cancelled = teardown.cancelled;
        let exchange = self.ladder.exchange();

        let sale = match exchange.sell_position_with_retry(config).await {
            Ok(sale) => sale,
            Err(e) => {
                error!("{}: stop-loss liquidation failed: {}", config.pair, e);
                self.notifier.notify(Notification::Error {
                    context: format!("stop loss {}", config.pair),
                    message: format!("orders cancelled but position not sold: {}", e),
                });
                return Err(e);
            }
        };

        if let Some(order) = &sale {
            let now = exchange.clock().now();
            let mut record = GridOrder::new(&config.pair, OrderSide::Sell, order.filled, order.fill_price(), None, now)
                .with_exchange_id(&order.id);
            record.status = OrderStatus::Filled;
            record.filled_at = Some(now);
            self.repository.save_order(&record).await?;
        }

        self.repository
            .update_bot_status(&config.pair, false, Some(Decision::StopLoss))
            .await?;

        let sold = sale.as_ref().map_or(0.0, |o| o.filled);
        info!("{}: stopped after stop loss, {} orders cancelled, sold {:.6}", config.pair, cancelled, sold);
        self.notifier.notify(Notification::RiskEvent {
            pair: config.pair.clone(),
            kind: RiskEventKind::StopLoss,
            price,
            detail: format!(
                "Last buy {:.4}, {} orders cancelled, sold {:.6} {}. Bot stopped.",
                last_buy_price,
                cancelled,
                sold,
                config.base_currency()
            ),
        });

        Ok(RiskAction::StopLoss {
            price,
            last_buy_price,
            sale,
        })
    }

    async fn execute_trailing_up(&self, config: &BotConfig, price: f64, highest_sell_price: f64) -> GridResult<RiskAction> {
        info!(
            "{}: TRAILING UP at {:.4} (highest sell {:.4}), re-centering ladder",
            config.pair, price, highest_sell_price
        );

        let report = self.ladder.build(config).await?;
        self.announce_trades(&report.settled_trades);
        self.notifier.notify(Notification::RiskEvent {
            pair: config.pair.clone(),
            kind: RiskEventKind::TrailingUp,
            price,
            detail: format!(
                "Highest sell was {:.4}; ladder rebuilt with {} buys / {} sells",
                highest_sell_price, report.buys_placed, report.sells_placed
            ),
        });

        Ok(RiskAction::TrailingUp {
            price,
            highest_sell_price,
            report,
        })
    }

    fn announce_trades(&self, trades: &[GridTrade]) {
        for trade in trades {
            self.notifier.notify(Notification::TradeCompleted(trade.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::EngineConfig;
    use crate::grid::exchange::{ExchangeGateway, ExchangeService};
    use crate::grid::notifier::mock::RecordingNotifier;
    use crate::grid::paper::PaperExchange;
    use crate::grid::repository::LocalRepository;
    use crate::grid::retry::ManualClock;
    use crate::grid::types::FeeSchedule;

    struct Fixture {
        exchange: Arc<PaperExchange>,
        repository: Arc<LocalRepository>,
        recorder: Arc<RecordingNotifier>,
        notifier: Notifier,
        ladder: Arc<LadderBuilder>,
        risk: RiskManager,
    }

    fn fixture() -> Fixture {
        let exchange = Arc::new(
            PaperExchange::new(FeeSchedule::default(), 10.0)
                .with_balance("USDT", 2000.0)
                .with_price("ETH/USDT", 1000.0),
        );
        let repository = Arc::new(LocalRepository::in_memory());
        let service = Arc::new(ExchangeService::new(exchange.clone(), Arc::new(ManualClock::default())));
        let ladder = Arc::new(LadderBuilder::new(
            service,
            repository.clone(),
            EngineConfig::default().without_delays(),
        ));
        let recorder = Arc::new(RecordingNotifier::new());
        let notifier = Notifier::spawn(recorder.clone());
        let risk = RiskManager::new(ladder.clone(), repository.clone(), notifier.clone());
        Fixture {
            exchange,
            repository,
            recorder,
            notifier,
            ladder,
            risk,
        }
    }

    async fn running_bot(f: &Fixture) -> BotConfig {
        let config = BotConfig::new("ETH/USDT", 1000.0)
            .with_grid(10, 10.0)
            .with_stop_loss(true, 5.0)
            .with_trailing_up(true, 2.0)
            .with_status(true, Some(Decision::Operate));
        f.repository.save_config(&config).await.unwrap();
        f.ladder.build(&config).await.unwrap();
        config
    }

    #[tokio::test]
    async fn test_stop_loss_liquidates_and_stops() {
        let f = fixture();
        let config = running_bot(&f).await;

        f.exchange.set_price("ETH/USDT", 940.0).await;
        let action = f.risk.evaluate(&config).await.unwrap();

        match action {
            RiskAction::StopLoss { last_buy_price, sale, .. } => {
                assert!((last_buy_price - 1000.0).abs() < 1e-9);
                assert!(sale.is_some());
            }
            other => panic!("expected stop loss, got {:?}", other),
        }
        assert_eq!(f.exchange.open_order_count("ETH/USDT").await, 0);
        assert!(f.exchange.balance("ETH").await.total() < 1e-5);

        let stored = f.repository.get_config("ETH/USDT").await.unwrap().unwrap();
        assert!(!stored.is_running);
        assert_eq!(stored.last_decision, Some(Decision::StopLoss));

        f.notifier.flush().await;
        let events = f
            .recorder
            .count_matching(|n| matches!(n, Notification::RiskEvent { kind: RiskEventKind::StopLoss, .. }))
            .await;
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn test_stop_loss_settles_fills_before_liquidating() {
        let f = fixture();
        let config = running_bot(&f).await;

        // A sell fills on the way up, every buy fills on the way down
        f.exchange.set_price("ETH/USDT", 1006.0).await;
        let fills = f.exchange.set_price("ETH/USDT", 940.0).await;
        assert_eq!(fills.len(), 5);

        let action = f.risk.evaluate(&config).await.unwrap();
        assert!(matches!(action, RiskAction::StopLoss { .. }));

        let trades = f.repository.get_trades(Some("ETH/USDT")).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!((trades[0].buy_price - 1000.0).abs() < 1e-9);

        let orders = f.repository.get_orders("ETH/USDT").await.unwrap();
        let buys: Vec<_> = orders
            .iter()
            .filter(|o| o.side == OrderSide::Buy && o.grid_level.is_some())
            .collect();
        assert_eq!(buys.len(), 5);
        assert!(buys.iter().all(|o| o.status == OrderStatus::Filled));
        let cancelled_sells = orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell && o.status == OrderStatus::Cancelled)
            .count();
        assert_eq!(cancelled_sells, 4);

        f.notifier.flush().await;
        let completed = f
            .recorder
            .count_matching(|n| matches!(n, Notification::TradeCompleted(_)))
            .await;
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_small_drop_does_not_trigger() {
        let f = fixture();
        let config = running_bot(&f).await;

        f.exchange.set_price("ETH/USDT", 960.0).await;
        assert!(f.risk.evaluate(&config).await.unwrap().is_none());
        assert!(f.exchange.open_order_count("ETH/USDT").await > 0);
    }

    #[tokio::test]
    async fn test_trailing_up_recenters_ladder() {
        let f = fixture();
        let config = running_bot(&f).await;

        f.exchange.set_price("ETH/USDT", 1075.0).await;
        let action = f.risk.evaluate(&config).await.unwrap();

        match action {
            RiskAction::TrailingUp {
                highest_sell_price,
                report,
                ..
            } => {
                assert!((highest_sell_price - 1050.0).abs() < 1e-9);
                assert!((report.reference_price - 1075.0).abs() < 1e-9);
                assert_eq!(report.orders_placed(), 10);
            }
            other => panic!("expected trailing up, got {:?}", other),
        }

        let open = f.exchange.get_open_orders("ETH/USDT").await.unwrap();
        assert_eq!(open.len(), 10);
        assert!(open.iter().any(|o| o.side == OrderSide::Buy && o.price > 1050.0));
        let stored = f.repository.get_config("ETH/USDT").await.unwrap().unwrap();
        assert!(stored.is_running);
    }

    #[tokio::test]
    async fn test_trailing_up_books_sells_filled_on_the_way() {
        let f = fixture();
        let config = running_bot(&f).await;

        let fills = f.exchange.set_price("ETH/USDT", 1075.0).await;
        assert_eq!(fills.len(), 5);

        let action = f.risk.evaluate(&config).await.unwrap();
        match action {
            RiskAction::TrailingUp { report, .. } => assert_eq!(report.settled_trades.len(), 5),
            other => panic!("expected trailing up, got {:?}", other),
        }

        // Each upper level closes a round trip against the entry buy
        let trades = f.repository.get_trades(Some("ETH/USDT")).await.unwrap();
        assert_eq!(trades.len(), 5);
        assert!(trades.iter().all(|t| (t.buy_price - 1000.0).abs() < 1e-9 && t.profit > 0.0));
        for fill in &fills {
            let local = f
                .repository
                .get_order_by_exchange_id("ETH/USDT", &fill.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(local.status, OrderStatus::Filled);
        }

        f.notifier.flush().await;
        let completed = f
            .recorder
            .count_matching(|n| matches!(n, Notification::TradeCompleted(_)))
            .await;
        assert_eq!(completed, 5);
    }

    #[tokio::test]
    async fn test_small_rise_does_not_trail() {
        let f = fixture();
        let config = running_bot(&f).await;

        f.exchange.set_price("ETH/USDT", 1060.0).await;
        assert!(f.risk.evaluate(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stopped_bot_is_ignored() {
        let f = fixture();
        let config = running_bot(&f).await.with_status(false, Some(Decision::Pause));

        f.exchange.set_price("ETH/USDT", 500.0).await;
        assert!(f.risk.evaluate(&config).await.unwrap().is_none());
    }
}

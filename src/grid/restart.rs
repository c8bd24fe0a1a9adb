//! Startup safety routine
//!
//! Before any bot trades after a restart, every order the engine may have
//! left behind is cancelled (fills that happened while it was down are
//! booked first) and each running bot's capital is checked against its
//! allocation.

use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

use super::config::{BotConfig, EngineConfig};
use super::errors::{GridError, GridResult};
use super::ladder::LadderBuilder;
use super::notifier::{Notification, Notifier};
use super::repository::GridRepository;

/// Capital found for one bot versus its allocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalVerification {
    pub pair: String,
    pub allocated_capital: f64,
    pub actual_balance_usdt: f64,
    pub actual_balance_crypto: f64,
    pub crypto_value_usdt: f64,
    pub total_value: f64,
    pub is_safe: bool,
    pub missing_capital: f64,
    pub excess_capital: f64,
}

impl CapitalVerification {
    /// Verification for a bot whose balances could not be read
    fn unavailable(config: &BotConfig) -> Self {
        Self {
            pair: config.pair.clone(),
            allocated_capital: config.total_capital,
            actual_balance_usdt: 0.0,
            actual_balance_crypto: 0.0,
            crypto_value_usdt: 0.0,
            total_value: 0.0,
            is_safe: false,
            missing_capital: config.total_capital,
            excess_capital: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartSafetyReport {
    pub total_orders_cancelled: u32,
    /// Pairs whose orders could not all be cancelled
    pub failed_pairs: Vec<String>,
    pub verifications: Vec<CapitalVerification>,
    pub total_missing: f64,
    pub total_excess: f64,
    pub is_safe_to_continue: bool,
    pub recommendations: Vec<String>,
}

impl RestartSafetyReport {
    pub fn new(total_orders_cancelled: u32, failed_pairs: Vec<String>, verifications: Vec<CapitalVerification>) -> Self {
        let total_missing = verifications.iter().map(|v| v.missing_capital).sum();
        let total_excess = verifications.iter().map(|v| v.excess_capital).sum();
        let is_safe_to_continue = failed_pairs.is_empty() && verifications.iter().all(|v| v.is_safe);
        let recommendations = recommendations(&verifications, &failed_pairs);

        Self {
            total_orders_cancelled,
            failed_pairs,
            verifications,
            total_missing,
            total_excess,
            is_safe_to_continue,
            recommendations,
        }
    }

    pub fn render(&self) -> String {
        let mut text = format!(
            "🔒 Restart safety check\nOrders cancelled: {}\nMissing capital: {:.2}\nExcess capital: {:.2}\nSafe to continue: {}",
            self.total_orders_cancelled,
            self.total_missing,
            self.total_excess,
            if self.is_safe_to_continue { "yes" } else { "NO" }
        );
        for v in &self.verifications {
            text.push_str(&format!(
                "\n• {}: allocated {:.2}, found {:.2} ({:.2} quote + {:.6} base)",
                v.pair, v.allocated_capital, v.total_value, v.actual_balance_usdt, v.actual_balance_crypto
            ));
        }
        for line in &self.recommendations {
            text.push('\n');
            text.push_str(line);
        }
        text
    }
}

fn recommendations(verifications: &[CapitalVerification], failed_pairs: &[String]) -> Vec<String> {
    let mut lines = Vec::new();

    let missing: Vec<_> = verifications.iter().filter(|v| v.missing_capital > 0.0).collect();
    if !missing.is_empty() {
        lines.push("⚠️ Missing capital detected:".to_string());
        for v in missing {
            lines.push(format!("  • {}: {:.2} short", v.pair, v.missing_capital));
        }
        lines.push("  • Deposit funds or lower the allocation before continuing".to_string());
    }

    let excess: Vec<_> = verifications.iter().filter(|v| v.excess_capital > 0.0).collect();
    if !excess.is_empty() {
        lines.push("💰 Excess capital detected:".to_string());
        for v in excess {
            lines.push(format!("  • {}: {:.2} above allocation", v.pair, v.excess_capital));
        }
    }

    for pair in failed_pairs {
        lines.push(format!("🚨 {}: orders could not be cancelled, check the exchange manually", pair));
    }

    let unsafe_pairs: Vec<_> = verifications.iter().filter(|v| !v.is_safe).collect();
    if unsafe_pairs.is_empty() && failed_pairs.is_empty() {
        lines.push("✅ Capital verified, safe to create orders".to_string());
    } else {
        for v in unsafe_pairs {
            lines.push(format!("🚨 {}: insufficient capital, do not activate", v.pair));
        }
    }
    lines
}

pub struct RestartSafetyCheck {
    ladder: Arc<LadderBuilder>,
    repository: Arc<dyn GridRepository>,
    notifier: Notifier,
    settings: EngineConfig,
}

impl RestartSafetyCheck {
    pub fn new(
        ladder: Arc<LadderBuilder>,
        repository: Arc<dyn GridRepository>,
        notifier: Notifier,
        settings: EngineConfig,
    ) -> Self {
        Self {
            ladder,
            repository,
            notifier,
            settings,
        }
    }

    /// Cancel every configured pair's orders, verify capital of running bots
    /// and send the report.
    pub async fn run(&self) -> GridResult<RestartSafetyReport> {
        info!("Running restart safety check on {}", self.ladder.exchange().gateway().name());
        let configs = self.repository.get_all_configs().await?;

        let mut cancelled = 0u32;
        let mut failed_pairs = Vec::new();
        for config in &configs {
            match self.ladder.teardown(config).await {
                Ok(teardown) => {
                    cancelled += teardown.cancelled;
                    for trade in teardown.trades {
                        self.notifier.notify(Notification::TradeCompleted(trade));
                    }
                }
                // Local records stay open for reconciliation to resolve
                Err(e @ GridError::Persistence(_)) => return Err(e),
                Err(e) => {
                    error!("{}: could not clear orders at restart: {}", config.pair, e);
                    failed_pairs.push(config.pair.clone());
                }
            }
        }

        let active: Vec<BotConfig> = configs.into_iter().filter(|c| c.is_running).collect();
        let verifications = self.verify_capital(&active).await;
        let report = RestartSafetyReport::new(cancelled, failed_pairs, verifications);

        info!(
            "Restart safety: {} orders cancelled, missing {:.2}, excess {:.2}, safe: {}",
            report.total_orders_cancelled, report.total_missing, report.total_excess, report.is_safe_to_continue
        );
        self.notifier.notify(Notification::RestartSafety(report.clone()));
        Ok(report)
    }

    /// Compare each bot's capital view with its allocation
    pub async fn verify_capital(&self, configs: &[BotConfig]) -> Vec<CapitalVerification> {
        let mut verifications = Vec::with_capacity(configs.len());
        for config in configs {
            verifications.push(self.verify_bot(config).await);
        }
        verifications
    }

    async fn verify_bot(&self, config: &BotConfig) -> CapitalVerification {
        let view = match self.ladder.exchange().get_bot_allocated_balance(config).await {
            Ok(view) => view,
            Err(e) => {
                warn!("{}: capital unavailable for verification: {}", config.pair, e);
                return CapitalVerification::unavailable(config);
            }
        };

        let allocated = config.total_capital;
        let total_value = view.total_value_usdt;
        let missing_capital = (allocated - total_value).max(0.0);
        let excess_capital = (total_value - allocated).max(0.0);
        let margin = allocated * self.settings.restart_safety_margin_percent / 100.0;
        let is_safe = missing_capital <= margin;

        if !is_safe {
            warn!(
                "{}: allocated {:.2} but only {:.2} available",
                config.pair, allocated, total_value
            );
        }

        CapitalVerification {
            pair: config.pair.clone(),
            allocated_capital: allocated,
            actual_balance_usdt: view.quote_balance,
            actual_balance_crypto: view.base_balance,
            crypto_value_usdt: view.base_value_usdt,
            total_value,
            is_safe,
            missing_capital,
            excess_capital,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::exchange::ExchangeService;
    use crate::grid::notifier::mock::RecordingNotifier;
    use crate::grid::paper::PaperExchange;
    use crate::grid::repository::LocalRepository;
    use crate::grid::retry::ManualClock;
    use crate::grid::types::{Decision, FeeSchedule};

    fn setup(quote: f64) -> (Arc<PaperExchange>, Arc<LocalRepository>, Arc<LadderBuilder>) {
        let exchange = Arc::new(
            PaperExchange::new(FeeSchedule::default(), 10.0)
                .with_balance("USDT", quote)
                .with_price("ETH/USDT", 1000.0)
                .with_price("BTC/USDT", 50_000.0),
        );
        let repository = Arc::new(LocalRepository::in_memory());
        let service = Arc::new(ExchangeService::new(exchange.clone(), Arc::new(ManualClock::default())));
        let ladder = Arc::new(LadderBuilder::new(
            service,
            repository.clone(),
            EngineConfig::default().without_delays(),
        ));
        (exchange, repository, ladder)
    }

    #[tokio::test]
    async fn test_restart_cancels_leftover_orders() {
        let (exchange, repository, ladder) = setup(3000.0);
        let settings = EngineConfig::default().without_delays();
        let config = BotConfig::new("ETH/USDT", 1000.0)
            .with_grid(10, 10.0)
            .with_status(true, Some(Decision::Operate));
        repository.save_config(&config).await.unwrap();
        ladder.build(&config).await.unwrap();

        let recorder = Arc::new(RecordingNotifier::new());
        let notifier = Notifier::spawn(recorder.clone());
        let check = RestartSafetyCheck::new(ladder, repository.clone(), notifier.clone(), settings);
        let report = check.run().await.unwrap();

        assert_eq!(report.total_orders_cancelled, 10);
        assert_eq!(exchange.open_order_count("ETH/USDT").await, 0);
        assert!(repository.get_open_orders("ETH/USDT").await.unwrap().is_empty());
        assert!(report.is_safe_to_continue);
        assert_eq!(report.verifications.len(), 1);

        notifier.flush().await;
        let sent = recorder
            .count_matching(|n| matches!(n, Notification::RestartSafety(_)))
            .await;
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_restart_books_fills_made_while_down() {
        let (exchange, repository, ladder) = setup(3000.0);
        let config = BotConfig::new("ETH/USDT", 1000.0)
            .with_grid(10, 10.0)
            .with_status(true, Some(Decision::Operate));
        repository.save_config(&config).await.unwrap();
        ladder.build(&config).await.unwrap();
        exchange.set_price("ETH/USDT", 1006.0).await;

        let recorder = Arc::new(RecordingNotifier::new());
        let notifier = Notifier::spawn(recorder.clone());
        let check = RestartSafetyCheck::new(ladder, repository.clone(), notifier.clone(), EngineConfig::default());
        let report = check.run().await.unwrap();

        assert_eq!(report.total_orders_cancelled, 9);
        assert_eq!(repository.get_trades(None).await.unwrap().len(), 1);

        notifier.flush().await;
        let completed = recorder
            .count_matching(|n| matches!(n, Notification::TradeCompleted(_)))
            .await;
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_missing_capital_is_unsafe() {
        let (_exchange, repository, ladder) = setup(900.0);
        let settings = EngineConfig::default();
        repository
            .save_config(&BotConfig::new("ETH/USDT", 1000.0).with_status(true, Some(Decision::Operate)))
            .await
            .unwrap();

        let notifier = Notifier::spawn(Arc::new(RecordingNotifier::new()));
        let check = RestartSafetyCheck::new(ladder, repository, notifier, settings);
        let report = check.run().await.unwrap();

        let v = &report.verifications[0];
        assert!((v.missing_capital - 100.0).abs() < 1e-9);
        assert!(!v.is_safe);
        assert!(!report.is_safe_to_continue);
        assert!(report.render().contains("ETH/USDT"));
        assert!(report.recommendations.iter().any(|r| r.contains("insufficient capital")));
    }

    #[tokio::test]
    async fn test_shortfall_within_margin_is_safe() {
        let (_exchange, repository, ladder) = setup(960.0);
        let config = BotConfig::new("ETH/USDT", 1000.0);
        let notifier = Notifier::spawn(Arc::new(RecordingNotifier::new()));
        let check = RestartSafetyCheck::new(ladder, repository, notifier, EngineConfig::default());

        let verifications = check.verify_capital(&[config]).await;
        assert!(verifications[0].is_safe);
        assert!((verifications[0].missing_capital - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_recommendations() {
        let ok = CapitalVerification {
            pair: "ETH/USDT".into(),
            allocated_capital: 100.0,
            actual_balance_usdt: 100.0,
            actual_balance_crypto: 0.0,
            crypto_value_usdt: 0.0,
            total_value: 100.0,
            is_safe: true,
            missing_capital: 0.0,
            excess_capital: 0.0,
        };
        let report = RestartSafetyReport::new(3, Vec::new(), vec![ok.clone()]);
        assert!(report.is_safe_to_continue);
        assert_eq!(report.recommendations.len(), 1);

        let report = RestartSafetyReport::new(3, vec!["ETH/USDT".into()], vec![ok]);
        assert!(!report.is_safe_to_continue);
        assert!(report.recommendations.iter().any(|r| r.contains("could not be cancelled")));
    }
}

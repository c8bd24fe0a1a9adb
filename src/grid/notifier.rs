//! Outbound alerts
//!
//! Trading code hands a [`Notification`] to a [`Notifier`] and moves on. A
//! background worker delivers messages in order; delivery failures are only
//! logged and never reach the caller.

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::errors::{GridError, GridResult};
use super::pnl::PnlSummary;
use super::restart::RestartSafetyReport;
use super::types::GridTrade;

/// Kind of protective action taken by the risk manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskEventKind {
    StopLoss,
    TrailingUp,
}

/// Message sent to operators
#[derive(Debug, Clone)]
pub enum Notification {
    Startup {
        bots: usize,
        mode: String,
    },
    Error {
        context: String,
        message: String,
    },
    TradeCompleted(GridTrade),
    BotStatus {
        pair: String,
        status: String,
        detail: String,
    },
    RiskEvent {
        pair: String,
        kind: RiskEventKind,
        price: f64,
        detail: String,
    },
    /// Situation the engine refuses to resolve on its own
    NeedsReview {
        pair: String,
        detail: String,
    },
    RestartSafety(RestartSafetyReport),
    GridSummary {
        active_bots: usize,
        pnl: PnlSummary,
    },
}

impl Notification {
    /// Plain-text rendering shared by all transports
    pub fn render(&self) -> String {
        match self {
            Notification::Startup { bots, mode } => {
                format!("🚀 Grid engine started\nMode: {}\nConfigured bots: {}", mode, bots)
            }
            Notification::Error { context, message } => format!("❌ Error in {}\n{}", context, message),
            Notification::TradeCompleted(trade) => format!(
                "💰 Round trip completed on {}\nBuy: {:.6} @ {:.4}\nSell: {:.6} @ {:.4}\nProfit: {:.4} ({:.2}%)",
                trade.pair, trade.amount, trade.buy_price, trade.amount, trade.sell_price, trade.profit, trade.profit_percent
            ),
            Notification::BotStatus { pair, status, detail } => {
                format!("🤖 {} → {}\n{}", pair, status, detail)
            }
            Notification::RiskEvent { pair, kind, price, detail } => {
                let title = match kind {
                    RiskEventKind::StopLoss => "🛑 STOP LOSS",
                    RiskEventKind::TrailingUp => "📈 TRAILING UP",
                };
                format!("{} on {} at {:.4}\n{}", title, pair, price, detail)
            }
            Notification::NeedsReview { pair, detail } => {
                format!("⚠️ Operator review needed for {}\n{}", pair, detail)
            }
            Notification::RestartSafety(report) => report.render(),
            Notification::GridSummary { active_bots, pnl } => {
                let mut text = format!(
                    "📊 Grid summary\nActive bots: {}\nCompleted trades: {}\nRealized profit: {:.4}",
                    active_bots, pnl.total_trades, pnl.total_profit
                );
                for (pair, totals) in &pnl.by_pair {
                    text.push_str(&format!("\n• {}: {} trades, {:.4}", pair, totals.trades, totals.profit));
                }
                text
            }
        }
    }
}

/// Transport for notifications
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, notification: &Notification) -> GridResult<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationGateway for LogNotifier {
    async fn send(&self, notification: &Notification) -> GridResult<()> {
        info!("[notify] {}", notification.render().replace('\n', " | "));
        Ok(())
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram Bot API transport
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: "https://api.telegram.org".to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Builder: point at a different API host
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn send_message(&self, text: &str) -> GridResult<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GridError::Notification(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(GridError::Notification(format!("Telegram API error {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl NotificationGateway for TelegramNotifier {
    async fn send(&self, notification: &Notification) -> GridResult<()> {
        self.send_message(&notification.render()).await
    }
}

enum Envelope {
    Message(Notification),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front end for a [`NotificationGateway`]
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Notifier {
    /// Start the delivery worker; must be called inside a tokio runtime
    pub fn spawn(gateway: Arc<dyn NotificationGateway>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Message(notification) => {
                        if let Err(e) = gateway.send(&notification).await {
                            error!("Notification delivery failed: {}", e);
                        }
                    }
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queue a notification; never blocks and never fails
    pub fn notify(&self, notification: Notification) {
        if self.tx.send(Envelope::Message(notification)).is_err() {
            warn!("Notification worker stopped, message dropped");
        }
    }

    /// Wait until everything queued so far has been handed to the gateway
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Recording transport for tests and dry runs
pub mod mock {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
        pub should_fail: Mutex<bool>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        pub async fn messages(&self) -> Vec<Notification> {
            self.sent.lock().await.clone()
        }

        pub async fn count_matching<F: Fn(&Notification) -> bool>(&self, f: F) -> usize {
            self.sent.lock().await.iter().filter(|n| f(n)).count()
        }
    }

    #[async_trait]
    impl NotificationGateway for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> GridResult<()> {
            if *self.should_fail.lock().await {
                return Err(GridError::Notification("mock failure".into()));
            }
            self.sent.lock().await.push(notification.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingNotifier;
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_notifier_delivers_in_order() {
        let recorder = Arc::new(RecordingNotifier::new());
        let notifier = Notifier::spawn(recorder.clone());

        notifier.notify(Notification::Startup {
            bots: 2,
            mode: "paper".into(),
        });
        notifier.notify(Notification::Error {
            context: "ETH/USDT".into(),
            message: "boom".into(),
        });
        notifier.flush().await;

        let sent = recorder.messages().await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Notification::Startup { bots: 2, .. }));
        assert!(matches!(sent[1], Notification::Error { .. }));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let recorder = Arc::new(RecordingNotifier::new());
        recorder.set_should_fail(true).await;
        let notifier = Notifier::spawn(recorder.clone());

        notifier.notify(Notification::NeedsReview {
            pair: "ETH/USDT".into(),
            detail: "empty ladder".into(),
        });
        notifier.flush().await;

        recorder.set_should_fail(false).await;
        notifier.notify(Notification::NeedsReview {
            pair: "ETH/USDT".into(),
            detail: "still empty".into(),
        });
        notifier.flush().await;

        assert_eq!(recorder.messages().await.len(), 1);
    }

    #[test]
    fn test_render_trade() {
        let trade = GridTrade::from_round_trip("ETH/USDT", "b", 1000.0, "s", 1010.0, 0.5, Utc::now());
        let text = Notification::TradeCompleted(trade).render();
        assert!(text.contains("ETH/USDT"));
        assert!(text.contains("5.0000"));
    }

    #[test]
    fn test_render_summary_lists_pairs() {
        let trades = vec![GridTrade::from_round_trip("BTC/USDT", "b", 100.0, "s", 110.0, 1.0, Utc::now())];
        let text = Notification::GridSummary {
            active_bots: 1,
            pnl: PnlSummary::from_trades(&trades),
        }
        .render();
        assert!(text.contains("BTC/USDT"));
        assert!(text.contains("Active bots: 1"));
    }
}

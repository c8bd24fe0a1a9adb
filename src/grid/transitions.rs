//! Per-bot activation state machine
//!
//! A tick compares the upstream directive with the bot's stored status and
//! yields a [`Transition`]. Handlers are idempotent so a tick can be replayed
//! after a crash without duplicating orders.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use super::config::{BotConfig, EngineConfig};
use super::errors::{GridError, GridResult};
use super::ladder::{LadderBuilder, LadderReport};
use super::notifier::{Notification, Notifier};
use super::repository::GridRepository;
use super::retry::{poll_until, Polled};
use super::types::{Decision, GridTrade};

/// What a tick decided to do with a bot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Transition {
    /// Directive turned affirmative: build the ladder and mark running
    Activate,
    /// Directive turned negative: cancel orders, keep the position
    Pause,
    /// Running bot with an empty book: rebuild without touching status
    InitializeOrders,
    /// Exchange shows no orders while local records still list some
    NeedsReview { local_open_orders: usize },
    NoChange,
}

/// Classify a directive against the stored status; no I/O.
///
/// The empty-ladder case needs the exchange and is handled by
/// [`TransitionManager::detect`].
pub fn classify(config: &BotConfig, directive: Option<&Decision>) -> Transition {
    let Some(directive) = directive else {
        return Transition::NoChange;
    };
    let was_operating = config.last_decision.as_ref() == Some(&Decision::Operate);

    if directive.is_affirmative() {
        if !config.is_running || !was_operating {
            return Transition::Activate;
        }
    } else if config.is_running || was_operating {
        return Transition::Pause;
    }
    Transition::NoChange
}

/// Result of applying a transition
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub transition: Transition,
    pub config: BotConfig,
    /// Present when a ladder was (re)built
    pub report: Option<LadderReport>,
}

pub struct TransitionManager {
    ladder: Arc<LadderBuilder>,
    repository: Arc<dyn GridRepository>,
    notifier: Notifier,
    settings: EngineConfig,
}

impl TransitionManager {
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

    /// Classify the next transition, probing the exchange when a running bot
    /// may have lost its ladder.
    pub async fn detect(&self, config: &BotConfig, directive: Option<&Decision>) -> GridResult<Transition> {
        let transition = classify(config, directive);
        if transition != Transition::NoChange || !config.is_running {
            return Ok(transition);
        }
        if !directive.map_or(false, Decision::is_affirmative) {
            return Ok(Transition::NoChange);
        }

        let gateway = self.ladder.exchange().gateway().clone();
        let delays = self.settings.empty_ladder_retry_delays();
        let polled = poll_until(
            self.ladder.exchange().clock().as_ref(),
            &delays,
            || {
                let gateway = gateway.clone();
                let pair = config.pair.clone();
                async move { gateway.get_open_orders(&pair).await }
            },
            |orders| !orders.is_empty(),
        )
        .await?;

        if let Polled::Ready(orders) = polled {
            debug!("{}: {} open orders on exchange", config.pair, orders.len());
            return Ok(Transition::NoChange);
        }

        let local_open = self.repository.get_open_orders(&config.pair).await?.len();
        if local_open > 0 && !self.settings.rebuild_on_ambiguous_empty_ladder {
            warn!(
                "{}: exchange reports no orders after {} checks but {} are recorded open",
                config.pair,
                delays.len() + 1,
                local_open
            );
            return Ok(Transition::NeedsReview {
                local_open_orders: local_open,
            });
        }

        info!("{}: running with an empty ladder, orders will be rebuilt", config.pair);
        Ok(Transition::InitializeOrders)
    }

    /// Run a transition's handler
    pub async fn apply(
        &self,
        config: &BotConfig,
        transition: Transition,
        directive: Option<&Decision>,
    ) -> GridResult<TransitionOutcome> {
        match transition {
            Transition::Activate => {
                let decision = directive.cloned().unwrap_or(Decision::Operate);
                self.activate(config, decision).await
            }
            Transition::Pause => {
                let decision = directive.cloned().unwrap_or(Decision::Pause);
                self.pause(config, decision).await
            }
            Transition::InitializeOrders => self.initialize_orders(config).await,
            Transition::NeedsReview { local_open_orders } => {
                self.notifier.notify(Notification::NeedsReview {
                    pair: config.pair.clone(),
                    detail: format!(
                        "Bot is running, exchange shows no open orders, {} local orders still open. Not rebuilding.",
                        local_open_orders
                    ),
                });
                Ok(TransitionOutcome {
                    transition: Transition::NeedsReview { local_open_orders },
                    config: config.clone(),
                    report: None,
                })
            }
            Transition::NoChange => Ok(TransitionOutcome {
                transition,
                config: config.clone(),
                report: None,
            }),
        }
    }

    /// Detect and apply in one step
    pub async fn process(&self, config: &BotConfig, directive: Option<&Decision>) -> GridResult<TransitionOutcome> {
        let transition = self.detect(config, directive).await?;
        self.apply(config, transition, directive).await
    }

    /// Build the ladder and mark the bot running.
    ///
    /// If the exchange already holds orders for the pair only the status is
    /// updated.
    pub async fn activate(&self, config: &BotConfig, decision: Decision) -> GridResult<TransitionOutcome> {
        let existing = self.ladder.exchange().get_open_orders(&config.pair).await?;
        if !existing.is_empty() {
            info!(
                "{}: activation with {} orders already on the book, status only",
                config.pair,
                existing.len()
            );
            let updated = self
                .repository
                .update_bot_status(&config.pair, true, Some(decision))
                .await?;
            return Ok(TransitionOutcome {
                transition: Transition::Activate,
                config: updated,
                report: None,
            });
        }

        let report = self.ladder.build(config).await?;
        self.announce_trades(&report.settled_trades);
        if report.orders_placed() == 0 {
            self.notifier.notify(Notification::Error {
                context: format!("activate {}", config.pair),
                message: format!(
                    "no orders could be placed ({} skipped, {} failed)",
                    report.skipped, report.failed
                ),
            });
            return Err(GridError::InvalidState {
                current_state: format!("{}: ladder build placed no orders", config.pair),
            });
        }

        let updated = self
            .repository
            .update_bot_status(&config.pair, true, Some(decision))
            .await?;
        info!("{}: activated with {} orders", config.pair, report.orders_placed());
        self.notifier.notify(Notification::BotStatus {
            pair: config.pair.clone(),
            status: "ACTIVATED".into(),
            detail: format!(
                "Reference {:.4}, {} buys / {} sells, capital {:.2}",
                report.reference_price, report.buys_placed, report.sells_placed, report.capital
            ),
        });

        Ok(TransitionOutcome {
            transition: Transition::Activate,
            config: updated,
            report: Some(report),
        })
    }

    /// Cancel every order and mark the bot not running; the position stays
    pub async fn pause(&self, config: &BotConfig, decision: Decision) -> GridResult<TransitionOutcome> {
        let teardown = self.ladder.teardown(config).await?;
        self.announce_trades(&teardown.trades);
        let updated = self
            .repository
            .update_bot_status(&config.pair, false, Some(decision))
            .await?;

        info!(
            "{}: paused, {} orders cancelled, {} late fills settled",
            config.pair, teardown.cancelled, teardown.fills_settled
        );
        self.notifier.notify(Notification::BotStatus {
            pair: config.pair.clone(),
            status: "PAUSED".into(),
            detail: format!("{} orders cancelled, position kept", teardown.cancelled),
        });

        Ok(TransitionOutcome {
            transition: Transition::Pause,
            config: updated,
            report: None,
        })
    }

    /// Rebuild the ladder of a running bot
    pub async fn initialize_orders(&self, config: &BotConfig) -> GridResult<TransitionOutcome> {
        let report = self.ladder.build(config).await?;
        self.announce_trades(&report.settled_trades);
        self.notifier.notify(Notification::BotStatus {
            pair: config.pair.clone(),
            status: "ORDERS REINITIALIZED".into(),
            detail: format!(
                "{} buys / {} sells around {:.4}",
                report.buys_placed, report.sells_placed, report.reference_price
            ),
        });

        Ok(TransitionOutcome {
            transition: Transition::InitializeOrders,
            config: config.clone(),
            report: Some(report),
        })
    }

    fn announce_trades(&self, trades: &[GridTrade]) {
        for trade in trades {
            self.notifier.notify(Notification::TradeCompleted(trade.clone()));
        }
    }
}

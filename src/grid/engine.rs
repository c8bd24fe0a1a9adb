//! Engine scheduler
//!
//! Owns every component and drives four timers: directive transitions,
//! reconciliation, risk and the periodic summary. Each bot has its own lock so
//! ladder mutations for one bot are sequential while bots run in parallel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::config::{BotConfig, EngineConfig};
use super::decision::DecisionSource;
use super::errors::{GridError, GridResult};
use super::exchange::{ExchangeGateway, ExchangeService};
use super::ladder::LadderBuilder;
use super::mode::{ModeSwitchReport, ModeSwitcher, ModeSwitchingGateway, TradingMode};
use super::notifier::{Notification, Notifier};
use super::pnl::PnlSummary;
use super::reconciliation::{ReconcileReport, ReconciliationLoop};
use super::repository::GridRepository;
use super::restart::{RestartSafetyCheck, RestartSafetyReport};
use super::retry::{Clock, RetryPolicy};
use super::risk::{RiskAction, RiskManager};
use super::transitions::{Transition, TransitionManager};
use super::types::BotPhase;

/// Operator requests delivered to a running engine
#[derive(Debug)]
pub enum EngineCommand {
    ForceReconcile {
        reply: Option<oneshot::Sender<Vec<ReconcileReport>>>,
    },
    SwitchMode {
        mode: TradingMode,
        reply: Option<oneshot::Sender<GridResult<ModeSwitchReport>>>,
    },
}

/// Sending side of the engine's command and shutdown channels
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Receiving side, consumed by [`GridEngine::run`]
pub struct EngineChannels {
    pub commands: mpsc::Receiver<EngineCommand>,
    pub shutdown: watch::Receiver<bool>,
}

pub fn engine_channels(buffer: usize) -> (EngineHandle, EngineChannels) {
    let (command_tx, command_rx) = mpsc::channel(buffer.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    (
        EngineHandle {
            commands: command_tx,
            shutdown: Arc::new(shutdown_tx),
        },
        EngineChannels {
            commands: command_rx,
            shutdown: shutdown_rx,
        },
    )
}

impl EngineHandle {
    pub async fn force_reconcile(&self) -> GridResult<Vec<ReconcileReport>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::ForceReconcile { reply: Some(reply) }).await?;
        rx.await
            .map_err(|_| GridError::InvalidState { current_state: "engine stopped".into() })
    }

    pub async fn switch_mode(&self, mode: TradingMode) -> GridResult<ModeSwitchReport> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::SwitchMode { mode, reply: Some(reply) }).await?;
        rx.await
            .map_err(|_| GridError::InvalidState { current_state: "engine stopped".into() })?
    }

    /// Ask the loop to exit after the cycle in progress
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn send(&self, command: EngineCommand) -> GridResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GridError::InvalidState { current_state: "engine stopped".into() })
    }
}

#[derive(Debug, Clone)]
struct BotRuntime {
    phase: BotPhase,
    cycles: u64,
    errors: u64,
    consecutive_errors: u32,
    last_error: Option<String>,
    last_reconciled_at: Option<DateTime<Utc>>,
}

impl Default for BotRuntime {
    fn default() -> Self {
        Self {
            phase: BotPhase::Stopped,
            cycles: 0,
            errors: 0,
            consecutive_errors: 0,
            last_error: None,
            last_reconciled_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    last_tick: Option<DateTime<Utc>>,
    cycles: u64,
    bots: BTreeMap<String, BotRuntime>,
    flagged: BTreeSet<String>,
}

/// Per-bot entry in the status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BotStatusView {
    pub pair: String,
    pub is_running: bool,
    pub phase: BotPhase,
    pub last_decision: Option<String>,
    pub open_orders: usize,
    pub total_capital: f64,
    pub cycles: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub flagged_for_review: bool,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: TradingMode,
    pub exchange: String,
    pub started_at: DateTime<Utc>,
    pub last_tick: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub bots: Vec<BotStatusView>,
    pub flagged_for_review: Vec<String>,
    pub pnl: PnlSummary,
}

pub struct GridEngine {
    settings: EngineConfig,
    gateway: Arc<ModeSwitchingGateway>,
    exchange: Arc<ExchangeService>,
    repository: Arc<dyn GridRepository>,
    decisions: Arc<dyn DecisionSource>,
    notifier: Notifier,
    transitions: TransitionManager,
    reconciler: ReconciliationLoop,
    risk: RiskManager,
    restart: Arc<RestartSafetyCheck>,
    switcher: ModeSwitcher,
    bot_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    state: RwLock<EngineState>,
    started_at: DateTime<Utc>,
}

impl GridEngine {
    pub fn new(
        settings: EngineConfig,
        gateway: Arc<ModeSwitchingGateway>,
        clock: Arc<dyn Clock>,
        repository: Arc<dyn GridRepository>,
        decisions: Arc<dyn DecisionSource>,
        notifier: Notifier,
    ) -> Self {
        let write_policy = RetryPolicy::new(settings.write_max_attempts, settings.write_base_delay_ms);
        let sell_policy = RetryPolicy::new(settings.sell_position_attempts, settings.write_base_delay_ms);
        let started_at = clock.now();
        let exchange = Arc::new(ExchangeService::new(gateway.clone(), clock).with_retry(write_policy, sell_policy));

        let ladder = Arc::new(LadderBuilder::new(exchange.clone(), repository.clone(), settings.clone()));
        let transitions = TransitionManager::new(ladder.clone(), repository.clone(), notifier.clone(), settings.clone());
        let reconciler = ReconciliationLoop::new(ladder.clone(), repository.clone(), notifier.clone(), settings.clone());
        let risk = RiskManager::new(ladder.clone(), repository.clone(), notifier.clone());
        let restart = Arc::new(RestartSafetyCheck::new(
            ladder.clone(),
            repository.clone(),
            notifier.clone(),
            settings.clone(),
        ));
        let switcher = ModeSwitcher::new(gateway.clone(), ladder, repository.clone(), restart.clone(), notifier.clone());

        Self {
            settings,
            gateway,
            exchange,
            repository,
            decisions,
            notifier,
            transitions,
            reconciler,
            risk,
            restart,
            switcher,
            bot_locks: Mutex::new(HashMap::new()),
            state: RwLock::new(EngineState::default()),
            started_at,
        }
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn mode(&self) -> TradingMode {
        self.gateway.mode()
    }

    pub fn exchange(&self) -> &Arc<ExchangeService> {
        &self.exchange
    }

    pub fn repository(&self) -> &Arc<dyn GridRepository> {
        &self.repository
    }

    /// Register bots that are not stored yet; stored bots keep their status
    pub async fn register_bots(&self, bots: &[BotConfig]) -> GridResult<usize> {
        let mut added = 0;
        for bot in bots {
            bot.validate()?;
            if self.repository.get_config(&bot.pair).await?.is_none() {
                self.repository.save_config(bot).await?;
                info!("Registered bot {} with capital {:.2}", bot.pair, bot.total_capital);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Restart safety check plus the startup notification
    pub async fn startup(&self) -> GridResult<RestartSafetyReport> {
        let report = self.restart.run().await?;
        let bots = self.repository.get_all_configs().await?.len();
        self.notifier.notify(Notification::Startup {
            bots,
            mode: self.gateway.mode().to_string(),
        });
        if !report.is_safe_to_continue {
            warn!("Restart safety check found problems; review before activating bots");
        }
        Ok(report)
    }

    async fn lock_bot(&self, pair: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.bot_locks.lock().await;
            locks.entry(pair.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Evaluate directives for every configured bot
    pub async fn run_transition_cycle(&self) -> Vec<(String, GridResult<Transition>)> {
        let configs = match self.repository.get_all_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Transition cycle could not load configs: {}", e);
                return Vec::new();
            }
        };

        let results = join_all(configs.iter().map(|c| self.transition_bot(&c.pair))).await;
        let changed = results
            .iter()
            .any(|(_, r)| matches!(r, Ok(t) if !matches!(t, Transition::NoChange | Transition::NeedsReview { .. })));
        if changed {
            self.reconciler.invalidate_cache().await;
        }
        results
    }

    async fn transition_bot(&self, pair: &str) -> (String, GridResult<Transition>) {
        let _guard = self.lock_bot(pair).await;
        let result = self.transition_bot_locked(pair).await;
        self.record_result(pair, result.as_ref().map(|_| ()).map_err(|e| e.clone())).await;
        (pair.to_string(), result)
    }

    async fn transition_bot_locked(&self, pair: &str) -> GridResult<Transition> {
        let config = self
            .repository
            .get_config(pair)
            .await?
            .ok_or_else(|| GridError::BotNotFound(pair.to_string()))?;
        let directive = self.decisions.current_decision(pair).await?;

        let transition = self.transitions.detect(&config, directive.as_ref()).await?;
        let transient_phase = match transition {
            Transition::Activate | Transition::InitializeOrders => Some(BotPhase::Activating),
            Transition::Pause => Some(BotPhase::Pausing),
            _ => None,
        };
        if let Some(phase) = transient_phase {
            self.set_phase(pair, phase).await;
        }

        let outcome = self
            .transitions
            .apply(&config, transition.clone(), directive.as_ref())
            .await;
        let running = match &outcome {
            Ok(o) => o.config.is_running,
            Err(_) => config.is_running,
        };
        self.set_phase(pair, BotPhase::from_running(running)).await;
        outcome?;

        let mut state = self.state.write().await;
        if matches!(transition, Transition::NeedsReview { .. }) {
            state.flagged.insert(pair.to_string());
        } else if transition != Transition::NoChange {
            state.flagged.remove(pair);
        }
        if transition != Transition::NoChange {
            info!("{}: transition {:?}", pair, transition);
        }
        Ok(transition)
    }

    /// Risk check then reconciliation for every running bot
    pub async fn run_reconciliation_cycle(&self) -> Vec<ReconcileReport> {
        let configs = match self.reconciler.active_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Reconciliation cycle could not load configs: {}", e);
                return Vec::new();
            }
        };

        let results = join_all(configs.iter().map(|c| self.reconcile_bot(&c.pair))).await;
        self.mark_tick().await;
        results.into_iter().flatten().collect()
    }

    async fn reconcile_bot(&self, pair: &str) -> Option<ReconcileReport> {
        let _guard = self.lock_bot(pair).await;
        let result = self.reconcile_bot_locked(pair).await;
        self.record_result(pair, result.as_ref().map(|_| ()).map_err(|e| e.clone())).await;
        match result {
            Ok(report) => report,
            Err(e) => {
                error!("{}: reconciliation failed: {}", pair, e);
                None
            }
        }
    }

    async fn reconcile_bot_locked(&self, pair: &str) -> GridResult<Option<ReconcileReport>> {
        let Some(config) = self.repository.get_config(pair).await? else {
            return Ok(None);
        };
        if !config.is_running {
            return Ok(None);
        }

        let action = self.risk.evaluate(&config).await?;
        if !action.is_none() {
            self.after_risk_action(pair, &action).await;
            return Ok(None);
        }

        let report = self.reconciler.reconcile_bot(&config).await?;
        let now = self.exchange.clock().now();
        self.state.write().await.bots.entry(pair.to_string()).or_default().last_reconciled_at = Some(now);
        Ok(Some(report))
    }

    /// Risk evaluation only, for every running bot
    pub async fn run_risk_cycle(&self) -> Vec<(String, RiskAction)> {
        let configs = match self.reconciler.active_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Risk cycle could not load configs: {}", e);
                return Vec::new();
            }
        };

        let results = join_all(configs.iter().map(|c| self.risk_bot(&c.pair))).await;
        results.into_iter().flatten().collect()
    }

    async fn risk_bot(&self, pair: &str) -> Option<(String, RiskAction)> {
        let _guard = self.lock_bot(pair).await;
        let config = match self.repository.get_config(pair).await {
            Ok(Some(config)) if config.is_running => config,
            Ok(_) => return None,
            Err(e) => {
                self.record_result(pair, Err(e)).await;
                return None;
            }
        };

        match self.risk.evaluate(&config).await {
            Ok(action) => {
                self.record_result(pair, Ok(())).await;
                if !action.is_none() {
                    self.after_risk_action(pair, &action).await;
                }
                Some((pair.to_string(), action))
            }
            Err(e) => {
                error!("{}: risk check failed: {}", pair, e);
                self.record_result(pair, Err(e)).await;
                None
            }
        }
    }

    async fn after_risk_action(&self, pair: &str, action: &RiskAction) {
        if let RiskAction::StopLoss { .. } = action {
            self.set_phase(pair, BotPhase::Stopped).await;
            self.reconciler.invalidate_cache().await;
        }
    }

    /// Realized P&L summary, also sent as a notification
    pub async fn send_summary(&self) -> GridResult<PnlSummary> {
        let trades = self.repository.get_trades(None).await?;
        let pnl = PnlSummary::from_trades(&trades);
        let active_bots = self.repository.get_active_configs().await?.len();
        self.notifier.notify(Notification::GridSummary {
            active_bots,
            pnl: pnl.clone(),
        });
        Ok(pnl)
    }

    /// Switch venue with every bot locked
    pub async fn switch_mode(&self, mode: TradingMode) -> GridResult<ModeSwitchReport> {
        let configs = self.repository.get_all_configs().await?;
        let mut pairs: Vec<String> = configs.into_iter().map(|c| c.pair).collect();
        pairs.sort();

        let mut guards = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            guards.push(self.lock_bot(pair).await);
        }

        let result = self.switcher.switch(mode).await;
        self.reconciler.invalidate_cache().await;
        match &result {
            Ok(report) => {
                let mut state = self.state.write().await;
                state.flagged.clear();
                for pair in &pairs {
                    state.bots.entry(pair.clone()).or_default().phase = BotPhase::Stopped;
                }
                info!(
                    "Mode switched to {}, {} bots stopped until reactivated",
                    report.to, report.bots_stopped
                );
            }
            Err(e) => {
                error!("Mode switch to {} failed: {}", mode, e);
                self.notifier.notify(Notification::Error {
                    context: "mode switch".into(),
                    message: e.to_string(),
                });
            }
        }
        drop(guards);
        result
    }

    pub async fn status(&self) -> GridResult<EngineStatus> {
        let configs = self.repository.get_all_configs().await?;
        let trades = self.repository.get_trades(None).await?;
        let state = self.state.read().await;

        let mut bots = Vec::with_capacity(configs.len());
        for config in configs {
            let open_orders = self.repository.get_open_orders(&config.pair).await?.len();
            let runtime = state.bots.get(&config.pair).cloned().unwrap_or_else(|| BotRuntime {
                phase: BotPhase::from_running(config.is_running),
                ..Default::default()
            });
            bots.push(BotStatusView {
                flagged_for_review: state.flagged.contains(&config.pair),
                last_decision: config.last_decision.as_ref().map(|d| d.to_string()),
                pair: config.pair,
                is_running: config.is_running,
                phase: runtime.phase,
                open_orders,
                total_capital: config.total_capital,
                cycles: runtime.cycles,
                errors: runtime.errors,
                consecutive_errors: runtime.consecutive_errors,
                last_error: runtime.last_error,
                last_reconciled_at: runtime.last_reconciled_at,
            });
        }

        Ok(EngineStatus {
            mode: self.gateway.mode(),
            exchange: self.gateway.name().to_string(),
            started_at: self.started_at,
            last_tick: state.last_tick,
            cycles: state.cycles,
            bots,
            flagged_for_review: state.flagged.iter().cloned().collect(),
            pnl: PnlSummary::from_trades(&trades),
        })
    }

    /// Seconds since the last completed reconciliation cycle
    pub async fn seconds_since_tick(&self) -> Option<i64> {
        let last = self.state.read().await.last_tick?;
        Some((self.exchange.clock().now() - last).num_seconds())
    }

    async fn set_phase(&self, pair: &str, phase: BotPhase) {
        self.state.write().await.bots.entry(pair.to_string()).or_default().phase = phase;
    }

    async fn mark_tick(&self) {
        let now = self.exchange.clock().now();
        let mut state = self.state.write().await;
        state.last_tick = Some(now);
        state.cycles += 1;
    }

    async fn record_result(&self, pair: &str, result: GridResult<()>) {
        let alert = {
            let mut state = self.state.write().await;
            let runtime = state.bots.entry(pair.to_string()).or_default();
            runtime.cycles += 1;
            match result {
                Ok(()) => {
                    runtime.consecutive_errors = 0;
                    None
                }
                Err(e) => {
                    runtime.errors += 1;
                    runtime.consecutive_errors += 1;
                    runtime.last_error = Some(e.to_string());
                    (runtime.consecutive_errors == self.settings.max_consecutive_errors)
                        .then(|| (runtime.consecutive_errors, e.to_string()))
                }
            }
        };

        if let Some((count, message)) = alert {
            warn!("{}: {} consecutive failed cycles", pair, count);
            self.notifier.notify(Notification::Error {
                context: format!("{} ({} consecutive failures)", pair, count),
                message,
            });
        }
    }

    async fn handle_command(&self, command: EngineCommand) {
        match command {
            EngineCommand::ForceReconcile { reply } => {
                info!("Forced reconciliation requested");
                self.reconciler.invalidate_cache().await;
                let reports = self.run_reconciliation_cycle().await;
                if let Some(reply) = reply {
                    let _ = reply.send(reports);
                }
            }
            EngineCommand::SwitchMode { mode, reply } => {
                let result = self.switch_mode(mode).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// Main loop; returns once shutdown is requested and the cycle in
    /// progress has finished.
    pub async fn run(&self, channels: EngineChannels) -> GridResult<()> {
        let EngineChannels {
            mut commands,
            mut shutdown,
        } = channels;

        let period = |secs: u64| Duration::from_secs(secs.max(1));
        let now = Instant::now();
        let mut transition_timer = interval_at(now, period(self.settings.monitoring_interval_secs));
        let mut reconcile_timer = interval_at(now, period(self.settings.reconciliation_interval_secs));
        let mut risk_timer = interval_at(now, period(self.settings.risk_interval_secs));
        let summary_period = period(self.settings.summary_interval_secs);
        let mut summary_timer = interval_at(now + summary_period, summary_period);
        for timer in [
            &mut transition_timer,
            &mut reconcile_timer,
            &mut risk_timer,
            &mut summary_timer,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!("Grid engine running in {} mode", self.gateway.mode());
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                _ = transition_timer.tick() => {
                    let results = self.run_transition_cycle().await;
                    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                    debug!("Transition cycle: {} bots, {} failed", results.len(), failed);
                }
                _ = risk_timer.tick() => {
                    self.run_risk_cycle().await;
                }
                _ = reconcile_timer.tick() => {
                    self.run_reconciliation_cycle().await;
                }
                _ = summary_timer.tick() => {
                    if let Err(e) = self.send_summary().await {
                        warn!("Summary failed: {}", e);
                    }
                }
            }
        }

        info!("Grid engine stopped");
        self.notifier.flush().await;
        Ok(())
    }
}

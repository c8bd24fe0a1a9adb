//! Local persistence for bot configs, orders, steps and trades

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::config::BotConfig;
use super::errors::{GridError, GridResult};
use super::types::{Decision, GridOrder, GridStep, GridTrade, OrderSide, OrderStatus};

/// Source of truth for local state.
///
/// Every method is a single atomic read-modify-write so the reconciliation
/// loop and the transition manager can share one store.
#[async_trait]
pub trait GridRepository: Send + Sync {
    async fn get_all_configs(&self) -> GridResult<Vec<BotConfig>>;

    /// Configs with `is_running == true`
    async fn get_active_configs(&self) -> GridResult<Vec<BotConfig>>;

    async fn get_config(&self, pair: &str) -> GridResult<Option<BotConfig>>;

    async fn save_config(&self, config: &BotConfig) -> GridResult<()>;

    /// Set running flag and decision, returning the updated config
    async fn update_bot_status(
        &self,
        pair: &str,
        is_running: bool,
        decision: Option<Decision>,
    ) -> GridResult<BotConfig>;

    /// Insert or replace an order by local id
    async fn save_order(&self, order: &GridOrder) -> GridResult<()>;

    async fn get_orders(&self, pair: &str) -> GridResult<Vec<GridOrder>>;

    async fn get_open_orders(&self, pair: &str) -> GridResult<Vec<GridOrder>>;

    async fn get_order_by_exchange_id(&self, pair: &str, exchange_order_id: &str) -> GridResult<Option<GridOrder>>;

    /// Mark an open order filled; returns `None` if it was already closed
    async fn mark_order_filled(
        &self,
        pair: &str,
        exchange_order_id: &str,
        filled_at: DateTime<Utc>,
    ) -> GridResult<Option<GridOrder>>;

    async fn mark_order_cancelled(&self, pair: &str, exchange_order_id: &str) -> GridResult<bool>;

    /// Mark every open order of a pair cancelled
    async fn cancel_open_orders(&self, pair: &str) -> GridResult<u32>;

    /// Most recent filled buy for a pair
    async fn get_last_filled_buy(&self, pair: &str) -> GridResult<Option<GridOrder>>;

    /// Replace all steps of a pair
    async fn replace_steps(&self, pair: &str, steps: &[GridStep]) -> GridResult<()>;

    async fn get_step(&self, pair: &str, level: u32) -> GridResult<Option<GridStep>>;

    async fn get_steps(&self, pair: &str) -> GridResult<Vec<GridStep>>;

    async fn save_step(&self, step: &GridStep) -> GridResult<()>;

    /// Append a completed round trip; trades are immutable once written
    async fn save_trade(&self, trade: &GridTrade) -> GridResult<()>;

    /// Trades for one pair, or all trades when `pair` is `None`
    async fn get_trades(&self, pair: Option<&str>) -> GridResult<Vec<GridTrade>>;
}

/// Serializable snapshot of every table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub configs: BTreeMap<String, BotConfig>,
    pub orders: BTreeMap<String, GridOrder>,
    pub steps: BTreeMap<String, BTreeMap<u32, GridStep>>,
    pub trades: Vec<GridTrade>,
}

impl RepositorySnapshot {
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save to file atomically (write to temp, then rename)
    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn pair_orders<'a>(&'a self, pair: &'a str) -> impl Iterator<Item = &'a GridOrder> + 'a {
        self.orders.values().filter(move |o| o.pair == pair)
    }

    /// Drop cancelled orders created before `cutoff`, returning how many went
    pub fn prune_cancelled(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.orders.len();
        self.orders
            .retain(|_, o| o.status != OrderStatus::Cancelled || o.created_at >= cutoff);
        before - self.orders.len()
    }

    fn find_by_exchange_id_mut(&mut self, pair: &str, exchange_order_id: &str) -> Option<&mut GridOrder> {
        self.orders
            .values_mut()
            .find(|o| o.pair == pair && o.exchange_order_id.as_deref() == Some(exchange_order_id))
    }
}

/// In-memory repository with optional JSON snapshot persistence
pub struct LocalRepository {
    data: RwLock<RepositorySnapshot>,
    path: Option<PathBuf>,
    cancelled_retention: Option<Duration>,
    failing_writes: AtomicU32,
}

impl LocalRepository {
    /// Volatile store, nothing touches disk
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(RepositorySnapshot::default()),
            path: None,
            cancelled_retention: None,
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Load the snapshot at `path` if it exists, otherwise start empty
    pub fn open(path: impl Into<PathBuf>) -> GridResult<Self> {
        let path = path.into();
        let snapshot = if path.exists() {
            let snapshot = RepositorySnapshot::load_from_file(&path)?;
            info!(
                "Loaded repository from {:?}: {} bots, {} orders, {} trades",
                path,
                snapshot.configs.len(),
                snapshot.orders.len(),
                snapshot.trades.len()
            );
            snapshot
        } else {
            info!("No repository at {:?}, starting empty", path);
            RepositorySnapshot::default()
        };

        Ok(Self {
            data: RwLock::new(snapshot),
            path: Some(path),
            cancelled_retention: None,
            failing_writes: AtomicU32::new(0),
        })
    }

    /// Forget cancelled orders once they are older than `retention`.
    ///
    /// Filled orders and trades are never pruned.
    pub fn with_cancelled_retention(mut self, retention: Duration) -> Self {
        self.cancelled_retention = Some(retention);
        self
    }

    /// Simulate storage outages: the next `n` writes fail
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Copy of the current tables
    pub async fn snapshot(&self) -> RepositorySnapshot {
        self.data.read().await.clone()
    }

    /// Run a mutation under the write lock and persist the result
    async fn write<F, R>(&self, f: F) -> GridResult<R>
    where
        F: FnOnce(&mut RepositorySnapshot) -> GridResult<R>,
    {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GridError::Persistence("simulated write failure".into()));
        }

        let mut data = self.data.write().await;
        let mut staged = data.clone();
        let result = f(&mut staged)?;

        if let Some(retention) = self.cancelled_retention {
            let pruned = staged.prune_cancelled(Utc::now() - retention);
            if pruned > 0 {
                debug!("Pruned {} cancelled orders", pruned);
            }
        }

        if let Some(path) = self.path.clone() {
            // Serialization and file IO stay off the async workers
            staged = tokio::task::spawn_blocking(move || {
                staged.save_to_file_atomic(&path)?;
                debug!("Repository saved to {:?}", path);
                Ok::<_, GridError>(staged)
            })
            .await
            .map_err(|e| GridError::Persistence(format!("snapshot writer failed: {}", e)))??;
        }

        *data = staged;
        Ok(result)
    }
}

#[async_trait]
impl GridRepository for LocalRepository {
    async fn get_all_configs(&self) -> GridResult<Vec<BotConfig>> {
        Ok(self.data.read().await.configs.values().cloned().collect())
    }

    async fn get_active_configs(&self) -> GridResult<Vec<BotConfig>> {
        Ok(self
            .data
            .read()
            .await
            .configs
            .values()
            .filter(|c| c.is_running)
            .cloned()
            .collect())
    }

    async fn get_config(&self, pair: &str) -> GridResult<Option<BotConfig>> {
        Ok(self.data.read().await.configs.get(pair).cloned())
    }

    async fn save_config(&self, config: &BotConfig) -> GridResult<()> {
        config.validate()?;
        let config = config.clone();
        self.write(move |data| {
            data.configs.insert(config.pair.clone(), config);
            Ok(())
        })
        .await
    }

    async fn update_bot_status(
        &self,
        pair: &str,
        is_running: bool,
        decision: Option<Decision>,
    ) -> GridResult<BotConfig> {
        self.write(|data| {
            let config = data
                .configs
                .get_mut(pair)
                .ok_or_else(|| GridError::BotNotFound(pair.to_string()))?;
            config.is_running = is_running;
            if decision.is_some() {
                config.last_decision = decision;
            }
            config.updated_at = Utc::now();
            Ok(config.clone())
        })
        .await
    }

    async fn save_order(&self, order: &GridOrder) -> GridResult<()> {
        let order = order.clone();
        self.write(move |data| {
            data.orders.insert(order.id.clone(), order);
            Ok(())
        })
        .await
    }

    async fn get_orders(&self, pair: &str) -> GridResult<Vec<GridOrder>> {
        let data = self.data.read().await;
        let mut orders: Vec<GridOrder> = data.pair_orders(pair).cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn get_open_orders(&self, pair: &str) -> GridResult<Vec<GridOrder>> {
        let data = self.data.read().await;
        Ok(data.pair_orders(pair).filter(|o| o.is_open()).cloned().collect())
    }

    async fn get_order_by_exchange_id(&self, pair: &str, exchange_order_id: &str) -> GridResult<Option<GridOrder>> {
        let data = self.data.read().await;
        let found = data
            .pair_orders(pair)
            .find(|o| o.exchange_order_id.as_deref() == Some(exchange_order_id))
            .cloned();
        Ok(found)
    }

    async fn mark_order_filled(
        &self,
        pair: &str,
        exchange_order_id: &str,
        filled_at: DateTime<Utc>,
    ) -> GridResult<Option<GridOrder>> {
        self.write(|data| {
            let order = data
                .find_by_exchange_id_mut(pair, exchange_order_id)
                .ok_or_else(|| GridError::OrderNotFound(exchange_order_id.to_string()))?;
            if order.status != OrderStatus::Open {
                return Ok(None);
            }
            order.status = OrderStatus::Filled;
            order.filled_at = Some(filled_at);
            Ok(Some(order.clone()))
        })
        .await
    }

    async fn mark_order_cancelled(&self, pair: &str, exchange_order_id: &str) -> GridResult<bool> {
        self.write(|data| match data.find_by_exchange_id_mut(pair, exchange_order_id) {
            Some(order) if order.status == OrderStatus::Open => {
                order.status = OrderStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                warn!("Cancel for unknown order {} on {}", exchange_order_id, pair);
                Ok(false)
            }
        })
        .await
    }

    async fn cancel_open_orders(&self, pair: &str) -> GridResult<u32> {
        self.write(|data| {
            let mut count = 0;
            for order in data.orders.values_mut() {
                if order.pair == pair && order.status == OrderStatus::Open {
                    order.status = OrderStatus::Cancelled;
                    count += 1;
                }
            }
            Ok(count)
        })
        .await
    }

    async fn get_last_filled_buy(&self, pair: &str) -> GridResult<Option<GridOrder>> {
        let data = self.data.read().await;
        let last = data
            .pair_orders(pair)
            .filter(|o| o.side == OrderSide::Buy && o.status == OrderStatus::Filled)
            .max_by_key(|o| o.filled_at.unwrap_or(o.created_at))
            .cloned();
        Ok(last)
    }

    async fn replace_steps(&self, pair: &str, steps: &[GridStep]) -> GridResult<()> {
        let steps: BTreeMap<u32, GridStep> = steps.iter().map(|s| (s.level, s.clone())).collect();
        self.write(move |data| {
            data.steps.insert(pair.to_string(), steps);
            Ok(())
        })
        .await
    }

    async fn get_step(&self, pair: &str, level: u32) -> GridResult<Option<GridStep>> {
        let data = self.data.read().await;
        Ok(data.steps.get(pair).and_then(|s| s.get(&level)).cloned())
    }

    async fn get_steps(&self, pair: &str) -> GridResult<Vec<GridStep>> {
        let data = self.data.read().await;
        Ok(data
            .steps
            .get(pair)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_step(&self, step: &GridStep) -> GridResult<()> {
        let step = step.clone();
        self.write(move |data| {
            data.steps
                .entry(step.pair.clone())
                .or_default()
                .insert(step.level, step);
            Ok(())
        })
        .await
    }

    async fn save_trade(&self, trade: &GridTrade) -> GridResult<()> {
        let trade = trade.clone();
        self.write(move |data| {
            if data.trades.iter().any(|t| t.id == trade.id) {
                return Err(GridError::DataIntegrity(format!("trade {} already recorded", trade.id)));
            }
            data.trades.push(trade);
            Ok(())
        })
        .await
    }

    async fn get_trades(&self, pair: Option<&str>) -> GridResult<Vec<GridTrade>> {
        let data = self.data.read().await;
        Ok(data
            .trades
            .iter()
            .filter(|t| pair.map_or(true, |p| t.pair == p))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn order(pair: &str, side: OrderSide, price: f64, exchange_id: &str) -> GridOrder {
        GridOrder::new(pair, side, 0.1, price, Some(0), Utc::now()).with_exchange_id(exchange_id)
    }

    #[tokio::test]
    async fn test_config_status_update() {
        let repo = LocalRepository::in_memory();
        repo.save_config(&BotConfig::new("ETH/USDT", 500.0)).await.unwrap();

        let updated = repo
            .update_bot_status("ETH/USDT", true, Some(Decision::Operate))
            .await
            .unwrap();
        assert!(updated.is_running);
        assert_eq!(updated.last_decision, Some(Decision::Operate));
        assert_eq!(repo.get_active_configs().await.unwrap().len(), 1);

        // Status-only update keeps the decision
        let paused = repo.update_bot_status("ETH/USDT", false, None).await.unwrap();
        assert_eq!(paused.last_decision, Some(Decision::Operate));

        let missing = repo.update_bot_status("BTC/USDT", true, None).await;
        assert!(matches!(missing, Err(GridError::BotNotFound(_))));
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let repo = LocalRepository::in_memory();
        repo.save_order(&order("ETH/USDT", OrderSide::Buy, 990.0, "x1")).await.unwrap();
        repo.save_order(&order("ETH/USDT", OrderSide::Sell, 1010.0, "x2")).await.unwrap();
        repo.save_order(&order("BTC/USDT", OrderSide::Buy, 50_000.0, "x3")).await.unwrap();

        assert_eq!(repo.get_open_orders("ETH/USDT").await.unwrap().len(), 2);

        let filled = repo.mark_order_filled("ETH/USDT", "x1", Utc::now()).await.unwrap();
        assert!(filled.is_some());
        // Second detection of the same fill is a no-op
        assert!(repo.mark_order_filled("ETH/USDT", "x1", Utc::now()).await.unwrap().is_none());

        let last_buy = repo.get_last_filled_buy("ETH/USDT").await.unwrap().unwrap();
        assert_eq!(last_buy.exchange_order_id.as_deref(), Some("x1"));

        assert_eq!(repo.cancel_open_orders("ETH/USDT").await.unwrap(), 1);
        assert!(repo.get_open_orders("ETH/USDT").await.unwrap().is_empty());
        assert_eq!(repo.get_open_orders("BTC/USDT").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_by_exchange_id() {
        let repo = LocalRepository::in_memory();
        repo.save_order(&order("ETH/USDT", OrderSide::Buy, 990.0, "x1")).await.unwrap();
        repo.save_order(&order("BTC/USDT", OrderSide::Buy, 50_000.0, "x1")).await.unwrap();

        let found = repo.get_order_by_exchange_id("ETH/USDT", "x1").await.unwrap().unwrap();
        assert_eq!(found.pair, "ETH/USDT");
        assert!((found.price - 990.0).abs() < 1e-9);
        assert!(repo.get_order_by_exchange_id("ETH/USDT", "x9").await.unwrap().is_none());
        assert!(repo.get_last_filled_buy("ETH/USDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_old_cancelled_orders_are_pruned() {
        let repo = LocalRepository::in_memory().with_cancelled_retention(Duration::hours(1));
        let mut stale = order("ETH/USDT", OrderSide::Buy, 980.0, "old");
        stale.created_at = Utc::now() - Duration::hours(2);
        stale.status = OrderStatus::Cancelled;
        let mut filled = order("ETH/USDT", OrderSide::Buy, 970.0, "kept");
        filled.created_at = Utc::now() - Duration::hours(2);
        filled.status = OrderStatus::Filled;
        repo.save_order(&stale).await.unwrap();
        repo.save_order(&filled).await.unwrap();

        // A fresh cancellation survives the next write
        repo.save_order(&order("ETH/USDT", OrderSide::Sell, 1010.0, "fresh")).await.unwrap();
        assert_eq!(repo.cancel_open_orders("ETH/USDT").await.unwrap(), 1);

        let orders = repo.get_orders("ETH/USDT").await.unwrap();
        let ids: Vec<_> = orders.iter().filter_map(|o| o.exchange_order_id.as_deref()).collect();
        assert_eq!(ids, vec!["kept", "fresh"]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_untouched() {
        let repo = LocalRepository::in_memory();
        repo.fail_next_writes(1);

        let result = repo.save_order(&order("ETH/USDT", OrderSide::Buy, 990.0, "x1")).await;
        assert!(matches!(result, Err(GridError::Persistence(_))));
        assert!(repo.get_orders("ETH/USDT").await.unwrap().is_empty());

        repo.save_order(&order("ETH/USDT", OrderSide::Buy, 990.0, "x1")).await.unwrap();
        assert_eq!(repo.get_orders("ETH/USDT").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let repo = Arc::new(LocalRepository::in_memory());
        repo.save_config(&BotConfig::new("ETH/USDT", 500.0)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20u32 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let now = Utc::now();
                repo.save_step(&GridStep::new("ETH/USDT", i, 1000.0 + i as f64, now))
                    .await
                    .unwrap();
                repo.update_bot_status("ETH/USDT", i % 2 == 0, None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(repo.get_steps("ETH/USDT").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_snapshot_persists_to_disk() {
        let dir = std::env::temp_dir().join(format!("grid_repo_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("repo.json");

        {
            let repo = LocalRepository::open(&path).unwrap();
            repo.save_config(&BotConfig::new("ETH/USDT", 500.0)).await.unwrap();
            repo.save_order(&order("ETH/USDT", OrderSide::Buy, 990.0, "x1")).await.unwrap();
            let trade = GridTrade::from_round_trip("ETH/USDT", "x1", 990.0, "x2", 1000.0, 0.1, Utc::now());
            repo.save_trade(&trade).await.unwrap();
        }

        let reopened = LocalRepository::open(&path).unwrap();
        assert!(reopened.get_config("ETH/USDT").await.unwrap().is_some());
        assert_eq!(reopened.get_open_orders("ETH/USDT").await.unwrap().len(), 1);
        assert_eq!(reopened.get_trades(None).await.unwrap().len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_trades_are_append_only() {
        let repo = LocalRepository::in_memory();
        let trade = GridTrade::from_round_trip("ETH/USDT", "b", 990.0, "s", 1000.0, 0.1, Utc::now());
        repo.save_trade(&trade).await.unwrap();
        assert!(repo.save_trade(&trade).await.is_err());
        assert_eq!(repo.get_trades(Some("ETH/USDT")).await.unwrap().len(), 1);
        assert!(repo.get_trades(Some("BTC/USDT")).await.unwrap().is_empty());
    }
}

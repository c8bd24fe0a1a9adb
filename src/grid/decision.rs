//! Upstream directive input

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::errors::GridResult;
use super::types::Decision;

/// Read-only view of the external decision process
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Current directive for a pair, `None` if nothing was published
    async fn current_decision(&self, pair: &str) -> GridResult<Option<Decision>>;
}

/// In-process directive table, filled from config or by an operator
#[derive(Debug, Default)]
pub struct StaticDecisionSource {
    decisions: RwLock<HashMap<String, Decision>>,
}

impl StaticDecisionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: seed a directive
    pub fn with_decision(mut self, pair: &str, decision: Decision) -> Self {
        self.decisions.get_mut().insert(pair.to_string(), decision);
        self
    }

    pub async fn set(&self, pair: &str, decision: Decision) {
        self.decisions.write().await.insert(pair.to_string(), decision);
    }

    pub async fn clear(&self, pair: &str) {
        self.decisions.write().await.remove(pair);
    }
}

#[async_trait]
impl DecisionSource for StaticDecisionSource {
    async fn current_decision(&self, pair: &str) -> GridResult<Option<Decision>> {
        Ok(self.decisions.read().await.get(pair).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticDecisionSource::new().with_decision("ETH/USDT", Decision::Operate);
        assert_eq!(
            source.current_decision("ETH/USDT").await.unwrap(),
            Some(Decision::Operate)
        );
        assert_eq!(source.current_decision("BTC/USDT").await.unwrap(), None);

        source.set("ETH/USDT", Decision::from("PAUSAR_GRID")).await;
        assert_eq!(
            source.current_decision("ETH/USDT").await.unwrap(),
            Some(Decision::Pause)
        );

        source.clear("ETH/USDT").await;
        assert_eq!(source.current_decision("ETH/USDT").await.unwrap(), None);
    }
}

//! Realized P&L derived from completed round trips

use std::collections::BTreeMap;

use serde::Serialize;

use super::types::GridTrade;

/// Totals for one pair
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PairPnl {
    pub trades: usize,
    pub profit: f64,
    pub volume: f64,
}

/// Realized profit across all bots; unrealized mark-to-market is never included
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PnlSummary {
    pub total_trades: usize,
    pub total_profit: f64,
    pub average_profit_percent: f64,
    pub by_pair: BTreeMap<String, PairPnl>,
}

impl PnlSummary {
    pub fn from_trades(trades: &[GridTrade]) -> Self {
        let mut summary = PnlSummary::default();
        let mut percent_sum = 0.0;

        for trade in trades {
            summary.total_trades += 1;
            summary.total_profit += trade.profit;
            percent_sum += trade.profit_percent;

            let entry = summary.by_pair.entry(trade.pair.clone()).or_default();
            entry.trades += 1;
            entry.profit += trade.profit;
            entry.volume += trade.amount * trade.sell_price;
        }

        if summary.total_trades > 0 {
            summary.average_profit_percent = percent_sum / summary.total_trades as f64;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_summary_from_trades() {
        let trades = vec![
            GridTrade::from_round_trip("ETH/USDT", "b1", 1000.0, "s1", 1010.0, 0.1, Utc::now()),
            GridTrade::from_round_trip("ETH/USDT", "b2", 990.0, "s2", 1000.0, 0.1, Utc::now()),
            GridTrade::from_round_trip("BTC/USDT", "b3", 50_000.0, "s3", 50_500.0, 0.01, Utc::now()),
        ];
        let summary = PnlSummary::from_trades(&trades);

        assert_eq!(summary.total_trades, 3);
        assert!((summary.total_profit - (1.0 + 1.0 + 5.0)).abs() < 1e-9);
        assert_eq!(summary.by_pair["ETH/USDT"].trades, 2);
        assert!((summary.by_pair["BTC/USDT"].profit - 5.0).abs() < 1e-9);
        assert!(summary.average_profit_percent > 0.0);
    }

    #[test]
    fn test_empty_summary() {
        let summary = PnlSummary::from_trades(&[]);
        assert_eq!(summary.total_trades, 0);
        assert_eq!(summary.average_profit_percent, 0.0);
    }
}

//! Grid math - level generation, order sizing and risk triggers
//!
//! Everything here is a pure function of its inputs so the same numbers can be
//! reproduced in tests and in post-mortems.

use super::config::BotConfig;
use super::types::{GridOrder, OrderSide, EPSILON};

/// Decimal places used for order quantities
pub const AMOUNT_DECIMALS: i32 = 6;

/// Round down to `decimals` places
pub fn quantize(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    ((value * factor) + EPSILON).floor() / factor
}

/// Round up to `decimals` places
pub fn quantize_up(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    ((value * factor) - EPSILON).ceil() / factor
}

/// Pure grid calculator
#[derive(Debug, Clone, Copy)]
pub struct GridCalculator {
    /// Exchange minimum order notional in quote currency
    min_order_value: f64,
}

impl Default for GridCalculator {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl GridCalculator {
    pub fn new(min_order_value: f64) -> Self {
        Self { min_order_value }
    }

    pub fn min_order_value(&self) -> f64 {
        self.min_order_value
    }

    /// Build `grid_levels` evenly spaced prices spanning
    /// `current_price ± price_range_percent / 2`.
    pub fn calculate_grid_levels(&self, current_price: f64, config: &BotConfig) -> Vec<f64> {
        let count = config.grid_levels as usize;
        if count == 0 || current_price <= 0.0 {
            return Vec::new();
        }
        if count == 1 {
            return vec![current_price];
        }

        let range = current_price * config.price_range_percent / 100.0;
        let lower = current_price - range / 2.0;
        let step = range / (count - 1) as f64;

        (0..count).map(|i| lower + step * i as f64).collect()
    }

    /// Per-order base quantity for `capital` spread over half the ladder.
    ///
    /// Only half the levels hold an order on a given side at once, so capital is
    /// divided by `max(1, grid_levels / 2)`. The result never falls under the
    /// minimum order notional.
    pub fn calculate_order_amount(&self, capital: f64, grid_levels: u32, current_price: f64) -> f64 {
        if current_price <= 0.0 || capital <= 0.0 {
            return 0.0;
        }

        let slots = (grid_levels / 2).max(1) as f64;
        let amount = quantize(capital / slots / current_price, AMOUNT_DECIMALS);

        if amount * current_price < self.min_order_value {
            quantize_up(self.min_order_value / current_price, AMOUNT_DECIMALS)
        } else {
            amount
        }
    }

    /// Nearest unoccupied level strictly below `current_price`.
    ///
    /// Returns `None` once the open orders passed in reach half the ladder.
    pub fn should_create_buy_order(
        &self,
        current_price: f64,
        existing_orders: &[GridOrder],
        levels: &[f64],
    ) -> Option<f64> {
        if Self::at_ceiling(existing_orders, levels) {
            return None;
        }

        levels
            .iter()
            .copied()
            .filter(|level| *level < current_price && !Self::is_occupied(*level, existing_orders))
            .fold(None, |best: Option<f64>, level| match best {
                Some(b) if b >= level => Some(b),
                _ => Some(level),
            })
    }

    /// Nearest unoccupied level strictly above `current_price`.
    pub fn should_create_sell_order(
        &self,
        current_price: f64,
        existing_orders: &[GridOrder],
        levels: &[f64],
    ) -> Option<f64> {
        if Self::at_ceiling(existing_orders, levels) {
            return None;
        }

        levels
            .iter()
            .copied()
            .filter(|level| *level > current_price && !Self::is_occupied(*level, existing_orders))
            .fold(None, |best: Option<f64>, level| match best {
                Some(b) if b <= level => Some(b),
                _ => Some(level),
            })
    }

    fn at_ceiling(existing_orders: &[GridOrder], levels: &[f64]) -> bool {
        let open = existing_orders.iter().filter(|o| o.is_open()).count();
        open >= (levels.len() / 2).max(1)
    }

    fn is_occupied(level: f64, orders: &[GridOrder]) -> bool {
        let tolerance = (level.abs() * 1e-6).max(EPSILON);
        orders
            .iter()
            .any(|o| o.is_open() && (o.price - level).abs() <= tolerance)
    }

    /// True when price dropped at least `stop_loss_percent` from the last buy
    pub fn check_stop_loss_triggered(
        &self,
        current_price: f64,
        last_buy_price: f64,
        config: &BotConfig,
    ) -> bool {
        if !config.enable_stop_loss || last_buy_price <= 0.0 {
            return false;
        }

        let drop_percent = (last_buy_price - current_price) / last_buy_price * 100.0;
        drop_percent + EPSILON >= config.stop_loss_percent
    }

    /// True when price rose `trailing_up_percent` above the highest sell level
    pub fn check_trailing_up_triggered(
        &self,
        current_price: f64,
        highest_sell_price: f64,
        config: &BotConfig,
    ) -> bool {
        if !config.trailing_up_enabled || highest_sell_price <= 0.0 {
            return false;
        }
        if current_price <= highest_sell_price {
            return false;
        }

        let rise_percent = (current_price - highest_sell_price) / highest_sell_price * 100.0;
        rise_percent + EPSILON >= config.trailing_up_percent
    }

    /// Spread between a fill and its complementary order, as a fraction
    pub fn spread(&self, config: &BotConfig) -> f64 {
        config.price_range_percent / config.grid_levels.max(1) as f64 / 100.0
    }

    /// Price of the order placed on the opposite side after a fill
    pub fn complementary_price(&self, fill_price: f64, filled_side: OrderSide, config: &BotConfig) -> f64 {
        let spread = self.spread(config);
        match filled_side {
            OrderSide::Buy => fill_price * (1.0 + spread),
            OrderSide::Sell => fill_price * (1.0 - spread),
        }
    }

    /// Highest open sell in `orders`
    pub fn highest_sell_price(&self, orders: &[GridOrder]) -> Option<f64> {
        orders
            .iter()
            .filter(|o| o.is_open() && o.side == OrderSide::Sell)
            .map(|o| o.price)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))))
    }

    /// Split levels into buy and sell halves of equal length.
    ///
    /// Both halves are ordered nearest-to-price first; any surplus on the
    /// longer side is dropped from its far end.
    pub fn split_levels(&self, levels: &[f64], current_price: f64) -> (Vec<(u32, f64)>, Vec<(u32, f64)>) {
        let mut lower: Vec<(u32, f64)> = levels
            .iter()
            .enumerate()
            .filter(|(_, p)| **p < current_price)
            .map(|(i, p)| (i as u32, *p))
            .collect();
        let mut upper: Vec<(u32, f64)> = levels
            .iter()
            .enumerate()
            .filter(|(_, p)| **p > current_price)
            .map(|(i, p)| (i as u32, *p))
            .collect();

        lower.reverse();
        let len = lower.len().min(upper.len());
        lower.truncate(len);
        upper.truncate(len);
        (lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config(levels: u32, range: f64) -> BotConfig {
        BotConfig::new("ETH/USDT", 1000.0).with_grid(levels, range)
    }

    fn open_order(side: OrderSide, price: f64) -> GridOrder {
        GridOrder::new("ETH/USDT", side, 0.01, price, None, Utc::now())
    }

    #[test]
    fn test_grid_levels_span_range() {
        let calc = GridCalculator::default();
        let levels = calc.calculate_grid_levels(1000.0, &config(10, 10.0));

        assert_eq!(levels.len(), 10);
        assert!((levels[0] - 950.0).abs() < 1e-9);
        assert!((levels[9] - 1050.0).abs() < 1e-9);

        let step = levels[1] - levels[0];
        for pair in levels.windows(2) {
            assert!(pair[1] > pair[0]);
            assert!((pair[1] - pair[0] - step).abs() < 1e-9);
        }
    }

    #[test]
    fn test_grid_levels_properties() {
        let calc = GridCalculator::default();
        for levels_count in [2u32, 3, 7, 10, 30, 101] {
            for range in [0.5, 5.0, 10.0, 40.0] {
                for price in [0.05, 1.0, 1000.0, 65_000.0] {
                    let levels = calc.calculate_grid_levels(price, &config(levels_count, range));
                    assert_eq!(levels.len(), levels_count as usize);
                    assert!(levels.windows(2).all(|w| w[1] > w[0]));
                    assert!(levels[0] < price);
                    assert!(*levels.last().unwrap() > price);
                }
            }
        }
    }

    #[test]
    fn test_order_amount_respects_min_notional() {
        let calc = GridCalculator::new(10.0);

        // 1000 over 5 slots at 1000 = 0.2 base
        let amount = calc.calculate_order_amount(1000.0, 10, 1000.0);
        assert!((amount - 0.2).abs() < 1e-9);

        // 20 over 15 slots = 1.33 quote, lifted to the 10 quote minimum
        let small = calc.calculate_order_amount(20.0, 30, 1000.0);
        assert!(small * 1000.0 >= 10.0);

        for price in [0.0123, 0.5, 3.0, 999.99, 42_000.0] {
            for capital in [1.0, 50.0, 1000.0] {
                let amount = calc.calculate_order_amount(capital, 30, price);
                assert!(amount * price >= 10.0 - 1e-9, "price {} capital {}", price, capital);
            }
        }
    }

    #[test]
    fn test_order_amount_handles_two_levels() {
        let calc = GridCalculator::new(1.0);
        let amount = calc.calculate_order_amount(100.0, 2, 10.0);
        assert!((amount - 10.0).abs() < 1e-9);
        assert_eq!(calc.calculate_order_amount(100.0, 2, 0.0), 0.0);
    }

    #[test]
    fn test_should_create_buy_order_picks_nearest_level_below() {
        let calc = GridCalculator::default();
        let levels = calc.calculate_grid_levels(1000.0, &config(10, 10.0));
        let step = levels[1] - levels[0];

        let price = calc.should_create_buy_order(1000.0, &[], &levels).unwrap();
        assert!((price - (950.0 + step * 4.0)).abs() < 1e-9);

        // Occupied level is skipped
        let existing = vec![open_order(OrderSide::Buy, price)];
        let next = calc.should_create_buy_order(1000.0, &existing, &levels).unwrap();
        assert!((next - (950.0 + step * 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_should_create_sell_order_picks_nearest_level_above() {
        let calc = GridCalculator::default();
        let levels = calc.calculate_grid_levels(1000.0, &config(10, 10.0));
        let step = levels[1] - levels[0];

        let price = calc.should_create_sell_order(1000.0, &[], &levels).unwrap();
        assert!((price - (950.0 + step * 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_should_create_respects_ceiling() {
        let calc = GridCalculator::default();
        let levels = calc.calculate_grid_levels(1000.0, &config(10, 10.0));
        let existing: Vec<GridOrder> = levels[..5]
            .iter()
            .map(|p| open_order(OrderSide::Buy, *p))
            .collect();

        assert!(calc.should_create_buy_order(1000.0, &existing, &levels).is_none());
        assert!(calc.should_create_sell_order(1000.0, &existing, &levels).is_none());

        // Cancelled orders neither occupy nor count
        let mut cancelled = existing.clone();
        for order in cancelled.iter_mut() {
            order.status = crate::grid::types::OrderStatus::Cancelled;
        }
        assert!(calc.should_create_buy_order(1000.0, &cancelled, &levels).is_some());
    }

    #[test]
    fn test_stop_loss_trigger() {
        let calc = GridCalculator::default();
        let cfg = config(10, 10.0).with_stop_loss(true, 5.0);

        assert!(calc.check_stop_loss_triggered(940.0, 1000.0, &cfg));
        assert!(!calc.check_stop_loss_triggered(960.0, 1000.0, &cfg));
        assert!(calc.check_stop_loss_triggered(950.0, 1000.0, &cfg));

        let disabled = cfg.clone().with_stop_loss(false, 5.0);
        assert!(!calc.check_stop_loss_triggered(500.0, 1000.0, &disabled));
        assert!(!calc.check_stop_loss_triggered(500.0, 0.0, &cfg));
    }

    #[test]
    fn test_trailing_up_trigger() {
        let calc = GridCalculator::default();
        let cfg = config(10, 10.0).with_trailing_up(true, 2.0);

        assert!(calc.check_trailing_up_triggered(1071.0, 1050.0, &cfg));
        assert!(!calc.check_trailing_up_triggered(1060.0, 1050.0, &cfg));
        assert!(!calc.check_trailing_up_triggered(1000.0, 1050.0, &cfg));

        let disabled = cfg.clone().with_trailing_up(false, 2.0);
        assert!(!calc.check_trailing_up_triggered(2000.0, 1050.0, &disabled));
    }

    #[test]
    fn test_complementary_price() {
        let calc = GridCalculator::default();
        let cfg = config(10, 10.0);

        // 10% over 10 levels = 1% spread
        assert!((calc.complementary_price(1000.0, OrderSide::Buy, &cfg) - 1010.0).abs() < 1e-9);
        assert!((calc.complementary_price(1000.0, OrderSide::Sell, &cfg) - 990.0).abs() < 1e-9);
    }

    #[test]
    fn test_split_levels_is_symmetric() {
        let calc = GridCalculator::default();
        let levels = calc.calculate_grid_levels(1000.0, &config(10, 10.0));
        let (lower, upper) = calc.split_levels(&levels, 1000.0);

        assert_eq!(lower.len(), 5);
        assert_eq!(upper.len(), 5);
        assert_eq!(lower[0].0, 4);
        assert_eq!(upper[0].0, 5);
        assert!(lower.iter().all(|(_, p)| *p < 1000.0));
        assert!(upper.iter().all(|(_, p)| *p > 1000.0));

        // Off-center price trims the longer side
        let (lower, upper) = calc.split_levels(&levels, 1030.0);
        assert_eq!(lower.len(), upper.len());
        assert_eq!(upper.len(), 2);
    }

    #[test]
    fn test_highest_sell_price() {
        let calc = GridCalculator::default();
        let orders = vec![
            open_order(OrderSide::Sell, 1010.0),
            open_order(OrderSide::Sell, 1040.0),
            open_order(OrderSide::Buy, 2000.0),
        ];
        assert_eq!(calc.highest_sell_price(&orders), Some(1040.0));
        assert_eq!(calc.highest_sell_price(&[]), None);
    }

    #[test]
    fn test_quantize() {
        assert!((quantize(0.1234567, 6) - 0.123456).abs() < 1e-12);
        assert!((quantize_up(0.1234561, 6) - 0.123457).abs() < 1e-12);
        assert!((quantize(0.3, 6) - 0.3).abs() < 1e-12);
    }
}

//! Capital isolation and fee-aware order checks
//!
//! Several bots share one exchange account. Each bot only ever sees a
//! [`BotBalanceView`]: a projection of the live account balances sliced down
//! to its configured capital. Spend checks run against that view, never
//! against the raw account.

use super::calculator::{quantize, AMOUNT_DECIMALS};
use super::config::BotConfig;
use super::types::{Balance, BotBalanceView, CapitalCheckResult, OrderSide, OrderValidation, EPSILON};

/// Project account balances onto one bot's allocation.
///
/// - quote alone covers the allocation: the bot gets exactly its allocation
///   in quote
/// - otherwise, if the whole account (quote + base value) covers it, the
///   quote balance is scaled by `allocated / total_account_value`
/// - otherwise the bot gets whatever quote exists
///
/// The base asset is pair-specific, so its full free balance is attributed to
/// the bot trading that pair.
pub fn bot_balance_view(config: &BotConfig, base: Balance, quote: Balance, price: f64) -> BotBalanceView {
    let allocated = config.total_capital;
    let base_balance = base.free.max(0.0);
    let raw_quote = quote.free.max(0.0);
    let base_value = base_balance * price;
    let total_account_value = raw_quote + base_value;

    let quote_balance = if raw_quote >= allocated {
        allocated
    } else if total_account_value >= allocated && total_account_value > 0.0 {
        raw_quote * (allocated / total_account_value)
    } else {
        raw_quote
    };

    BotBalanceView {
        pair: config.pair.clone(),
        allocated_capital: allocated,
        base_balance,
        quote_balance,
        base_value_usdt: base_value,
        quote_value_usdt: quote_balance,
        total_value_usdt: quote_balance + base_value,
        total_available_in_account: total_account_value,
        price,
    }
}

/// Check a spend against the bot's view.
///
/// `amount` is quote value for buys and base quantity for sells.
pub fn check_capital(config: &BotConfig, view: &BotBalanceView, amount: f64, side: OrderSide) -> CapitalCheckResult {
    let (available, currency) = match side {
        OrderSide::Buy => (view.quote_balance, config.quote_currency()),
        OrderSide::Sell => (view.base_balance, config.base_currency()),
    };

    let can_use = amount > 0.0 && amount <= available + EPSILON;
    CapitalCheckResult {
        can_use,
        requested: amount,
        available,
        currency: currency.to_string(),
        remaining: (available - amount).max(0.0),
    }
}

/// Quantity actually received after fees.
///
/// Buys pay the fee in base; sells pay it in quote, expressed back as base at
/// `price`.
pub fn net_amount_after_fees(amount: f64, price: f64, side: OrderSide, fee_rate: f64) -> f64 {
    let net = match side {
        OrderSide::Buy => amount * (1.0 - fee_rate),
        OrderSide::Sell => {
            if price <= 0.0 {
                0.0
            } else {
                amount * price * (1.0 - fee_rate) / price
            }
        }
    };
    quantize(net, AMOUNT_DECIMALS)
}

/// Reject orders whose post-fee notional falls under the exchange minimum
pub fn validate_order_after_fees(
    amount: f64,
    price: f64,
    side: OrderSide,
    fee_rate: f64,
    min_order_value: f64,
) -> OrderValidation {
    let gross_value = amount * price;
    let net_amount = net_amount_after_fees(amount, price, side, fee_rate);

    let (net_value, min_required) = match side {
        OrderSide::Buy => (gross_value, min_order_value),
        OrderSide::Sell => {
            let keep = (1.0 - fee_rate).max(EPSILON);
            (net_amount * price, min_order_value / keep)
        }
    };

    OrderValidation {
        valid: net_value + EPSILON >= min_order_value,
        gross_value,
        net_value,
        min_required,
        net_amount,
    }
}

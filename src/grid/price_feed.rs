//! Public ticker polling for the paper exchange

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::watch;

use super::errors::{GridError, GridResult};
use super::paper::PaperExchange;

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: TickerPrice,
}

/// Tickers disagree on whether the price is a string or a number
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TickerPrice {
    Text(String),
    Number(f64),
}

/// Parse a `{"price": ...}` ticker body
pub fn parse_ticker(body: &str) -> GridResult<f64> {
    let ticker: TickerResponse = serde_json::from_str(body)?;
    let price = match ticker.price {
        TickerPrice::Number(p) => p,
        TickerPrice::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| GridError::JsonParse(format!("price '{}': {}", s, e)))?,
    };
    if !price.is_finite() || price <= 0.0 {
        return Err(GridError::Exchange(format!("ticker returned unusable price {}", price)));
    }
    Ok(price)
}

/// Ticker symbol for a pair: `ETH/USDT` becomes `ETHUSDT`
pub fn ticker_symbol(pair: &str) -> String {
    pair.replace('/', "").to_uppercase()
}

/// Polls a ticker URL per pair and marks the paper book to the result.
///
/// `url_template` must contain `{symbol}`.
pub struct HttpPriceFeed {
    client: Client,
    url_template: String,
    pairs: Vec<String>,
    poll_interval: Duration,
    exchange: Arc<PaperExchange>,
}

impl HttpPriceFeed {
    pub fn new(
        url_template: impl Into<String>,
        pairs: Vec<String>,
        poll_interval: Duration,
        exchange: Arc<PaperExchange>,
    ) -> Self {
        Self {
            client: Client::new(),
            url_template: url_template.into(),
            pairs,
            poll_interval,
            exchange,
        }
    }

    fn url_for(&self, pair: &str) -> String {
        self.url_template.replace("{symbol}", &ticker_symbol(pair))
    }

    pub async fn fetch_price(&self, pair: &str) -> GridResult<f64> {
        let response = self
            .client
            .get(self.url_for(pair))
            .send()
            .await
            .map_err(|e| GridError::Exchange(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GridError::Exchange(e.to_string()))?;
        if !status.is_success() {
            return Err(GridError::Exchange(format!("ticker {} for {}: {}", status, pair, body)));
        }
        parse_ticker(&body)
    }

    /// Fetch every pair once and apply the prices; returns the number updated
    pub async fn poll_once(&self) -> usize {
        let mut updated = 0;
        for pair in &self.pairs {
            match self.fetch_price(pair).await {
                Ok(price) => {
                    let fills = self.exchange.set_price(pair, price).await;
                    debug!("{} marked at {} ({} paper fills)", pair, price, fills.len());
                    updated += 1;
                }
                Err(e) => warn!("Price feed for {} failed: {}", pair, e),
            }
        }
        updated
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Price feed polling {} pairs every {:?}", self.pairs.len(), self.poll_interval);
        let mut timer = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    self.poll_once().await;
                }
            }
        }
        info!("Price feed stopped");
    }
}

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::api::binance::SymbolInfo;
use crate::api::BinanceFuturesClient;

/// How long exchange filters stay cached.
pub const FILTER_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Order-sizing constraints for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

impl SymbolFilters {
    pub fn from_info(info: &SymbolInfo) -> Self {
        let mut step_size = 0.0;
        let mut min_qty = 0.0;
        let mut min_notional = 0.0;

        for filter in &info.filters {
            match filter.get("filterType").and_then(Value::as_str) {
                Some("LOT_SIZE") => {
                    step_size = filter_number(filter, "stepSize").unwrap_or(0.0);
                    min_qty = filter_number(filter, "minQty").unwrap_or(0.0);
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = filter_number(filter, "notional").unwrap_or(0.0);
                }
                _ => {}
            }
        }

        Self {
            step_size,
            min_qty,
            min_notional,
            price_precision: info.price_precision,
            quantity_precision: info.quantity_precision,
        }
    }

    /// Clamp a raw quantity to the exchange constraints: at least `minQty`,
    /// floored to the step, then bumped to the next step over `minNotional`.
    /// `None` when the result is not a positive quantity.
    pub fn quantize_quantity(&self, raw_qty: f64, price: f64) -> Option<f64> {
        if !raw_qty.is_finite() || !price.is_finite() || price <= 0.0 {
            return None;
        }

        let mut qty = raw_qty.max(self.min_qty);
        if self.step_size > 0.0 {
            qty = (qty / self.step_size).floor() * self.step_size;
        }

        if self.min_notional > 0.0 && qty * price < self.min_notional {
            let needed = self.min_notional / price;
            qty = if self.step_size > 0.0 {
                (needed / self.step_size).ceil() * self.step_size
            } else {
                needed
            };
        }

        (qty > 0.0).then_some(qty)
    }

    pub fn format_quantity(&self, qty: f64) -> String {
        format!("{:.*}", self.quantity_precision as usize, qty)
    }

    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.price_precision as usize, price)
    }
}

fn filter_number(filter: &Value, key: &str) -> Option<f64> {
    filter.get(key)?.as_str()?.parse::<f64>().ok()
}

/// TTL cache of per-symbol filters, refreshed from exchange info.
pub struct FilterCache {
    client: Arc<BinanceFuturesClient>,
    cache: RwLock<Option<(Instant, HashMap<String, SymbolFilters>)>>,
    ttl: Duration,
}

impl FilterCache {
    pub fn new(client: Arc<BinanceFuturesClient>) -> Self {
        Self {
            client,
            cache: RwLock::new(None),
            ttl: FILTER_CACHE_TTL,
        }
    }

    pub async fn get(&self, symbol: &str) -> Result<Option<SymbolFilters>> {
        {
            let cache = self.cache.read().await;
            if let Some((refreshed_at, filters)) = cache.as_ref() {
                if refreshed_at.elapsed() < self.ttl {
                    return Ok(filters.get(symbol).cloned());
                }
            }
        }

        let info = self.client.exchange_info().await?;
        let filters: HashMap<String, SymbolFilters> = info
            .iter()
            .map(|s| (s.symbol.clone(), SymbolFilters::from_info(s)))
            .collect();

        let result = filters.get(symbol).cloned();
        *self.cache.write().await = Some((Instant::now(), filters));
        Ok(result)
    }
}

use anyhow::Result;
use std::sync::Arc;

use super::clamp01;
use crate::api::binance::{BinanceFuturesClient, DepthSnapshot, DEPTH_LIMIT};

/// Quote value walked on each side of the book.
pub const SLIPPAGE_TARGET_QUOTE: f64 = 10_000.0;

const SPREAD_FULL_SCALE_BPS: f64 = 10.0;
const SLIPPAGE_FULL_SCALE_BPS: f64 = 20.0;
/// More than this share of the target left unfilled means the ladder is too
/// shallow to price, and the spread-only fallback applies.
const MAX_UNFILLED_FRACTION: f64 = 0.05;

/// Single-snapshot spread + walk-the-book slippage estimate, folded into a
/// penalty in [0, 1]. Strictly best-effort: any failure yields penalty 0 and
/// the symbol is kept.
#[derive(Clone)]
pub struct LiquidityProbe {
    client: Arc<BinanceFuturesClient>,
}

impl LiquidityProbe {
    pub fn new(client: Arc<BinanceFuturesClient>) -> Self {
        Self { client }
    }

    pub async fn penalty(&self, symbol: &str) -> f64 {
        match self.probe(symbol).await {
            Ok(Some(penalty)) => penalty,
            Ok(None) => 0.0,
            Err(err) => {
                tracing::debug!("Liquidity probe failed for {}: {}", symbol, err);
                0.0
            }
        }
    }

    async fn probe(&self, symbol: &str) -> Result<Option<f64>> {
        let book = self.client.book_ticker(symbol).await?;
        let depth = self.client.depth(symbol, DEPTH_LIMIT).await?;
        Ok(compute_penalty(book.bid, book.ask, &depth))
    }
}

/// Penalty from a quote + depth snapshot; `None` when the book is crossed or
/// degenerate.
pub fn compute_penalty(bid: f64, ask: f64, depth: &DepthSnapshot) -> Option<f64> {
    if !(bid > 0.0) || !(ask > 0.0) || ask <= bid {
        return None;
    }

    let mid = (bid + ask) / 2.0;
    let spread_bps = (ask - bid) / mid * 10_000.0;

    let buy_slippage = walk_side(&depth.asks, mid, true);
    let sell_slippage = walk_side(&depth.bids, mid, false);
    let slippage_bps = if buy_slippage.is_nan() || sell_slippage.is_nan() {
        f64::NAN
    } else {
        buy_slippage.max(sell_slippage)
    };

    let spread_component = clamp01(spread_bps / SPREAD_FULL_SCALE_BPS);
    let penalty = if slippage_bps.is_nan() {
        // Ladder too shallow to price the target size.
        spread_component * 0.6 + 0.4
    } else {
        spread_component * 0.6 + clamp01(slippage_bps / SLIPPAGE_FULL_SCALE_BPS) * 0.4
    };

    Some(clamp01(penalty))
}

/// Average-fill slippage in bps for consuming up to the target quote value
/// on one side; NaN when more than 5% of the target stays unfilled.
fn walk_side(levels: &[(f64, f64)], mid: f64, is_buy: bool) -> f64 {
    let mut remaining = SLIPPAGE_TARGET_QUOTE;
    let mut filled_cost = 0.0;
    let mut filled_quantity = 0.0;

    for (price, quantity) in levels {
        if *price <= 0.0 || *quantity <= 0.0 {
            continue;
        }
        let level_quote = price * quantity;
        let used_quote = level_quote.min(remaining);
        filled_cost += used_quote;
        filled_quantity += used_quote / price;
        remaining -= used_quote;
        if remaining <= 0.0 {
            break;
        }
    }

    if remaining > SLIPPAGE_TARGET_QUOTE * MAX_UNFILLED_FRACTION || filled_quantity <= 0.0 {
        return f64::NAN;
    }

    let avg_fill = filled_cost / filled_quantity;
    if is_buy {
        (avg_fill - mid) / mid * 10_000.0
    } else {
        (mid - avg_fill) / mid * 10_000.0
    }
}

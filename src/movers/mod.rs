use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::api::binance::KLINE_LIMIT;
use crate::api::BinanceFuturesClient;
use crate::metrics::score::SymbolData;
use crate::metrics::{fuse_scores, LiquidityProbe, MetricEngine};
use crate::models::{Candle, MoversResult};
use crate::universe::UniverseSelector;

/// Symbols processed concurrently per chunk; each chunk is awaited before
/// the next starts.
pub const CONCURRENCY: usize = 8;

/// Per-cycle orchestration: universe -> fan-out fetch -> metrics -> fusion.
pub struct MoversPipeline {
    client: Arc<BinanceFuturesClient>,
    universe: UniverseSelector,
    probe: LiquidityProbe,
    engine: MetricEngine,
}

impl MoversPipeline {
    pub fn new(client: Arc<BinanceFuturesClient>) -> Self {
        Self {
            universe: UniverseSelector::new(client.clone()),
            probe: LiquidityProbe::new(client.clone()),
            engine: MetricEngine::new(),
            client,
        }
    }

    /// Run one scan cycle. A universe (exchange-info) failure aborts the
    /// cycle; per-symbol failures only drop that symbol.
    pub async fn run_cycle(&mut self) -> Result<MoversResult> {
        let symbols = self.universe.symbols().await?;
        if symbols.is_empty() {
            tracing::warn!("Universe is empty, emitting empty movers result");
            return Ok(MoversResult::default());
        }

        let fetched = self.fetch_universe(&symbols).await;

        let mut survivors = Vec::new();
        for (symbol, candles, penalty) in fetched {
            let Some(last_close) = candles.last().map(|c| c.close) else {
                continue;
            };
            if !last_close.is_finite() {
                tracing::warn!("{}: non-finite last close, dropping", symbol);
                continue;
            }

            let metrics = self.engine.compute_symbol(&symbol, &candles);
            if metrics.is_empty() {
                tracing::debug!("{}: no computable timeframe, dropping", symbol);
                continue;
            }

            survivors.push(SymbolData {
                symbol,
                last_price: last_close,
                liquidity_penalty: penalty,
                metrics,
            });
        }

        tracing::info!(
            "Cycle processed {} symbols, {} survived",
            symbols.len(),
            survivors.len()
        );
        Ok(fuse_scores(survivors, Utc::now().timestamp_millis()))
    }

    /// Fetch candles and liquidity for every symbol, in awaited chunks of
    /// [`CONCURRENCY`] concurrent tasks.
    async fn fetch_universe(&self, symbols: &[String]) -> Vec<(String, Vec<Candle>, f64)> {
        let mut fetched = Vec::with_capacity(symbols.len());

        for chunk in symbols.chunks(CONCURRENCY) {
            let mut tasks = JoinSet::new();
            for symbol in chunk {
                let client = self.client.clone();
                let probe = self.probe.clone();
                let symbol = symbol.clone();
                tasks.spawn(async move {
                    let (candles, penalty) = tokio::join!(
                        client.klines(&symbol, KLINE_LIMIT),
                        probe.penalty(&symbol)
                    );
                    (symbol, candles, penalty)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((symbol, Ok(candles), penalty)) if !candles.is_empty() => {
                        fetched.push((symbol, candles, penalty));
                    }
                    Ok((symbol, Ok(_), _)) => {
                        tracing::warn!("{}: empty candle buffer, dropping", symbol);
                    }
                    Ok((symbol, Err(err), _)) => {
                        tracing::warn!("{}: candle fetch failed: {}", symbol, err);
                    }
                    Err(err) => {
                        tracing::warn!("Symbol task failed: {}", err);
                    }
                }
            }
        }

        fetched
    }
}

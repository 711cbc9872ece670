use anyhow::Result;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::api::BinanceFuturesClient;

/// Hard cap on the scan universe.
pub const MAX_SELECTED_SYMBOLS: usize = 80;
/// How long a ranked universe stays valid.
pub const VOLUME_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

struct CachedUniverse {
    symbols: Vec<String>,
    refreshed_at: Instant,
}

/// Tradable-perpetual universe ranked by 24h quote volume, cached on a TTL.
///
/// Cloneable; clones share the cache.
#[derive(Clone)]
pub struct UniverseSelector {
    client: Arc<BinanceFuturesClient>,
    cache: Arc<RwLock<Option<CachedUniverse>>>,
    ttl: Duration,
}

impl UniverseSelector {
    pub fn new(client: Arc<BinanceFuturesClient>) -> Self {
        Self::with_ttl(client, VOLUME_REFRESH_INTERVAL)
    }

    pub fn with_ttl(client: Arc<BinanceFuturesClient>, ttl: Duration) -> Self {
        Self {
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
        }
    }

    /// Current universe, refreshed when the cache has expired. An empty
    /// result is cached like any other.
    pub async fn symbols(&self) -> Result<Vec<String>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.refreshed_at.elapsed() < self.ttl {
                    return Ok(cached.symbols.clone());
                }
            }
        }

        let symbols = self.refresh().await?;
        *self.cache.write().await = Some(CachedUniverse {
            symbols: symbols.clone(),
            refreshed_at: Instant::now(),
        });
        Ok(symbols)
    }

    async fn refresh(&self) -> Result<Vec<String>> {
        let info = self.client.exchange_info().await?;
        let volumes = self.client.quote_volumes_24h().await?;

        let mut ranked: Vec<(String, f64)> = info
            .iter()
            .filter(|s| s.is_tradable_perpetual())
            .filter_map(|s| volumes.get(&s.symbol).map(|v| (s.symbol.clone(), *v)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let take = select_count(ranked.len());
        let symbols: Vec<String> = ranked.into_iter().take(take).map(|(s, _)| s).collect();

        tracing::info!("Universe refreshed: {} symbols selected", symbols.len());
        Ok(symbols)
    }
}

/// Top `min(MAX_SELECTED_SYMBOLS, ceil(total / 2))`.
fn select_count(total: usize) -> usize {
    MAX_SELECTED_SYMBOLS.min((total + 1) / 2)
}

use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::api::binance::{OrderRequest, PositionRiskRow};
use crate::api::BinanceFuturesClient;
use crate::execution::filters::{FilterCache, SymbolFilters};
use crate::models::{Direction, PositionLeg, PositionSummary};

/// Maximum number of concurrently held symbols.
pub const MAX_POSITIONS: usize = 5;
pub const DEFAULT_LEVERAGE: u32 = 5;

/// Legs smaller than this are residue to be flattened.
pub const RESIDUAL_QTY_THRESHOLD: f64 = 0.001;

const POSITION_EPSILON: f64 = 1e-6;
const PRICE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Cached account snapshot, refreshed from the exchange.
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    pub positions: HashMap<String, PositionSummary>,
}

/// One mark-price observation delivered to price-stream subscribers.
#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub mark_price: f64,
    pub time: i64,
}

/// Handle for a live price stream; dropping or unsubscribing stops the
/// underlying poller.
pub struct PriceSubscription {
    pub receiver: watch::Receiver<PriceTick>,
    task: tokio::task::JoinHandle<()>,
}

impl PriceSubscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for PriceSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of a filled (or presumed-filled) market order.
#[derive(Debug, Clone, Copy)]
pub struct ExecutedOrder {
    pub quantity: f64,
    pub avg_price: Option<f64>,
}

/// Account-state cache plus order plumbing against the exchange.
///
/// Every operation is a no-op when credentials are absent. Order failures
/// are logged and reported as `None`; callers treat that as "no action
/// taken". The exchange stays authoritative: state is re-fetched after each
/// mutating call.
pub struct TradingExecutor {
    client: Arc<BinanceFuturesClient>,
    filters: FilterCache,
    state: RwLock<AccountState>,
    configured_symbols: RwLock<HashSet<String>>,
    leverage: u32,
    trading_enabled: bool,
}

impl TradingExecutor {
    pub fn new(client: Arc<BinanceFuturesClient>, leverage: u32) -> Self {
        let trading_enabled = client.has_credentials();
        if !trading_enabled {
            tracing::info!("Trading disabled (exchange credentials not configured)");
        }
        Self {
            filters: FilterCache::new(client.clone()),
            client,
            state: RwLock::new(AccountState::default()),
            configured_symbols: RwLock::new(HashSet::new()),
            leverage: leverage.max(1),
            trading_enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.trading_enabled
    }

    /// Enable dual-side position mode when necessary, then pull balances and
    /// positions.
    pub async fn initialize(&self) -> Result<()> {
        if !self.trading_enabled {
            return Ok(());
        }

        if !self.client.position_mode().await? {
            self.client.set_dual_side_mode(true).await?;
            tracing::info!("Dual-side position mode enabled");
        }

        self.refresh_state().await
    }

    /// Re-fetch balances and positions from the exchange.
    pub async fn refresh_state(&self) -> Result<()> {
        if !self.trading_enabled {
            return Ok(());
        }

        let balances = self.client.balances().await?;
        let rows = self.client.position_risk().await?;

        let mut next = AccountState::default();
        for balance in &balances {
            if balance.asset == "USDT" {
                next.total_wallet_balance = balance.balance.parse().unwrap_or(0.0);
                next.available_balance = balance.available_balance.parse().unwrap_or(0.0);
                next.unrealized_pnl = balance.cross_un_pnl.parse().unwrap_or(0.0);
            }
        }
        next.positions = summarize_positions(&rows);

        *self.state.write().await = next;
        Ok(())
    }

    pub async fn account(&self) -> AccountState {
        self.state.read().await.clone()
    }

    pub async fn position(&self, symbol: &str) -> Option<PositionSummary> {
        self.state.read().await.positions.get(symbol).cloned()
    }

    /// True when trading is on, the symbol is not already held, and there is
    /// room under the position cap.
    pub async fn can_open_position(&self, symbol: &str) -> bool {
        if !self.trading_enabled {
            return false;
        }
        let state = self.state.read().await;
        !state.positions.contains_key(symbol) && state.positions.len() < MAX_POSITIONS
    }

    /// Leverage and margin type are configured once per symbol per process.
    async fn ensure_symbol_configured(&self, symbol: &str) -> Result<()> {
        if self.configured_symbols.read().await.contains(symbol) {
            return Ok(());
        }
        self.client.set_leverage(symbol, self.leverage).await?;
        self.client.set_margin_type(symbol, "CROSSED").await?;
        self.configured_symbols
            .write()
            .await
            .insert(symbol.to_string());
        Ok(())
    }

    /// Open or extend a position at market. `size_scale` shrinks the default
    /// wallet fraction; the executed quantity comes from the exchange reply.
    pub async fn create_market_order(
        &self,
        symbol: &str,
        direction: Direction,
        size_scale: f64,
    ) -> Option<ExecutedOrder> {
        if !self.trading_enabled {
            return None;
        }
        let size_scale = size_scale.clamp(0.1, 1.0);

        let mark_price = match self.client.mark_price(symbol).await {
            Ok(price) => price,
            Err(err) => {
                tracing::warn!("{}: mark price unavailable, skipping order: {}", symbol, err);
                return None;
            }
        };

        if let Err(err) = self.ensure_symbol_configured(symbol).await {
            tracing::warn!("{}: leverage/margin setup failed: {}", symbol, err);
            return None;
        }

        let filters = self.filters_for(symbol).await?;

        let wallet = self.state.read().await.total_wallet_balance;
        let margin = wallet / 5.0 * size_scale;
        let notional = margin * self.leverage as f64;
        let quantity = match filters.quantize_quantity(notional / mark_price, mark_price) {
            Some(qty) => qty,
            None => {
                tracing::warn!("{}: order quantity quantized to zero", symbol);
                return None;
            }
        };

        let order = OrderRequest {
            symbol: symbol.to_string(),
            side: direction.entry_side().to_string(),
            position_side: direction.position_side().to_string(),
            order_type: "MARKET".to_string(),
            quantity: Some(filters.format_quantity(quantity)),
            stop_price: None,
            time_in_force: None,
            working_type: None,
        };

        let response = match self.client.place_order(&order).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("{}: market order rejected: {}", symbol, err);
                return None;
            }
        };

        if let Err(err) = self.refresh_state().await {
            tracing::warn!("State refresh after order failed: {}", err);
        }

        Some(ExecutedOrder {
            quantity: response.filled_quantity().unwrap_or(quantity),
            avg_price: response.fill_price(),
        })
    }

    /// Protective STOP_MARKET on the position side.
    pub async fn place_stop_loss(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        stop_price: f64,
    ) -> Option<()> {
        if !self.trading_enabled {
            return None;
        }
        let filters = self.filters_for(symbol).await?;

        let order = OrderRequest {
            symbol: symbol.to_string(),
            side: direction.exit_side().to_string(),
            position_side: direction.position_side().to_string(),
            order_type: "STOP_MARKET".to_string(),
            quantity: Some(filters.format_quantity(quantity)),
            stop_price: Some(filters.format_price(stop_price)),
            time_in_force: Some("GTC".to_string()),
            working_type: Some("CONTRACT_PRICE".to_string()),
        };

        match self.client.place_order(&order).await {
            Ok(_) => Some(()),
            Err(err) => {
                tracing::warn!("{}: stop order rejected: {}", symbol, err);
                None
            }
        }
    }

    /// Cancel existing stops on the symbol and place a fresh one.
    pub async fn replace_stop_loss(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        stop_price: f64,
    ) -> Option<()> {
        if !self.trading_enabled {
            return None;
        }
        if let Err(err) = self.client.cancel_all_orders(symbol).await {
            tracing::warn!("{}: cancel before stop replace failed: {}", symbol, err);
            return None;
        }
        self.place_stop_loss(symbol, direction, quantity, stop_price)
            .await
    }

    /// Market-reduce part of the position on the given side.
    pub async fn reduce_position(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
    ) -> Option<ExecutedOrder> {
        self.market_on_side(symbol, direction, quantity, direction.exit_side())
            .await
    }

    /// Market-add to the position on the given side.
    pub async fn increase_position(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
    ) -> Option<ExecutedOrder> {
        self.market_on_side(symbol, direction, quantity, direction.entry_side())
            .await
    }

    async fn market_on_side(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        side: &str,
    ) -> Option<ExecutedOrder> {
        if !self.trading_enabled || quantity <= POSITION_EPSILON {
            return None;
        }
        let filters = self.filters_for(symbol).await?;

        let order = OrderRequest {
            symbol: symbol.to_string(),
            side: side.to_string(),
            position_side: direction.position_side().to_string(),
            order_type: "MARKET".to_string(),
            quantity: Some(filters.format_quantity(quantity)),
            stop_price: None,
            time_in_force: None,
            working_type: None,
        };

        let response = match self.client.place_order(&order).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("{}: {} order rejected: {}", symbol, side, err);
                return None;
            }
        };

        if let Err(err) = self.refresh_state().await {
            tracing::warn!("State refresh after order failed: {}", err);
        }

        Some(ExecutedOrder {
            quantity: response.filled_quantity().unwrap_or(quantity),
            avg_price: response.fill_price(),
        })
    }

    /// Cancel every working order on the symbol (stops included).
    pub async fn cancel_all_symbol_orders(&self, symbol: &str) -> Option<()> {
        if !self.trading_enabled {
            return None;
        }
        match self.client.cancel_all_orders(symbol).await {
            Ok(()) => Some(()),
            Err(err) => {
                tracing::warn!("{}: order cancel failed: {}", symbol, err);
                None
            }
        }
    }

    /// Market-reduce any leg smaller than the residual threshold to zero.
    pub async fn flatten_residual_positions(&self) {
        if !self.trading_enabled {
            return;
        }
        let positions: Vec<PositionSummary> =
            self.state.read().await.positions.values().cloned().collect();

        for summary in positions {
            for direction in [Direction::Long, Direction::Short] {
                let quantity = summary.quantity_for(direction);
                if quantity > POSITION_EPSILON && quantity < RESIDUAL_QTY_THRESHOLD {
                    tracing::info!(
                        "{}: flattening residual {:?} leg of {}",
                        summary.symbol,
                        direction,
                        quantity
                    );
                    self.reduce_position(&summary.symbol, direction, quantity)
                        .await;
                }
            }
        }
    }

    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64> {
        self.client.mark_price(symbol).await
    }

    /// Mark-price ticks via REST polling. The strategy tolerates either a
    /// push stream or polling; only the latest tick matters, so the channel
    /// is a single-slot watch.
    pub fn subscribe_price_stream(&self, symbol: &str) -> PriceSubscription {
        let (tx, rx) = watch::channel(PriceTick {
            mark_price: f64::NAN,
            time: 0,
        });
        let client = self.client.clone();
        let symbol = symbol.to_string();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRICE_POLL_INTERVAL);
            loop {
                interval.tick().await;
                match client.mark_price(&symbol).await {
                    Ok(price) => {
                        let tick = PriceTick {
                            mark_price: price,
                            time: Utc::now().timestamp_millis(),
                        };
                        if tx.send(tick).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!("{}: price poll failed: {}", symbol, err);
                    }
                }
            }
        });

        PriceSubscription { receiver: rx, task }
    }

    async fn filters_for(&self, symbol: &str) -> Option<SymbolFilters> {
        match self.filters.get(symbol).await {
            Ok(Some(filters)) => Some(filters),
            Ok(None) => {
                tracing::warn!("{}: no exchange filters", symbol);
                None
            }
            Err(err) => {
                tracing::warn!("{}: filter fetch failed: {}", symbol, err);
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_account_state(&self, state: AccountState) {
        *self.state.write().await = state;
    }

    #[cfg(test)]
    pub(crate) fn force_enable(&mut self) {
        self.trading_enabled = true;
    }
}

/// Fold dual-side position rows into per-symbol summaries. Symbols with no
/// leg above epsilon are dropped entirely.
fn summarize_positions(rows: &[PositionRiskRow]) -> HashMap<String, PositionSummary> {
    let mut positions: HashMap<String, PositionSummary> = HashMap::new();

    for row in rows {
        let amount: f64 = row.position_amt.parse().unwrap_or(0.0);
        if amount.abs() <= POSITION_EPSILON {
            continue;
        }
        let entry_price: f64 = row.entry_price.parse().unwrap_or(0.0);
        let pnl: f64 = row.un_realized_profit.parse().unwrap_or(0.0);

        let summary = positions
            .entry(row.symbol.clone())
            .or_insert_with(|| PositionSummary {
                symbol: row.symbol.clone(),
                net: 0.0,
                long: None,
                short: None,
                unrealized_pnl: 0.0,
            });

        let leg = PositionLeg {
            quantity: amount.abs(),
            entry_price,
        };
        match row.position_side.as_str() {
            "LONG" => summary.long = Some(leg),
            "SHORT" => summary.short = Some(leg),
            // One-way mode rows land on the side their sign implies.
            _ if amount > 0.0 => summary.long = Some(leg),
            _ => summary.short = Some(leg),
        }
        summary.net += amount;
        summary.unrealized_pnl += pnl;
    }

    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RateLimitedFetcher;

    fn offline_client() -> Arc<BinanceFuturesClient> {
        Arc::new(BinanceFuturesClient::new(RateLimitedFetcher::new(), None, None, 5_000).unwrap())
    }

    fn row(symbol: &str, side: &str, amount: &str) -> PositionRiskRow {
        PositionRiskRow {
            symbol: symbol.to_string(),
            position_amt: amount.to_string(),
            entry_price: "100.0".to_string(),
            un_realized_profit: "1.5".to_string(),
            position_side: side.to_string(),
        }
    }

    #[test]
    fn test_summarize_merges_dual_side_rows() {
        let rows = vec![
            row("BTCUSDT", "LONG", "0.5"),
            row("BTCUSDT", "SHORT", "-0.2"),
            row("ETHUSDT", "LONG", "0.0"),
        ];
        let positions = summarize_positions(&rows);

        assert_eq!(positions.len(), 1);
        let btc = &positions["BTCUSDT"];
        assert_eq!(btc.quantity_for(Direction::Long), 0.5);
        assert_eq!(btc.quantity_for(Direction::Short), 0.2);
        assert!((btc.net - 0.3).abs() < 1e-12);
        assert!((btc.unrealized_pnl - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_summarize_skips_dust_rows() {
        let rows = vec![row("BTCUSDT", "LONG", "0.0000001")];
        assert!(summarize_positions(&rows).is_empty());
    }

    #[tokio::test]
    async fn test_disabled_executor_takes_no_action() {
        let executor = TradingExecutor::new(offline_client(), DEFAULT_LEVERAGE);

        assert!(!executor.is_enabled());
        assert!(!executor.can_open_position("BTCUSDT").await);
        assert!(executor
            .create_market_order("BTCUSDT", Direction::Long, 1.0)
            .await
            .is_none());
        assert!(executor
            .place_stop_loss("BTCUSDT", Direction::Long, 1.0, 90.0)
            .await
            .is_none());
        // No-ops succeed silently.
        executor.initialize().await.unwrap();
        executor.refresh_state().await.unwrap();
    }

    #[tokio::test]
    async fn test_can_open_position_respects_cap() {
        let mut executor = TradingExecutor::new(offline_client(), DEFAULT_LEVERAGE);
        executor.force_enable();

        let mut state = AccountState::default();
        for i in 0..MAX_POSITIONS {
            let symbol = format!("SYM{i}USDT");
            state.positions.insert(
                symbol.clone(),
                PositionSummary {
                    symbol,
                    net: 1.0,
                    long: Some(PositionLeg {
                        quantity: 1.0,
                        entry_price: 10.0,
                    }),
                    short: None,
                    unrealized_pnl: 0.0,
                },
            );
        }
        executor.set_account_state(state).await;

        assert!(!executor.can_open_position("NEWUSDT").await);
        // An already-held symbol is also rejected.
        assert!(!executor.can_open_position("SYM0USDT").await);
    }

    #[tokio::test]
    async fn test_can_open_position_with_room() {
        let mut executor = TradingExecutor::new(offline_client(), DEFAULT_LEVERAGE);
        executor.force_enable();
        assert!(executor.can_open_position("BTCUSDT").await);
    }
}

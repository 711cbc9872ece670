use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;

use crate::api::fetcher::{FetchError, RateLimitedFetcher};
use crate::models::Candle;

type HmacSha256 = Hmac<Sha256>;

const API_BASE_URL: &str = "https://fapi.binance.com";

pub const KLINE_INTERVAL: &str = "1m";
pub const KLINE_LIMIT: u32 = 1440;
pub const DEPTH_LIMIT: u32 = 200;

/// Typed client for the USDT-margined futures REST API.
///
/// Every call goes through the shared [`RateLimitedFetcher`]. Signed
/// endpoints require credentials; public ones work without.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    fetcher: RateLimitedFetcher,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    recv_window: u64,
}

// ============== Wire Types ==============

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub contract_type: String,
    pub quote_asset: String,
    pub status: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
    #[serde(default)]
    pub filters: Vec<Value>,
}

impl SymbolInfo {
    pub fn is_tradable_perpetual(&self) -> bool {
        self.contract_type == "PERPETUAL"
            && self.quote_asset == "USDT"
            && self.status == "TRADING"
    }
}

#[derive(Debug, Deserialize)]
struct Ticker24hRaw {
    symbol: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTickerRaw {
    bid_price: String,
    ask_price: String,
}

/// Best bid/ask snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
}

#[derive(Debug, Deserialize)]
struct DepthRaw {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Order book ladder, `(price, quantity)` per level.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct PriceTickerRaw {
    price: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    pub balance: String,
    pub cross_un_pnl: String,
    pub available_balance: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRiskRow {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    pub un_realized_profit: String,
    pub position_side: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionModeRaw {
    dual_side_position: bool,
}

/// Parameters for POST /fapi/v1/order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: String,
    pub position_side: String,
    pub order_type: String,
    pub quantity: Option<String>,
    pub stop_price: Option<String>,
    pub time_in_force: Option<String>,
    pub working_type: Option<String>,
}

impl OrderRequest {
    fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), self.side.clone()),
            ("positionSide".to_string(), self.position_side.clone()),
            ("type".to_string(), self.order_type.clone()),
        ];
        if let Some(qty) = &self.quantity {
            params.push(("quantity".to_string(), qty.clone()));
        }
        if let Some(stop) = &self.stop_price {
            params.push(("stopPrice".to_string(), stop.clone()));
        }
        if let Some(tif) = &self.time_in_force {
            params.push(("timeInForce".to_string(), tif.clone()));
        }
        if let Some(wt) = &self.working_type {
            params.push(("workingType".to_string(), wt.clone()));
        }
        params
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub status: String,
    #[serde(default)]
    pub executed_qty: String,
    #[serde(default)]
    pub avg_price: String,
}

impl OrderResponse {
    /// Executed quantity, `None` when absent or zero.
    pub fn filled_quantity(&self) -> Option<f64> {
        parse_positive(&self.executed_qty)
    }

    /// Average fill price, `None` when absent or zero.
    pub fn fill_price(&self) -> Option<f64> {
        parse_positive(&self.avg_price)
    }
}

fn parse_positive(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    #[allow(dead_code)]
    msg: String,
}

/// Margin-type "no change" response, treated as success.
const ERR_NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;

// ============== Implementation ==============

impl BinanceFuturesClient {
    pub fn new(
        fetcher: RateLimitedFetcher,
        api_key: Option<String>,
        api_secret: Option<String>,
        recv_window: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            fetcher,
            base_url: API_BASE_URL.to_string(),
            api_key,
            api_secret,
            recv_window,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(key), Some(secret)) => Ok((key, secret)),
            _ => anyhow::bail!("signed endpoint requires API credentials"),
        }
    }

    /// GET a public endpoint and decode the JSON body.
    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, FetchError> {
        let url = format!("{}{}{}", self.base_url, path, render_query(params));

        self.fetcher
            .fetch(|| {
                let client = self.client.clone();
                let url = url.clone();
                async move {
                    let response = client.get(&url).send().await?;
                    decode_json(response).await
                }
            })
            .await
    }

    /// Send a signed request. The timestamp and signature are recomputed on
    /// every retry attempt so backoff never sends a stale signature.
    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, FetchError> {
        let (api_key, api_secret) = match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(key), Some(secret)) => (key.to_string(), secret.to_string()),
            _ => {
                return Err(FetchError::Network(
                    "signed endpoint requires API credentials".to_string(),
                ))
            }
        };
        let base = format!("{}{}", self.base_url, path);
        let recv_window = self.recv_window;

        self.fetcher
            .fetch(|| {
                let client = self.client.clone();
                let base = base.clone();
                let api_key = api_key.clone();
                let api_secret = api_secret.clone();
                let method = method.clone();
                let mut params = params.clone();
                async move {
                    params.push(("recvWindow".to_string(), recv_window.to_string()));
                    params.push((
                        "timestamp".to_string(),
                        Utc::now().timestamp_millis().to_string(),
                    ));
                    let query = canonical_query(&params);
                    let signature = sign_payload(&api_secret, &query);
                    let url = format!("{}?{}&signature={}", base, query, signature);

                    let response = client
                        .request(method, &url)
                        .header("X-MBX-APIKEY", &api_key)
                        .send()
                        .await?;
                    decode_json(response).await
                }
            })
            .await
    }

    /// All tradable USDT perpetual symbols with their exchange filters.
    pub async fn exchange_info(&self) -> Result<Vec<SymbolInfo>> {
        let response: ExchangeInfoResponse = self
            .get_public("/fapi/v1/exchangeInfo", &[])
            .await
            .context("Failed to fetch exchange info")?;
        Ok(response.symbols)
    }

    /// 24h quote volume per symbol. Unparseable rows are skipped.
    pub async fn quote_volumes_24h(&self) -> Result<HashMap<String, f64>> {
        let rows: Vec<Ticker24hRaw> = self
            .get_public("/fapi/v1/ticker/24hr", &[])
            .await
            .context("Failed to fetch 24h tickers")?;

        let mut volumes = HashMap::with_capacity(rows.len());
        for row in rows {
            if let Ok(volume) = row.quote_volume.parse::<f64>() {
                if volume.is_finite() {
                    volumes.insert(row.symbol, volume);
                }
            }
        }
        Ok(volumes)
    }

    /// Recent 1-minute candles, sorted and deduped by open time. Rows with a
    /// non-finite field are dropped.
    pub async fn klines(&self, symbol: &str, limit: u32) -> Result<Vec<Candle>> {
        let params = [
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), KLINE_INTERVAL.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let rows: Vec<Vec<Value>> = self
            .get_public("/fapi/v1/klines", &params)
            .await
            .with_context(|| format!("Failed to fetch klines for {}", symbol))?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| parse_kline_row(row))
            .filter(Candle::is_finite)
            .collect();
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        Ok(candles)
    }

    pub async fn book_ticker(&self, symbol: &str) -> Result<BookTicker> {
        let params = [("symbol".to_string(), symbol.to_string())];
        let raw: BookTickerRaw = self
            .get_public("/fapi/v1/ticker/bookTicker", &params)
            .await
            .with_context(|| format!("Failed to fetch book ticker for {}", symbol))?;

        Ok(BookTicker {
            bid: raw.bid_price.parse().unwrap_or(f64::NAN),
            ask: raw.ask_price.parse().unwrap_or(f64::NAN),
        })
    }

    pub async fn depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let params = [
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let raw: DepthRaw = self
            .get_public("/fapi/v1/depth", &params)
            .await
            .with_context(|| format!("Failed to fetch depth for {}", symbol))?;

        Ok(DepthSnapshot {
            bids: parse_ladder(&raw.bids),
            asks: parse_ladder(&raw.asks),
        })
    }

    pub async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let params = [("symbol".to_string(), symbol.to_string())];
        let raw: PriceTickerRaw = self
            .get_public("/fapi/v1/ticker/price", &params)
            .await
            .with_context(|| format!("Failed to fetch price for {}", symbol))?;

        let price: f64 = raw
            .price
            .parse()
            .with_context(|| format!("Unparseable price for {}", symbol))?;
        anyhow::ensure!(price.is_finite() && price > 0.0, "non-positive price");
        Ok(price)
    }

    pub async fn balances(&self) -> Result<Vec<AssetBalance>> {
        self.credentials()?;
        self.signed_request(reqwest::Method::GET, "/fapi/v2/balance", Vec::new())
            .await
            .context("Failed to fetch balances")
    }

    pub async fn position_risk(&self) -> Result<Vec<PositionRiskRow>> {
        self.credentials()?;
        self.signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await
            .context("Failed to fetch positions")
    }

    pub async fn position_mode(&self) -> Result<bool> {
        self.credentials()?;
        let raw: PositionModeRaw = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/positionSide/dual", Vec::new())
            .await
            .context("Failed to fetch position mode")?;
        Ok(raw.dual_side_position)
    }

    pub async fn set_dual_side_mode(&self, enabled: bool) -> Result<()> {
        self.credentials()?;
        let params = vec![(
            "dualSidePosition".to_string(),
            enabled.to_string(),
        )];
        let _: Value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/positionSide/dual", params)
            .await
            .context("Failed to set position mode")?;
        Ok(())
    }

    /// Sets CROSSED margin. The exchange answers -4046 when the margin type
    /// is already what was requested; that response counts as success.
    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()> {
        self.credentials()?;
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("marginType".to_string(), margin_type.to_string()),
        ];
        let result: Result<Value, FetchError> = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/marginType", params)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(FetchError::Status { body, .. })
                if api_error_code(&body) == Some(ERR_NO_NEED_TO_CHANGE_MARGIN) =>
            {
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("Failed to set margin type for {}", symbol)),
        }
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.credentials()?;
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        let _: Value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/leverage", params)
            .await
            .with_context(|| format!("Failed to set leverage for {}", symbol))?;
        Ok(())
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        self.credentials()?;
        self.signed_request(reqwest::Method::POST, "/fapi/v1/order", order.params())
            .await
            .with_context(|| format!("Order failed for {}", order.symbol))
    }

    /// Cancels every open order on the symbol (used before re-placing stops).
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.credentials()?;
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let _: Value = self
            .signed_request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", params)
            .await
            .with_context(|| format!("Failed to cancel orders for {}", symbol))?;
        Ok(())
    }
}

// ============== Helpers ==============

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, FetchError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(FetchError::Status {
            code: status.as_u16(),
            body,
        });
    }

    serde_json::from_str(&body)
        .map_err(|e| FetchError::Network(format!("failed to decode response: {}", e)))
}

fn render_query(params: &[(String, String)]) -> String {
    if params.is_empty() {
        return String::new();
    }
    format!("?{}", canonical_query(params))
}

fn canonical_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA256 hex signature over the canonical query string.
fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn api_error_code(body: &str) -> Option<i64> {
    serde_json::from_str::<ApiErrorBody>(body).ok().map(|e| e.code)
}

fn parse_ladder(levels: &[[String; 2]]) -> Vec<(f64, f64)> {
    levels
        .iter()
        .filter_map(|level| {
            let price = level[0].parse::<f64>().ok()?;
            let qty = level[1].parse::<f64>().ok()?;
            (price.is_finite() && qty.is_finite()).then_some((price, qty))
        })
        .collect()
}

/// Kline rows are arrays; indexes: 0 openTime, 1 open, 2 high, 3 low,
/// 4 close, 5 volume, 7 quoteVolume, 10 takerBuyQuoteVolume.
fn parse_kline_row(row: &[Value]) -> Option<Candle> {
    fn field(row: &[Value], idx: usize) -> Option<f64> {
        row.get(idx)?.as_str()?.parse::<f64>().ok()
    }

    Some(Candle {
        open_time: row.first()?.as_i64()?,
        open: field(row, 1)?,
        high: field(row, 2)?,
        low: field(row, 3)?,
        close: field(row, 4)?,
        volume: field(row, 5)?,
        quote_volume: field(row, 7)?,
        taker_buy_quote_volume: field(row, 10)?,
    })
}

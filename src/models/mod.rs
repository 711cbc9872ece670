use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cap on the per-metric rolling history vectors.
pub const HISTORY_CAP: usize = 240;

/// One-minute OHLCV candle, keyed by its open time in epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl Candle {
    /// Rows with any non-finite field are dropped at parse time, never zero-filled.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
            && self.quote_volume.is_finite()
            && self.taker_buy_quote_volume.is_finite()
    }
}

/// Scan timeframe: a window length in minutes plus its display label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    pub minutes: u32,
    pub label: &'static str,
}

pub const TIMEFRAMES: [Timeframe; 4] = [
    Timeframe { minutes: 10, label: "10m" },
    Timeframe { minutes: 30, label: "30m" },
    Timeframe { minutes: 60, label: "1h" },
    Timeframe { minutes: 120, label: "2h" },
];

impl Timeframe {
    pub fn from_label(label: &str) -> Option<Timeframe> {
        TIMEFRAMES.iter().find(|tf| tf.label == label).copied()
    }
}

/// Order-flow classification derived from the aggregate taker-buy share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowLabel {
    #[serde(rename = "buy-strong")]
    BuyStrong,
    #[serde(rename = "sell-strong")]
    SellStrong,
    #[serde(rename = "balanced")]
    Balanced,
}

/// Per-(symbol, timeframe) movement-quality metrics.
///
/// Raw fields come out of the metric engine; `align`, `mtf_consistency`, the
/// volume/flow boosts and the fused scores are filled in by the score fuser
/// once all symbols of a cycle are known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeMetric {
    pub net_change: f64,
    pub change_percent: f64,
    pub efficiency: f64,
    pub chop: f64,
    pub momentum_atr: f64,
    pub small_move_gate: f64,
    pub atr_value: f64,
    pub total_quote_volume: f64,
    pub flow_ratio: Option<f64>,
    pub flow_label: Option<FlowLabel>,
    pub flow_immediate_base: f64,
    pub flow_persistence: f64,
    pub align: f64,
    pub mtf_consistency: f64,
    pub volume_boost: f64,
    pub active_flow: f64,
    pub core_score: f64,
    pub confirm_score: f64,
    pub final_score: f64,
    pub liquidity_penalty: f64,
    pub latest_close: f64,
    pub highest_close: f64,
    pub lowest_close: f64,
    pub close_history: Vec<f64>,
    pub efficiency_history: Vec<f64>,
    pub momentum_history: Vec<f64>,
}

/// One row on a gainers/losers board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoversEntry {
    pub symbol: String,
    pub last_price: f64,
    pub change_percent: f64,
    pub flow_percent: Option<f64>,
    pub flow_label: Option<FlowLabel>,
    pub scores: EntryScores,
}

/// Fused per-entry score summary, all values in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryScores {
    pub core: f64,
    pub confirm: f64,
    #[serde(rename = "final")]
    pub final_score: f64,
    pub efficiency: f64,
    pub momentum_atr: f64,
    pub align: f64,
    pub mtf_consistency: f64,
    pub volume_boost: f64,
    pub liquidity_penalty: f64,
}

/// Window bounds in epoch milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: i64,
    pub end: i64,
}

/// Per-timeframe board: top gainers/losers plus the full change map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoversSnapshot {
    pub timeframe: String,
    pub top_gainers: Vec<MoversEntry>,
    pub top_losers: Vec<MoversEntry>,
    pub changes: HashMap<String, f64>,
    pub window: WindowBounds,
}

/// One row of the aggregated cross-timeframe board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEntry {
    pub entry: MoversEntry,
    pub timeframe: String,
    pub window: WindowBounds,
    pub changes: HashMap<String, f64>,
    pub metrics: TimeframeMetric,
}

/// Full output of one scan cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoversResult {
    pub snapshots: HashMap<String, MoversSnapshot>,
    pub aggregated_top: Vec<AggregatedEntry>,
    pub metrics: HashMap<String, HashMap<String, TimeframeMetric>>,
}

/// Trade direction for a managed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// The exchange `positionSide` value under dual-side mode.
    pub fn position_side(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Order side that opens or adds to this direction.
    pub fn entry_side(self) -> &'static str {
        match self {
            Direction::Long => "BUY",
            Direction::Short => "SELL",
        }
    }

    /// Order side that reduces this direction.
    pub fn exit_side(self) -> &'static str {
        match self {
            Direction::Long => "SELL",
            Direction::Short => "BUY",
        }
    }
}

/// One leg of a dual-side position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionLeg {
    pub quantity: f64,
    pub entry_price: f64,
}

/// Exchange-reported position state for one symbol. Long and short legs can
/// coexist under dual-side position mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub net: f64,
    pub long: Option<PositionLeg>,
    pub short: Option<PositionLeg>,
    pub unrealized_pnl: f64,
}

impl PositionSummary {
    /// Quantity held on the given side, zero when the leg is absent.
    pub fn quantity_for(&self, direction: Direction) -> f64 {
        let leg = match direction {
            Direction::Long => self.long.as_ref(),
            Direction::Short => self.short.as_ref(),
        };
        leg.map(|l| l.quantity).unwrap_or(0.0)
    }
}

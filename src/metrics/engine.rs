use std::collections::{HashMap, VecDeque};

use super::{clamp01, mean, sample_std};
use crate::models::{Candle, FlowLabel, Timeframe, TimeframeMetric, HISTORY_CAP, TIMEFRAMES};

const MINUTE_MS: i64 = 60_000;

const FLOW_BUY_STRONG: f64 = 0.62;
const FLOW_SELL_STRONG: f64 = 0.38;

/// Reference percentage move (3 x 1%) that saturates the small-move gate.
const SMALL_MOVE_FULL_SCALE: f64 = 3.0 * 0.01;

/// Per-symbol, per-timeframe metric computation over a shared 1-minute
/// candle buffer, with rolling cross-cycle histories (cap 240).
#[derive(Default)]
pub struct MetricEngine {
    histories: HashMap<String, HashMap<&'static str, MetricHistory>>,
}

#[derive(Default)]
struct MetricHistory {
    closes: VecDeque<f64>,
    efficiencies: VecDeque<f64>,
    momenta: VecDeque<f64>,
}

impl MetricHistory {
    fn push(&mut self, close: f64, efficiency: f64, momentum: f64) {
        push_capped(&mut self.closes, close);
        push_capped(&mut self.efficiencies, efficiency);
        push_capped(&mut self.momenta, momentum);
    }
}

fn push_capped(buffer: &mut VecDeque<f64>, value: f64) {
    buffer.push_back(value);
    while buffer.len() > HISTORY_CAP {
        buffer.pop_front();
    }
}

impl MetricEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute metrics for every configured timeframe of one symbol.
    /// Timeframes whose window cannot be formed are skipped.
    pub fn compute_symbol(
        &mut self,
        symbol: &str,
        candles: &[Candle],
    ) -> HashMap<String, TimeframeMetric> {
        let mut metrics = HashMap::new();

        for timeframe in TIMEFRAMES {
            let Some(mut metric) = compute_timeframe_metric(candles, timeframe) else {
                continue;
            };

            let history = self
                .histories
                .entry(symbol.to_string())
                .or_default()
                .entry(timeframe.label)
                .or_default();
            history.push(metric.latest_close, metric.efficiency, metric.momentum_atr);

            metric.close_history = history.closes.iter().copied().collect();
            metric.efficiency_history = history.efficiencies.iter().copied().collect();
            metric.momentum_history = history.momenta.iter().copied().collect();

            metrics.insert(timeframe.label.to_string(), metric);
        }

        metrics
    }

    /// Drop the history of symbols that left the universe.
    pub fn retain_symbols(&mut self, keep: &dyn Fn(&str) -> bool) {
        self.histories.retain(|symbol, _| keep(symbol));
    }
}

/// Compute the raw metric bundle for one (candles, timeframe) pair.
///
/// Returns `None` when the reference candle is missing or the window is not
/// exactly `timeframe.minutes` rows — such gaps silently skip the timeframe.
pub fn compute_timeframe_metric(candles: &[Candle], timeframe: Timeframe) -> Option<TimeframeMetric> {
    let latest = candles.last()?;
    let target = latest.open_time - timeframe.minutes as i64 * MINUTE_MS;

    let reference_idx = candles
        .binary_search_by_key(&target, |c| c.open_time)
        .ok()?;
    let reference = &candles[reference_idx];
    let window = &candles[reference_idx + 1..];

    if window.len() != timeframe.minutes as usize {
        return None;
    }

    let first = &window[0];
    let last = &window[window.len() - 1];

    if first.open <= 0.0 || last.close <= 0.0 {
        return None;
    }

    let net_change = (last.close - first.open) / first.open;

    // Efficiency: net over gross log-return.
    let mut signed_log_sum = 0.0;
    let mut abs_log_sum = 0.0;
    for candle in window {
        if candle.open > 0.0 && candle.close > 0.0 {
            let log_return = (candle.close / candle.open).ln();
            signed_log_sum += log_return;
            abs_log_sum += log_return.abs();
        }
    }
    let efficiency = if abs_log_sum > 0.0 {
        clamp01(signed_log_sum.abs() / abs_log_sum)
    } else {
        0.0
    };

    // Chop: wasted incremental motion as a fraction of total motion.
    let incremental: f64 = window
        .iter()
        .filter(|c| c.open > 0.0)
        .map(|c| (c.close - c.open) / c.open)
        .sum();
    let waste = (incremental - net_change).max(0.0);
    let chop_denominator = waste + net_change.abs();
    let chop = if chop_denominator > 1e-12 {
        clamp01(waste / chop_denominator)
    } else {
        0.0
    };

    // Mean true range over the window; the reference candle supplies the
    // previous close for the first row.
    let mut true_range_sum = 0.0;
    let mut prev_close = reference.close;
    for candle in window {
        let tr = (candle.high - candle.low)
            .max((candle.high - prev_close).abs())
            .max((candle.low - prev_close).abs());
        true_range_sum += tr;
        prev_close = candle.close;
    }
    let atr_value = true_range_sum / window.len() as f64;
    let atr_pct = atr_value / last.close;

    let momentum_atr = if atr_pct > 0.0 {
        clamp01(net_change.abs() / (2.0 * atr_pct))
    } else {
        0.0
    };

    let small_move_gate = clamp01(net_change.abs() / SMALL_MOVE_FULL_SCALE);

    // Aggregate order flow over the window.
    let total_quote_volume: f64 = window.iter().map(|c| c.quote_volume).sum();
    let total_taker_buy: f64 = window.iter().map(|c| c.taker_buy_quote_volume).sum();
    let flow_ratio = if total_quote_volume > 0.0 {
        Some(clamp01(total_taker_buy / total_quote_volume))
    } else {
        None
    };
    let flow_label = flow_ratio.map(|ratio| {
        if ratio >= FLOW_BUY_STRONG {
            FlowLabel::BuyStrong
        } else if ratio <= FLOW_SELL_STRONG {
            FlowLabel::SellStrong
        } else {
            FlowLabel::Balanced
        }
    });
    let flow_immediate_base = flow_ratio
        .map(|ratio| (((ratio - 0.5) / 0.2).tanh() + 1.0) / 2.0)
        .unwrap_or(0.5);

    let flow_persistence = flow_persistence(window);

    let highest_close = window.iter().map(|c| c.close).fold(f64::MIN, f64::max);
    let lowest_close = window.iter().map(|c| c.close).fold(f64::MAX, f64::min);

    Some(TimeframeMetric {
        net_change,
        change_percent: net_change * 100.0,
        efficiency,
        chop,
        momentum_atr,
        small_move_gate,
        atr_value,
        total_quote_volume,
        flow_ratio,
        flow_label,
        flow_immediate_base,
        flow_persistence,
        // Cross-symbol fields are filled in by the score fuser.
        align: 0.5,
        mtf_consistency: 0.0,
        volume_boost: 0.0,
        active_flow: 0.0,
        core_score: 0.0,
        confirm_score: 0.0,
        final_score: 0.0,
        liquidity_penalty: 0.0,
        latest_close: last.close,
        highest_close,
        lowest_close,
        close_history: Vec::new(),
        efficiency_history: Vec::new(),
        momentum_history: Vec::new(),
    })
}

/// Correlation-style agreement between per-minute flow imbalance and
/// per-minute returns: z-scored mean product (clamped to [-1, 1]) scaled by
/// the sign-agreement ratio.
fn flow_persistence(window: &[Candle]) -> f64 {
    let flows: Vec<f64> = window
        .iter()
        .map(|c| {
            if c.quote_volume > 0.0 {
                clamp01(c.taker_buy_quote_volume / c.quote_volume) - 0.5
            } else {
                0.0
            }
        })
        .collect();
    let returns: Vec<f64> = window
        .iter()
        .map(|c| {
            if c.open > 0.0 {
                (c.close - c.open) / c.open
            } else {
                0.0
            }
        })
        .collect();

    let flow_mean = mean(&flows);
    let return_mean = mean(&returns);
    let flow_std = sample_std(&flows, flow_mean);
    let return_std = sample_std(&returns, return_mean);

    let corr = if flow_std > 1e-12 && return_std > 1e-12 {
        let products: Vec<f64> = flows
            .iter()
            .zip(returns.iter())
            .map(|(f, r)| ((f - flow_mean) / flow_std) * ((r - return_mean) / return_std))
            .collect();
        mean(&products).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    let mut agreements = 0usize;
    let mut considered = 0usize;
    for (flow, ret) in flows.iter().zip(returns.iter()) {
        if *flow == 0.0 || *ret == 0.0 {
            continue;
        }
        considered += 1;
        if flow.signum() == ret.signum() {
            agreements += 1;
        }
    }
    let agree_ratio = if considered > 0 {
        agreements as f64 / considered as f64
    } else {
        0.0
    };

    clamp01(((corr + 1.0) / 2.0) * agree_ratio)
}

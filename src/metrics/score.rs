use std::cmp::Ordering;
use std::collections::HashMap;

use super::{clamp01, mean, sample_std, sigmoid, weighted_avg};
use crate::models::{
    AggregatedEntry, EntryScores, MoversEntry, MoversResult, MoversSnapshot, TimeframeMetric,
    WindowBounds, TIMEFRAMES,
};

pub const TOP_BOARD_SIZE: usize = 10;
pub const AGGREGATED_TOP_SIZE: usize = 20;

/// Sample-std floor: anything below is treated as a unit deviation.
const VOLUME_STD_FLOOR: f64 = 1e-9;

const MINUTE_MS: i64 = 60_000;

/// One surviving symbol of a cycle: its per-timeframe metrics plus the
/// liquidity penalty and last trade price.
#[derive(Debug, Clone)]
pub struct SymbolData {
    pub symbol: String,
    pub last_price: f64,
    pub liquidity_penalty: f64,
    pub metrics: HashMap<String, TimeframeMetric>,
}

/// Cross-symbol normalization and fusion: fills the derived fields of every
/// metric in place, then assembles the boards and the aggregated top list.
pub fn fuse_scores(mut symbols: Vec<SymbolData>, now_ms: i64) -> MoversResult {
    // Per-timeframe volume statistics across the whole universe.
    let mut volume_stats: HashMap<&'static str, (f64, f64)> = HashMap::new();
    for timeframe in TIMEFRAMES {
        let volumes: Vec<f64> = symbols
            .iter()
            .filter_map(|s| s.metrics.get(timeframe.label))
            .map(|m| m.total_quote_volume)
            .collect();
        if volumes.is_empty() {
            continue;
        }
        let volume_mean = mean(&volumes);
        let mut volume_std = sample_std(&volumes, volume_mean);
        if volume_std < VOLUME_STD_FLOOR {
            volume_std = 1.0;
        }
        volume_stats.insert(timeframe.label, (volume_mean, volume_std));
    }

    for symbol_data in &mut symbols {
        // Sign and momentum of every timeframe, read before mutation.
        let directions: HashMap<String, (f64, f64)> = symbol_data
            .metrics
            .iter()
            .map(|(label, m)| (label.clone(), (m.net_change.signum(), m.momentum_atr)))
            .collect();

        let penalty = symbol_data.liquidity_penalty;
        for timeframe in TIMEFRAMES {
            let Some(metric) = symbol_data.metrics.get_mut(timeframe.label) else {
                continue;
            };

            // Volume z-score against the cross-symbol distribution.
            let (volume_mean, volume_std) = volume_stats
                .get(timeframe.label)
                .copied()
                .unwrap_or((0.0, 1.0));
            let vol_z = ((metric.total_quote_volume - volume_mean) / volume_std).clamp(-3.0, 3.0);
            metric.volume_boost = sigmoid(vol_z);
            let g_vol = clamp01(vol_z / 3.0);
            metric.active_flow = clamp01(metric.flow_immediate_base * g_vol);

            metric.align = alignment(timeframe.label, metric.net_change.signum(), &directions);
            metric.mtf_consistency =
                mtf_consistency(timeframe.label, metric.net_change.signum(), &directions);

            metric.core_score = clamp01(
                metric.small_move_gate
                    * weighted_avg(&[
                        (metric.efficiency, 1.0),
                        (1.0 - metric.chop, 1.0),
                        (metric.momentum_atr, 1.0),
                        (metric.align, 1.0),
                        (metric.mtf_consistency, 0.8),
                    ]),
            );
            metric.confirm_score = clamp01(weighted_avg(&[
                (metric.volume_boost, 0.5),
                (metric.active_flow, 0.3),
                (metric.flow_persistence, 0.2),
            ]));
            metric.liquidity_penalty = penalty;
            metric.final_score =
                clamp01(0.67 * metric.core_score + 0.33 * metric.confirm_score - penalty);
        }
    }

    assemble_result(symbols, now_ms)
}

/// Direction agreement against the symbol's other timeframes: +1 per match,
/// -0.5 per mismatch, normalized into [0, 1]; 0.5 with nothing to compare.
fn alignment(label: &str, base_sign: f64, directions: &HashMap<String, (f64, f64)>) -> f64 {
    let mut sum = 0.0;
    let mut comparisons = 0usize;

    for (other_label, (other_sign, _)) in directions {
        if other_label == label || *other_sign == 0.0 {
            continue;
        }
        comparisons += 1;
        if *other_sign == base_sign {
            sum += 1.0;
        } else {
            sum -= 0.5;
        }
    }

    if comparisons == 0 {
        return 0.5;
    }
    let n = comparisons as f64;
    clamp01((sum + 0.5 * n) / (1.5 * n))
}

fn consistency_weight(label: &str) -> f64 {
    match label {
        "1h" | "2h" => 1.5,
        _ => 1.0,
    }
}

/// Weighted sign-agreement across the other timeframes scaled by their mean
/// momentum; zero when there is nothing to compare against.
fn mtf_consistency(label: &str, base_sign: f64, directions: &HashMap<String, (f64, f64)>) -> f64 {
    let mut agreement = 0.0;
    let mut total_weight = 0.0;
    let mut momenta = Vec::new();

    for (other_label, (other_sign, other_momentum)) in directions {
        if other_label == label || *other_sign == 0.0 {
            continue;
        }
        let weight = consistency_weight(other_label);
        total_weight += weight;
        if *other_sign == base_sign {
            agreement += weight;
        }
        momenta.push(*other_momentum);
    }

    if total_weight <= 0.0 {
        return 0.0;
    }
    clamp01(agreement / total_weight) * clamp01(mean(&momenta))
}

fn assemble_result(symbols: Vec<SymbolData>, now_ms: i64) -> MoversResult {
    let mut snapshots = HashMap::new();
    let mut all_metrics: HashMap<String, HashMap<String, TimeframeMetric>> = HashMap::new();

    for symbol_data in &symbols {
        all_metrics.insert(symbol_data.symbol.clone(), symbol_data.metrics.clone());
    }

    for timeframe in TIMEFRAMES {
        let window = WindowBounds {
            start: now_ms - timeframe.minutes as i64 * MINUTE_MS,
            end: now_ms,
        };

        let mut entries: Vec<MoversEntry> = symbols
            .iter()
            .filter_map(|s| {
                s.metrics
                    .get(timeframe.label)
                    .map(|m| board_entry(&s.symbol, s.last_price, m))
            })
            .collect();
        let changes: HashMap<String, f64> = entries
            .iter()
            .map(|e| (e.symbol.clone(), e.change_percent))
            .collect();

        entries.sort_by(|a, b| {
            b.change_percent
                .partial_cmp(&a.change_percent)
                .unwrap_or(Ordering::Equal)
        });
        let top_gainers: Vec<MoversEntry> = entries.iter().take(TOP_BOARD_SIZE).cloned().collect();
        let top_losers: Vec<MoversEntry> =
            entries.iter().rev().take(TOP_BOARD_SIZE).cloned().collect();

        snapshots.insert(
            timeframe.label.to_string(),
            MoversSnapshot {
                timeframe: timeframe.label.to_string(),
                top_gainers,
                top_losers,
                changes,
                window,
            },
        );
    }

    // Aggregated board: the single best timeframe per symbol, ranked.
    let mut aggregated: Vec<AggregatedEntry> = Vec::new();
    for symbol_data in &symbols {
        let best = symbol_data
            .metrics
            .iter()
            .max_by(|a, b| {
                a.1.final_score
                    .partial_cmp(&b.1.final_score)
                    .unwrap_or(Ordering::Equal)
            });
        let Some((label, metric)) = best else { continue };
        let Some(snapshot) = snapshots.get(label.as_str()) else {
            continue;
        };

        aggregated.push(AggregatedEntry {
            entry: board_entry(&symbol_data.symbol, symbol_data.last_price, metric),
            timeframe: label.clone(),
            window: snapshot.window,
            changes: snapshot.changes.clone(),
            metrics: metric.clone(),
        });
    }
    aggregated.sort_by(|a, b| {
        b.metrics
            .final_score
            .partial_cmp(&a.metrics.final_score)
            .unwrap_or(Ordering::Equal)
    });
    aggregated.truncate(AGGREGATED_TOP_SIZE);

    MoversResult {
        snapshots,
        aggregated_top: aggregated,
        metrics: all_metrics,
    }
}

fn board_entry(symbol: &str, last_price: f64, metric: &TimeframeMetric) -> MoversEntry {
    MoversEntry {
        symbol: symbol.to_string(),
        last_price,
        change_percent: metric.change_percent,
        flow_percent: metric.flow_ratio.map(|r| r * 100.0),
        flow_label: metric.flow_label,
        scores: EntryScores {
            core: metric.core_score,
            confirm: metric.confirm_score,
            final_score: metric.final_score,
            efficiency: metric.efficiency,
            momentum_atr: metric.momentum_atr,
            align: metric.align,
            mtf_consistency: metric.mtf_consistency,
            volume_boost: metric.volume_boost,
            liquidity_penalty: metric.liquidity_penalty,
        },
    }
}

//! Offline end-to-end scenarios: synthetic candle buffers through the metric
//! engine, the score fuser, and the strategy state machine.

use chrono::Utc;
use std::collections::HashMap;

use moverbot::metrics::score::SymbolData;
use moverbot::metrics::{fuse_scores, MetricEngine};
use moverbot::models::{Candle, Direction, FlowLabel, Timeframe};
use moverbot::strategy::{
    break_even_stop, break_even_threshold, plan_entry, time_stop_threshold,
    trailing_stop_candidate, ManagedPosition, TimeframeScores,
};

const MINUTE_MS: i64 = 60_000;

/// A contiguous 1440-minute buffer: flat for most of the day, then trending
/// by `trend_pct` per minute for the last `trend_minutes`.
fn synthetic_buffer(
    start_price: f64,
    trend_pct: f64,
    trend_minutes: usize,
    quote_volume: f64,
    taker_share: f64,
) -> Vec<Candle> {
    let total = 1441;
    let mut candles = Vec::with_capacity(total);
    let mut price = start_price;

    for i in 0..total {
        let pct = if i >= total - trend_minutes { trend_pct } else { 0.0 };
        let open = price;
        let close = open * (1.0 + pct);
        price = close;
        candles.push(Candle {
            open_time: i as i64 * MINUTE_MS,
            open,
            high: open.max(close) * 1.0001,
            low: open.min(close) * 0.9999,
            close,
            volume: quote_volume / open,
            quote_volume,
            taker_buy_quote_volume: quote_volume * taker_share,
        });
    }
    candles
}

fn scan(symbols: Vec<(&str, Vec<Candle>, f64)>) -> moverbot::models::MoversResult {
    let mut engine = MetricEngine::new();
    let mut data = Vec::new();
    for (symbol, candles, penalty) in symbols {
        let last_price = candles.last().unwrap().close;
        let metrics = engine.compute_symbol(symbol, &candles);
        assert!(!metrics.is_empty(), "{symbol} produced no metrics");
        data.push(SymbolData {
            symbol: symbol.to_string(),
            last_price,
            liquidity_penalty: penalty,
            metrics,
        });
    }
    fuse_scores(data, Utc::now().timestamp_millis())
}

#[test]
fn test_pure_trend_metrics_and_boards() {
    // One steadily rising symbol, one falling, one flat, all day long.
    let result = scan(vec![
        ("UPUSDT", synthetic_buffer(100.0, 0.001, 1441, 2_000.0, 0.7), 0.0),
        ("DOWNUSDT", synthetic_buffer(50.0, -0.001, 1441, 1_000.0, 0.3), 0.0),
        ("FLATUSDT", synthetic_buffer(10.0, 0.0, 0, 500.0, 0.5), 0.0),
    ]);

    let up = &result.metrics["UPUSDT"]["1h"];
    assert!((up.efficiency - 1.0).abs() < 1e-9, "monotone trend is fully efficient");
    assert!(up.chop < 1e-9);
    assert!(up.net_change > 0.05);
    assert_eq!(up.small_move_gate, 1.0);
    assert_eq!(up.flow_label, Some(FlowLabel::BuyStrong));
    assert!((up.flow_ratio.unwrap() - 0.7).abs() < 1e-9);

    let down = &result.metrics["DOWNUSDT"]["1h"];
    assert!(down.net_change < -0.05);
    assert_eq!(down.flow_label, Some(FlowLabel::SellStrong));

    // Boards: gainers descending, losers ascending, all four timeframes.
    for timeframe in ["10m", "30m", "1h", "2h"] {
        let snapshot = &result.snapshots[timeframe];
        assert_eq!(snapshot.top_gainers[0].symbol, "UPUSDT");
        assert_eq!(snapshot.top_losers[0].symbol, "DOWNUSDT");
        assert!(snapshot.top_gainers.len() <= 10);
        assert!(snapshot.top_losers.len() <= 10);
        for pair in snapshot.top_gainers.windows(2) {
            assert!(pair[0].change_percent >= pair[1].change_percent);
        }
        for pair in snapshot.top_losers.windows(2) {
            assert!(pair[0].change_percent <= pair[1].change_percent);
        }
    }

    // Every fused score stays in the unit range.
    for metrics in result.metrics.values() {
        for metric in metrics.values() {
            for value in [
                metric.efficiency,
                metric.chop,
                metric.momentum_atr,
                metric.small_move_gate,
                metric.align,
                metric.mtf_consistency,
                metric.volume_boost,
                metric.active_flow,
                metric.flow_persistence,
                metric.core_score,
                metric.confirm_score,
                metric.final_score,
            ] {
                assert!((0.0..=1.0).contains(&value), "score out of range: {value}");
            }
        }
    }

    // Aggregated board is deduped by symbol and ranked by final score.
    let mut seen = std::collections::HashSet::new();
    for aggregated in &result.aggregated_top {
        assert!(seen.insert(aggregated.entry.symbol.clone()));
    }
    for pair in result.aggregated_top.windows(2) {
        assert!(pair[0].metrics.final_score >= pair[1].metrics.final_score);
    }
}

#[test]
fn test_volume_boost_midpoint_across_universe() {
    // Identical price paths; only quote volume differs. The middle symbol
    // sits exactly at the cross-symbol mean.
    let result = scan(vec![
        ("AUSDT", synthetic_buffer(100.0, 0.0005, 1441, 100.0, 0.5), 0.0),
        ("BUSDT", synthetic_buffer(100.0, 0.0005, 1441, 200.0, 0.5), 0.0),
        ("CUSDT", synthetic_buffer(100.0, 0.0005, 1441, 300.0, 0.5), 0.0),
    ]);

    for timeframe in ["10m", "30m", "1h", "2h"] {
        let boost = result.metrics["BUSDT"][timeframe].volume_boost;
        assert!((boost - 0.5).abs() < 1e-9, "{timeframe}: boost {boost}");
    }
}

#[test]
fn test_trending_candidate_passes_entry_gates() {
    // A clean trender with strong flow produces a LONG plan off the boards.
    let result = scan(vec![
        ("UPUSDT", synthetic_buffer(100.0, 0.001, 1441, 2_000.0, 0.7), 0.1),
        ("DOWNUSDT", synthetic_buffer(50.0, -0.001, 1441, 1_000.0, 0.3), 0.0),
        ("FLATUSDT", synthetic_buffer(10.0, 0.0, 0, 500.0, 0.5), 0.0),
    ]);

    let metrics = &result.metrics["UPUSDT"];
    let plan = plan_entry(metrics, 0.1, 1.0).expect("gates should pass");

    assert_eq!(plan.direction, Direction::Long);
    assert_eq!(plan.parent.label, "1h");
    assert_eq!(plan.child.label, "30m");

    // Sizing follows the published formulas.
    let parent = TimeframeScores::from_metric(&metrics["1h"]);
    let clean = (parent.trend + parent.efficiency + parent.align) / 300.0;
    let expected_k = (1.2 + 0.9 * clean + 0.3 * metrics["30m"].small_move_gate).clamp(1.2, 2.8);
    assert!((plan.k_sl - expected_k).abs() < 1e-9);
    assert!((plan.sl_distance - expected_k * metrics["30m"].atr_value).abs() < 1e-9);
    assert!((plan.size_scale - 0.81).abs() < 1e-9);
    assert!(plan.trail_atr_multiple >= 1.6 && plan.trail_atr_multiple <= 3.2);

    // The mirror-image symbol plans a SHORT.
    let short_plan = plan_entry(&result.metrics["DOWNUSDT"], 0.0, 1.0).expect("short gates");
    assert_eq!(short_plan.direction, Direction::Short);

    // The flat symbol has no decisive parent direction.
    assert!(plan_entry(&result.metrics["FLATUSDT"], 0.0, 1.0).is_none());
}

fn managed_from_plan(entry_price: f64, initial_sl: f64) -> ManagedPosition {
    let result = scan(vec![
        ("UPUSDT", synthetic_buffer(100.0, 0.001, 1441, 2_000.0, 0.7), 0.0),
        ("OTHERUSDT", synthetic_buffer(50.0, -0.0002, 1441, 1_000.0, 0.4), 0.0),
    ]);
    let metrics: &HashMap<String, _> = &result.metrics["UPUSDT"];

    ManagedPosition {
        symbol: "UPUSDT".to_string(),
        direction: Direction::Long,
        parent_timeframe: Timeframe::from_label("1h").unwrap(),
        child_timeframe: Timeframe::from_label("30m").unwrap(),
        entry_price,
        base_quantity: 10.0,
        total_quantity: 10.0,
        k_sl: 2.0,
        initial_sl_distance: initial_sl,
        sl_distance: initial_sl,
        stop_price: entry_price - initial_sl,
        trail_atr_multiple: 2.0,
        clean_score: 0.8,
        gate_score: 0.8,
        opened_at: Utc::now(),
        add_count: 0,
        be_moved: false,
        highest_price: entry_price,
        lowest_price: entry_price,
        trail_price: None,
        partial_one_taken: false,
        partial_two_taken: false,
        time_stop_stage: 0,
        time_stop_at: None,
        structure_break_counter: 0,
        parent_atr: metrics["1h"].atr_value,
        child_atr: metrics["30m"].atr_value,
        risk_amount: 10.0 * initial_sl,
        max_r: 0.0,
        parent_snapshot: metrics["1h"].clone(),
        child_snapshot: metrics["30m"].clone(),
        last_price: entry_price,
    }
}

#[test]
fn test_break_even_and_trailing_never_cross_entry() {
    let entry = 100.0;
    let initial_sl = 1.0;
    let mut position = managed_from_plan(entry, initial_sl);
    // Anchor the trailing reference at the entry so the walk below, not the
    // synthetic buffer's absolute prices, drives the extremes.
    position.parent_snapshot.highest_close = entry;
    position.parent_atr = 0.4;

    // Confirmed volume and flow lower the break-even trigger to 1R.
    let mut child_scores = TimeframeScores::from_metric(&position.child_snapshot);
    child_scores.volume = 60.0;
    child_scores.flow = 60.0;
    assert_eq!(break_even_threshold(&child_scores), 1.0);

    // Price reaches 1R: move the stop to break-even.
    position.observe_price(101.0);
    assert!(position.max_r >= 1.0);
    let be_stop = break_even_stop(position.direction, entry, 101.0);
    assert!(be_stop < entry && be_stop > entry - 0.1);
    position.stop_price = be_stop;
    position.be_moved = true;

    // From here every trailing update must tighten monotonically and stay
    // above the break-even level.
    let mut last_stop = position.effective_stop();
    for step in 1..=50 {
        let price = 101.0 + step as f64 * 0.2;
        position.observe_price(price);
        if let Some(candidate) = trailing_stop_candidate(&position, 2.0) {
            assert!(candidate > last_stop, "trailing must only tighten");
            assert!(candidate < price, "stop stays on the safe side");
            assert!(candidate >= be_stop, "never crosses entry adversely");
            position.trail_price = Some(candidate);
            position.stop_price = candidate;
            last_stop = candidate;
        }
    }

    // The initial stop distance never changed along the way.
    assert_eq!(position.initial_sl_distance, initial_sl);
}

#[test]
fn test_time_stop_schedule() {
    // Parent 60 / child 10: the stall threshold is 18 child candles.
    assert_eq!(time_stop_threshold(60, 10), 18);

    let position = managed_from_plan(100.0, 1.0);
    let threshold = time_stop_threshold(
        position.parent_timeframe.minutes,
        position.child_timeframe.minutes,
    );
    // Parent 1h / child 30m: ceil(180 / 30) = 6 child candles, 180 minutes.
    assert_eq!(threshold, 6);
    assert_eq!(threshold * position.child_timeframe.minutes, 180);

    // Stage-one tightening target: half the initial distance.
    let tightened = position.entry_price - 0.5 * position.initial_sl_distance;
    assert!((tightened - 99.5).abs() < 1e-12);
    assert!(tightened > position.stop_price);
}

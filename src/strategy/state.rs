use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{Direction, Timeframe, TimeframeMetric, HISTORY_CAP};

/// Quantities at or below this are an empty position.
pub const EPSILON_QTY: f64 = 1e-6;

/// Stop prices never go below this floor.
pub const MIN_STOP_PRICE: f64 = 0.0001;

/// Break-even stop buffer as a fraction of the current price.
const BREAK_EVEN_BUFFER: f64 = 0.0005;

/// Percent-scale (0-100) gate inputs derived from one timeframe metric.
#[derive(Debug, Clone, Copy)]
pub struct TimeframeScores {
    pub signed_trend: f64,
    pub trend: f64,
    pub efficiency: f64,
    pub align: f64,
    pub volume: f64,
    pub flow: f64,
}

impl TimeframeScores {
    pub fn from_metric(metric: &TimeframeMetric) -> Self {
        let signed_trend = (1.0 - metric.chop) * 100.0 * metric.net_change.signum();
        let flow_basis = if metric.active_flow > 0.0 {
            metric.active_flow
        } else {
            metric.flow_immediate_base
        };
        Self {
            signed_trend,
            trend: signed_trend.abs(),
            efficiency: metric.efficiency * 100.0,
            align: metric.align * 100.0,
            volume: metric.volume_boost * 100.0,
            flow: flow_basis * 100.0,
        }
    }
}

/// Parent/child framework chosen for a candidate.
///
/// A strong, efficient 1h trend is managed on the 30m child; otherwise the
/// faster 30m/10m pair applies, with 1h/30m as the fallback.
pub fn select_framework(
    metrics: &HashMap<String, TimeframeMetric>,
) -> Option<(Timeframe, Timeframe)> {
    let tf = |label: &str| Timeframe::from_label(label).unwrap();

    if let Some(hour) = metrics.get("1h") {
        let scores = TimeframeScores::from_metric(hour);
        if scores.signed_trend.abs() >= 70.0 && scores.efficiency >= 55.0 && metrics.contains_key("30m")
        {
            return Some((tf("1h"), tf("30m")));
        }
    }
    if metrics.contains_key("30m") && metrics.contains_key("10m") {
        return Some((tf("30m"), tf("10m")));
    }
    if metrics.contains_key("1h") && metrics.contains_key("30m") {
        return Some((tf("1h"), tf("30m")));
    }
    None
}

/// Trade direction from the parent timeframe, `None` when the trend is not
/// decisive enough either way.
pub fn select_direction(parent: &TimeframeMetric) -> Option<Direction> {
    let scores = TimeframeScores::from_metric(parent);
    if scores.signed_trend >= 65.0 && scores.align >= 60.0 && parent.net_change >= 0.0 {
        Some(Direction::Long)
    } else if scores.signed_trend <= -65.0 && scores.align >= 60.0 && parent.net_change <= 0.0 {
        Some(Direction::Short)
    } else {
        None
    }
}

/// A fully-gated entry decision, ready for sizing and order placement.
#[derive(Debug, Clone)]
pub struct EntryPlan {
    pub direction: Direction,
    pub parent: Timeframe,
    pub child: Timeframe,
    pub clean_score: f64,
    pub gate_score: f64,
    pub k_sl: f64,
    pub sl_distance: f64,
    pub size_scale: f64,
    pub trail_atr_multiple: f64,
}

/// Gate a candidate and size its stop. Returns `None` when any entry gate
/// fails or the child ATR is unusable.
pub fn plan_entry(
    metrics: &HashMap<String, TimeframeMetric>,
    liquidity_penalty: f64,
    ksl_buffer: f64,
) -> Option<EntryPlan> {
    let (parent_tf, child_tf) = select_framework(metrics)?;
    let parent = metrics.get(parent_tf.label)?;
    let child = metrics.get(child_tf.label)?;

    let direction = select_direction(parent)?;
    let parent_scores = TimeframeScores::from_metric(parent);
    let child_scores = TimeframeScores::from_metric(child);

    if parent_scores.efficiency < 45.0 || parent_scores.align < 50.0 {
        return None;
    }
    if liquidity_penalty * 100.0 >= 40.0 {
        return None;
    }

    let momentum_consistent = child.net_change * direction.sign() >= 0.0;
    let momentum_trigger =
        child.small_move_gate >= 0.65 && child.momentum_atr >= 0.5 && momentum_consistent;
    let confirmation_trigger = child_scores.efficiency >= 55.0
        && (child_scores.volume >= 55.0 || child_scores.flow >= 55.0);
    if !momentum_trigger && !confirmation_trigger {
        return None;
    }

    if child.atr_value <= 0.0 {
        return None;
    }

    let clean_score =
        (parent_scores.trend + parent_scores.efficiency + parent_scores.align) / 300.0;
    let gate_score = child.small_move_gate;
    let k_sl = (1.2 + 0.9 * clean_score + 0.3 * gate_score).clamp(1.2, 2.8);
    let sl_distance = k_sl * child.atr_value * ksl_buffer;
    let size_scale = ((100.0 - liquidity_penalty * 100.0) / 100.0)
        .powi(2)
        .clamp(0.2, 1.0);
    let trail_atr_multiple = (2.0 + 1.2 * clean_score - 0.6 * (1.0 - gate_score)).clamp(1.6, 3.2);

    Some(EntryPlan {
        direction,
        parent: parent_tf,
        child: child_tf,
        clean_score,
        gate_score,
        k_sl,
        sl_distance,
        size_scale,
        trail_atr_multiple,
    })
}

/// Strategy-owned state for one open position leg.
#[derive(Debug, Clone)]
pub struct ManagedPosition {
    pub symbol: String,
    pub direction: Direction,
    pub parent_timeframe: Timeframe,
    pub child_timeframe: Timeframe,
    pub entry_price: f64,
    pub base_quantity: f64,
    pub total_quantity: f64,
    pub k_sl: f64,
    /// Fixed at entry; R multiples are measured against this forever.
    pub initial_sl_distance: f64,
    pub sl_distance: f64,
    pub stop_price: f64,
    pub trail_atr_multiple: f64,
    pub clean_score: f64,
    pub gate_score: f64,
    pub opened_at: DateTime<Utc>,
    pub add_count: u8,
    pub be_moved: bool,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub trail_price: Option<f64>,
    pub partial_one_taken: bool,
    pub partial_two_taken: bool,
    pub time_stop_stage: u8,
    pub time_stop_at: Option<DateTime<Utc>>,
    pub structure_break_counter: u32,
    pub parent_atr: f64,
    pub child_atr: f64,
    pub risk_amount: f64,
    pub max_r: f64,
    pub parent_snapshot: TimeframeMetric,
    pub child_snapshot: TimeframeMetric,
    pub last_price: f64,
}

impl ManagedPosition {
    /// Favorable excursion in units of the original stop distance.
    pub fn r_multiple(&self, price: f64) -> f64 {
        if self.initial_sl_distance <= 0.0 {
            return 0.0;
        }
        self.direction.sign() * (price - self.entry_price) / self.initial_sl_distance
    }

    /// Record a new observed price: extremes, last price, max R.
    pub fn observe_price(&mut self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.last_price = price;
        self.highest_price = self.highest_price.max(price);
        self.lowest_price = self.lowest_price.min(price);
        self.max_r = self.max_r.max(self.r_multiple(price));
    }

    /// The stop currently protecting the position.
    pub fn effective_stop(&self) -> f64 {
        self.trail_price.unwrap_or(self.stop_price)
    }

    /// Minutes elapsed since entry, by wall clock.
    pub fn minutes_open(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }
}

/// R threshold for the break-even move: earlier when both child volume and
/// flow confirm.
pub fn break_even_threshold(child_scores: &TimeframeScores) -> f64 {
    if child_scores.volume >= 55.0 && child_scores.flow >= 55.0 {
        1.0
    } else {
        1.3
    }
}

/// Break-even stop: entry shifted by a 0.05% buffer of the current price,
/// kept on the safe side of the price.
pub fn break_even_stop(direction: Direction, entry_price: f64, current_price: f64) -> f64 {
    let buffer = BREAK_EVEN_BUFFER * current_price;
    let stop = match direction {
        Direction::Long => (entry_price - buffer).min(current_price - buffer),
        Direction::Short => (entry_price + buffer).max(current_price + buffer),
    };
    stop.max(MIN_STOP_PRICE)
}

/// Trailing-stop candidate from the parent-window extreme and the live
/// extreme. `None` unless it strictly tightens the current stop and stays on
/// the safe side of the current price.
pub fn trailing_stop_candidate(position: &ManagedPosition, trail_multiple: f64) -> Option<f64> {
    let trail_distance = trail_multiple * position.parent_atr;
    if trail_distance <= 0.0 {
        return None;
    }

    let current_stop = position.effective_stop();
    let price = position.last_price;

    match position.direction {
        Direction::Long => {
            let reference = position
                .parent_snapshot
                .highest_close
                .max(position.highest_price);
            let candidate = reference - trail_distance;
            (candidate > current_stop && candidate < price).then_some(candidate.max(MIN_STOP_PRICE))
        }
        Direction::Short => {
            let reference = position
                .parent_snapshot
                .lowest_close
                .min(position.lowest_price);
            let candidate = reference + trail_distance;
            (candidate < current_stop && candidate > price).then_some(candidate)
        }
    }
}

/// Trail multiple, weakened by 0.4 (floor 1.6) when child efficiency has been
/// fading for 10 samples or momentum is net-decreasing over the last 3.
pub fn effective_trail_multiple(base: f64, child: &TimeframeMetric) -> f64 {
    let fading_efficiency = is_monotone_non_increasing_tail(&child.efficiency_history, 10);
    let fading_momentum = is_net_decreasing_tail(&child.momentum_history, 3);
    if fading_efficiency || fading_momentum {
        (base - 0.4).max(1.6)
    } else {
        base
    }
}

fn is_monotone_non_increasing_tail(history: &[f64], samples: usize) -> bool {
    if history.len() < samples || samples < 2 {
        return false;
    }
    history[history.len() - samples..]
        .windows(2)
        .all(|pair| pair[1] <= pair[0])
}

fn is_net_decreasing_tail(history: &[f64], samples: usize) -> bool {
    if history.len() < samples || samples < 2 {
        return false;
    }
    let tail = &history[history.len() - samples..];
    tail[tail.len() - 1] < tail[0]
}

/// Child-candle count that arms the time stop.
pub fn time_stop_threshold(parent_minutes: u32, child_minutes: u32) -> u32 {
    if child_minutes == 0 {
        return 1;
    }
    ((3 * parent_minutes + child_minutes - 1) / child_minutes).max(1)
}

/// Structure-break check on the last two child closes; returns the updated
/// counter.
pub fn structure_break_counter(position: &ManagedPosition) -> u32 {
    let closes = &position.child_snapshot.close_history;
    if closes.len() < 2 {
        return 0;
    }
    let last = closes[closes.len() - 1];
    let previous = closes[closes.len() - 2];
    let threshold =
        position.effective_stop() + position.direction.sign() * 0.3 * position.child_atr;

    let wrong_side = |close: f64| match position.direction {
        Direction::Long => close < threshold,
        Direction::Short => close > threshold,
    };

    if wrong_side(last) && wrong_side(previous) {
        position.structure_break_counter + 1
    } else {
        0
    }
}

/// Partial size: 30% of the base quantity, never more than what is left.
pub fn partial_quantity(position: &ManagedPosition) -> f64 {
    (0.3 * position.base_quantity).min(position.total_quantity)
}

/// Append a live close to a snapshot history, capped.
pub fn push_history_capped(history: &mut Vec<f64>, value: f64) {
    history.push(value);
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(net_change: f64, chop: f64, efficiency: f64, align: f64) -> TimeframeMetric {
        TimeframeMetric {
            net_change,
            change_percent: net_change * 100.0,
            efficiency,
            chop,
            momentum_atr: 0.7,
            small_move_gate: 0.8,
            atr_value: 0.001,
            total_quote_volume: 1_000.0,
            flow_ratio: Some(0.6),
            flow_label: None,
            flow_immediate_base: 0.6,
            flow_persistence: 0.4,
            align,
            mtf_consistency: 0.5,
            volume_boost: 0.6,
            active_flow: 0.3,
            core_score: 0.5,
            confirm_score: 0.5,
            final_score: 0.5,
            liquidity_penalty: 0.0,
            latest_close: 100.0,
            highest_close: 101.0,
            lowest_close: 99.0,
            close_history: Vec::new(),
            efficiency_history: Vec::new(),
            momentum_history: Vec::new(),
        }
    }

    fn sample_position(direction: Direction) -> ManagedPosition {
        ManagedPosition {
            symbol: "BTCUSDT".to_string(),
            direction,
            parent_timeframe: Timeframe::from_label("1h").unwrap(),
            child_timeframe: Timeframe::from_label("30m").unwrap(),
            entry_price: 100.0,
            base_quantity: 1.0,
            total_quantity: 1.0,
            k_sl: 2.0,
            initial_sl_distance: 1.0,
            sl_distance: 1.0,
            stop_price: if direction == Direction::Long { 99.0 } else { 101.0 },
            trail_atr_multiple: 2.0,
            clean_score: 0.8,
            gate_score: 0.8,
            opened_at: Utc::now(),
            add_count: 0,
            be_moved: false,
            highest_price: 100.0,
            lowest_price: 100.0,
            trail_price: None,
            partial_one_taken: false,
            partial_two_taken: false,
            time_stop_stage: 0,
            time_stop_at: None,
            structure_break_counter: 0,
            parent_atr: 0.5,
            child_atr: 0.2,
            risk_amount: 1.0,
            max_r: 0.0,
            parent_snapshot: metric(0.05, 0.1, 0.8, 0.8),
            child_snapshot: metric(0.01, 0.2, 0.8, 0.7),
            last_price: 100.0,
        }
    }

    #[test]
    fn test_framework_prefers_strong_hourly_trend() {
        let mut metrics = HashMap::new();
        metrics.insert("1h".to_string(), metric(0.05, 0.1, 0.8, 0.8));
        metrics.insert("30m".to_string(), metric(0.02, 0.2, 0.7, 0.7));
        metrics.insert("10m".to_string(), metric(0.01, 0.2, 0.7, 0.7));

        let (parent, child) = select_framework(&metrics).unwrap();
        assert_eq!(parent.label, "1h");
        assert_eq!(child.label, "30m");
    }

    #[test]
    fn test_framework_falls_back_to_fast_pair() {
        // Choppy hourly trend: signed trend is below 70.
        let mut metrics = HashMap::new();
        metrics.insert("1h".to_string(), metric(0.05, 0.5, 0.8, 0.8));
        metrics.insert("30m".to_string(), metric(0.02, 0.2, 0.7, 0.7));
        metrics.insert("10m".to_string(), metric(0.01, 0.2, 0.7, 0.7));

        let (parent, child) = select_framework(&metrics).unwrap();
        assert_eq!(parent.label, "30m");
        assert_eq!(child.label, "10m");
    }

    #[test]
    fn test_framework_requires_two_timeframes() {
        let mut metrics = HashMap::new();
        metrics.insert("2h".to_string(), metric(0.05, 0.1, 0.8, 0.8));
        assert!(select_framework(&metrics).is_none());
    }

    #[test]
    fn test_direction_selection() {
        assert_eq!(
            select_direction(&metric(0.05, 0.1, 0.8, 0.8)),
            Some(Direction::Long)
        );
        assert_eq!(
            select_direction(&metric(-0.05, 0.1, 0.8, 0.8)),
            Some(Direction::Short)
        );
        // Align too weak.
        assert_eq!(select_direction(&metric(0.05, 0.1, 0.8, 0.5)), None);
        // Trend too choppy.
        assert_eq!(select_direction(&metric(0.05, 0.4, 0.8, 0.8)), None);
    }

    #[test]
    fn test_entry_plan_sizing() {
        let mut metrics = HashMap::new();
        metrics.insert("1h".to_string(), metric(0.05, 0.1, 0.8, 0.8));
        metrics.insert("30m".to_string(), metric(0.01, 0.2, 0.8, 0.7));

        let plan = plan_entry(&metrics, 0.1, 1.0).unwrap();

        assert_eq!(plan.direction, Direction::Long);
        assert_eq!(plan.parent.label, "1h");
        assert_eq!(plan.child.label, "30m");

        // cleanP = (90 + 80 + 80) / 300
        assert!((plan.clean_score - 250.0 / 300.0).abs() < 1e-9);
        // kSl = 1.2 + 0.9 * cleanP + 0.3 * 0.8
        let expected_k = 1.2 + 0.9 * (250.0 / 300.0) + 0.3 * 0.8;
        assert!((plan.k_sl - expected_k).abs() < 1e-9);
        assert!((plan.sl_distance - expected_k * 0.001).abs() < 1e-9);
        // sizeScale = ((100 - 10) / 100)^2 = 0.81
        assert!((plan.size_scale - 0.81).abs() < 1e-9);
    }

    #[test]
    fn test_entry_rejected_on_liquidity() {
        let mut metrics = HashMap::new();
        metrics.insert("1h".to_string(), metric(0.05, 0.1, 0.8, 0.8));
        metrics.insert("30m".to_string(), metric(0.01, 0.2, 0.8, 0.7));

        assert!(plan_entry(&metrics, 0.4, 1.0).is_none());
    }

    #[test]
    fn test_entry_rejected_without_child_trigger() {
        let mut metrics = HashMap::new();
        metrics.insert("1h".to_string(), metric(0.05, 0.1, 0.8, 0.8));
        let mut weak_child = metric(0.01, 0.2, 0.4, 0.7);
        weak_child.small_move_gate = 0.3;
        weak_child.momentum_atr = 0.2;
        weak_child.volume_boost = 0.2;
        weak_child.active_flow = 0.1;
        weak_child.flow_immediate_base = 0.3;
        metrics.insert("30m".to_string(), weak_child);

        assert!(plan_entry(&metrics, 0.0, 1.0).is_none());
    }

    #[test]
    fn test_entry_rejected_without_child_atr() {
        let mut metrics = HashMap::new();
        metrics.insert("1h".to_string(), metric(0.05, 0.1, 0.8, 0.8));
        let mut child = metric(0.01, 0.2, 0.8, 0.7);
        child.atr_value = 0.0;
        metrics.insert("30m".to_string(), child);

        assert!(plan_entry(&metrics, 0.0, 1.0).is_none());
    }

    #[test]
    fn test_ksl_buffer_scales_stop_distance() {
        let mut metrics = HashMap::new();
        metrics.insert("1h".to_string(), metric(0.05, 0.1, 0.8, 0.8));
        metrics.insert("30m".to_string(), metric(0.01, 0.2, 0.8, 0.7));

        let narrow = plan_entry(&metrics, 0.0, 0.5).unwrap();
        let wide = plan_entry(&metrics, 0.0, 2.0).unwrap();
        assert!((wide.sl_distance / narrow.sl_distance - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_r_multiple_and_extremes() {
        let mut position = sample_position(Direction::Long);
        position.observe_price(101.5);

        assert!((position.r_multiple(101.5) - 1.5).abs() < 1e-12);
        assert_eq!(position.highest_price, 101.5);
        assert!((position.max_r - 1.5).abs() < 1e-12);

        // A retrace never lowers max R.
        position.observe_price(100.5);
        assert!((position.max_r - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_break_even_threshold() {
        let mut scores = TimeframeScores::from_metric(&metric(0.01, 0.2, 0.8, 0.7));
        scores.volume = 60.0;
        scores.flow = 60.0;
        assert_eq!(break_even_threshold(&scores), 1.0);

        scores.volume = 40.0;
        assert_eq!(break_even_threshold(&scores), 1.3);
    }

    #[test]
    fn test_break_even_stop_stays_on_safe_side() {
        // Long: stop lands just under entry.
        let stop = break_even_stop(Direction::Long, 100.0, 102.0);
        assert!(stop < 100.0 && stop > 99.9);

        // Price already below entry: stop clamps under the price instead.
        let stop = break_even_stop(Direction::Long, 100.0, 99.0);
        assert!(stop < 99.0);

        let stop = break_even_stop(Direction::Short, 100.0, 98.0);
        assert!(stop > 100.0 && stop < 100.1);
    }

    #[test]
    fn test_trailing_stop_tightens_only() {
        let mut position = sample_position(Direction::Long);
        position.parent_snapshot.highest_close = 103.0;
        position.observe_price(102.0);

        // ref 103 - 2 * 0.5 = 102 is not below price; rejected.
        assert!(trailing_stop_candidate(&position, 2.0).is_none());

        // A wider extreme pulls the trail up underneath the price.
        position.observe_price(104.0);
        let candidate = trailing_stop_candidate(&position, 2.0).unwrap();
        assert!((candidate - 103.0).abs() < 1e-12);

        position.trail_price = Some(candidate);
        position.stop_price = candidate;
        // Same inputs no longer strictly improve the stop.
        assert!(trailing_stop_candidate(&position, 2.0).is_none());
    }

    #[test]
    fn test_trailing_stop_short_mirror() {
        let mut position = sample_position(Direction::Short);
        position.parent_snapshot.lowest_close = 97.0;
        position.observe_price(96.0);

        // ref min(97, 96) + 2 * 0.5 = 97.
        let candidate = trailing_stop_candidate(&position, 2.0).unwrap();
        assert!((candidate - 97.0).abs() < 1e-12);
        assert!(candidate < position.stop_price);
        assert!(candidate > position.last_price);
    }

    #[test]
    fn test_trail_multiple_weakens_on_fading_metrics() {
        let mut child = metric(0.01, 0.2, 0.8, 0.7);
        assert_eq!(effective_trail_multiple(2.4, &child), 2.4);

        child.efficiency_history = (0..10).map(|i| 0.9 - i as f64 * 0.01).collect();
        assert!((effective_trail_multiple(2.4, &child) - 2.0).abs() < 1e-12);

        // Floor at 1.6.
        assert!((effective_trail_multiple(1.7, &child) - 1.6).abs() < 1e-12);

        let mut momentum_fade = metric(0.01, 0.2, 0.8, 0.7);
        momentum_fade.momentum_history = vec![0.8, 0.9, 0.5];
        assert!((effective_trail_multiple(2.4, &momentum_fade) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_time_stop_threshold() {
        assert_eq!(time_stop_threshold(60, 10), 18);
        assert_eq!(time_stop_threshold(60, 30), 6);
        assert_eq!(time_stop_threshold(30, 10), 9);
        assert_eq!(time_stop_threshold(10, 30), 1);
    }

    #[test]
    fn test_structure_break_counts_consecutive_closes() {
        let mut position = sample_position(Direction::Long);
        // Threshold: stop 99 + 0.3 * 0.2 = 99.06.
        position.child_snapshot.close_history = vec![99.5, 99.4];
        assert_eq!(structure_break_counter(&position), 0);

        position.child_snapshot.close_history = vec![99.0, 98.9];
        assert_eq!(structure_break_counter(&position), 1);

        position.structure_break_counter = 1;
        assert_eq!(structure_break_counter(&position), 2);

        // One close back on the right side resets the count.
        position.child_snapshot.close_history = vec![98.9, 99.5];
        assert_eq!(structure_break_counter(&position), 0);
    }

    #[test]
    fn test_partial_quantity_is_bounded_by_remaining() {
        let mut position = sample_position(Direction::Long);
        position.base_quantity = 10.0;
        position.total_quantity = 10.0;
        assert!((partial_quantity(&position) - 3.0).abs() < 1e-12);

        position.total_quantity = 2.0;
        assert!((partial_quantity(&position) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_push_history_capped() {
        let mut history = Vec::new();
        for i in 0..(HISTORY_CAP + 5) {
            push_history_capped(&mut history, i as f64);
        }
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history[0], 5.0);
    }
}

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::state::{
    break_even_stop, break_even_threshold, effective_trail_multiple, partial_quantity, plan_entry,
    push_history_capped, structure_break_counter, time_stop_threshold, trailing_stop_candidate,
    EntryPlan, ManagedPosition, TimeframeScores, EPSILON_QTY, MIN_STOP_PRICE,
};
use crate::api::ChatNotifier;
use crate::execution::{PriceSubscription, TradingExecutor};
use crate::models::{Direction, MoversResult, TimeframeMetric};

/// Candidate gating and position lifecycle. Owns every `ManagedPosition`;
/// the executor owns live exchange state.
///
/// Cloneable handle; clones share the position map and subscriptions.
#[derive(Clone)]
pub struct StrategyEngine {
    executor: Arc<TradingExecutor>,
    notifier: ChatNotifier,
    positions: Arc<Mutex<HashMap<String, ManagedPosition>>>,
    subscriptions: Arc<Mutex<HashMap<String, PriceSubscription>>>,
    ksl_buffer: f64,
}

impl StrategyEngine {
    pub fn new(executor: Arc<TradingExecutor>, notifier: ChatNotifier, ksl_buffer: f64) -> Self {
        Self {
            executor,
            notifier,
            positions: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            ksl_buffer: ksl_buffer.clamp(0.5, 2.0),
        }
    }

    /// One full strategy pass for a fresh `MoversResult`: reconcile against
    /// the exchange, manage open positions, evaluate new candidates, then
    /// manage once more so freshly opened positions get a pass too.
    pub async fn on_cycle(&self, movers: &MoversResult) {
        self.reconcile().await;
        self.executor.flatten_residual_positions().await;
        self.refresh_snapshots(movers).await;

        self.manage_all().await;
        self.evaluate_candidates(movers).await;
        self.manage_all().await;
    }

    /// Live price tick for one symbol. Reuses the last cycle's metric
    /// snapshots, mutating their close/extreme fields in place.
    pub async fn on_price_tick(&self, symbol: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        {
            let mut positions = self.positions.lock().await;
            let Some(state) = positions.get_mut(symbol) else {
                return;
            };
            for snapshot in [&mut state.parent_snapshot, &mut state.child_snapshot] {
                snapshot.latest_close = price;
                snapshot.highest_close = snapshot.highest_close.max(price);
                snapshot.lowest_close = snapshot.lowest_close.min(price);
                push_history_capped(&mut snapshot.close_history, price);
            }
        }
        self.manage_symbol(symbol, price).await;
    }

    pub async fn managed_symbols(&self) -> Vec<String> {
        self.positions.lock().await.keys().cloned().collect()
    }

    /// Exchange is authoritative: drop managed state whose side the exchange
    /// no longer reports, and sync quantities for the rest.
    async fn reconcile(&self) {
        if let Err(err) = self.executor.refresh_state().await {
            tracing::warn!("State refresh failed during reconcile: {}", err);
        }
        let account = self.executor.account().await;

        let mut dropped = Vec::new();
        {
            let mut positions = self.positions.lock().await;
            positions.retain(|symbol, managed| {
                let quantity = account
                    .positions
                    .get(symbol)
                    .map(|p| p.quantity_for(managed.direction))
                    .unwrap_or(0.0);
                if quantity > EPSILON_QTY {
                    managed.total_quantity = quantity;
                    true
                } else {
                    dropped.push(symbol.clone());
                    false
                }
            });
        }

        for symbol in dropped {
            tracing::info!("{}: position exited externally, dropping state", symbol);
            self.unsubscribe(&symbol).await;
        }
    }

    /// Replace stored metric snapshots with this cycle's values.
    async fn refresh_snapshots(&self, movers: &MoversResult) {
        let mut positions = self.positions.lock().await;
        for (symbol, state) in positions.iter_mut() {
            let Some(metrics) = movers.metrics.get(symbol) else {
                continue;
            };
            if let Some(parent) = metrics.get(state.parent_timeframe.label) {
                state.parent_snapshot = parent.clone();
                state.parent_atr = parent.atr_value;
            }
            if let Some(child) = metrics.get(state.child_timeframe.label) {
                state.child_snapshot = child.clone();
                state.child_atr = child.atr_value;
            }
        }
    }

    async fn manage_all(&self) {
        for symbol in self.managed_symbols().await {
            let price = match self.executor.get_mark_price(&symbol).await {
                Ok(price) => price,
                Err(err) => {
                    tracing::warn!("{}: mark price unavailable, skipping pass: {}", symbol, err);
                    continue;
                }
            };
            self.manage_symbol(&symbol, price).await;
        }
    }

    /// Walk the state machine for one symbol at one price. Per-symbol
    /// actions are strictly sequential: the position map lock is held for
    /// the whole pass.
    async fn manage_symbol(&self, symbol: &str, price: f64) {
        let mut positions = self.positions.lock().await;
        let Some(state) = positions.get_mut(symbol) else {
            return;
        };
        state.observe_price(price);

        let child_scores = TimeframeScores::from_metric(&state.child_snapshot);
        let direction = state.direction;
        let current_r = state.r_multiple(price);

        // Break-even move.
        if !state.be_moved && state.max_r >= break_even_threshold(&child_scores) {
            let stop = break_even_stop(direction, state.entry_price, price);
            if self
                .executor
                .replace_stop_loss(symbol, direction, state.total_quantity, stop)
                .await
                .is_some()
            {
                state.stop_price = stop;
                state.trail_price = None;
                state.be_moved = true;
                tracing::info!("{}: stop moved to break-even at {:.6}", symbol, stop);
            }
        }

        // Trailing stop, tighten-only.
        let trail_multiple =
            effective_trail_multiple(state.trail_atr_multiple, &state.child_snapshot);
        if let Some(candidate) = trailing_stop_candidate(state, trail_multiple) {
            if self
                .executor
                .replace_stop_loss(symbol, direction, state.total_quantity, candidate)
                .await
                .is_some()
            {
                state.trail_price = Some(candidate);
                state.stop_price = candidate;
                state.sl_distance = trail_multiple * state.parent_atr;
                tracing::debug!("{}: trail tightened to {:.6}", symbol, candidate);
            }
        }

        // Partials.
        let clean_trend = state.clean_score >= 0.6 && state.gate_score >= 0.7;
        let strong_volume = child_scores.volume >= 55.0;
        if !state.partial_one_taken {
            let clean_path = clean_trend && current_r >= 2.0;
            let general_path = !clean_trend && !strong_volume && current_r >= 1.5;
            if clean_path || general_path {
                let quantity = partial_quantity(state);
                if quantity > EPSILON_QTY {
                    if let Some(executed) = self
                        .executor
                        .reduce_position(symbol, direction, quantity)
                        .await
                    {
                        state.total_quantity =
                            (state.total_quantity - executed.quantity).max(0.0);
                        state.partial_one_taken = true;
                        tracing::info!(
                            "{}: first partial {:.6} at R {:.2}",
                            symbol,
                            executed.quantity,
                            current_r
                        );

                        if general_path && !state.be_moved {
                            let stop = break_even_stop(direction, state.entry_price, price);
                            if self
                                .executor
                                .replace_stop_loss(symbol, direction, state.total_quantity, stop)
                                .await
                                .is_some()
                            {
                                state.stop_price = stop;
                                state.trail_price = None;
                                state.be_moved = true;
                            }
                        }
                    }
                }
            }
        }
        if !state.partial_two_taken && !clean_trend && current_r >= 2.0 {
            let quantity = partial_quantity(state);
            if quantity > EPSILON_QTY {
                if let Some(executed) = self
                    .executor
                    .reduce_position(symbol, direction, quantity)
                    .await
                {
                    state.total_quantity = (state.total_quantity - executed.quantity).max(0.0);
                    state.partial_two_taken = true;
                    tracing::info!(
                        "{}: second partial {:.6} at R {:.2}",
                        symbol,
                        executed.quantity,
                        current_r
                    );
                }
            }
        }

        // Adds, only once risk is off the table.
        if state.be_moved
            && state.add_count < 2
            && state.clean_score >= 0.65
            && state.gate_score >= 0.7
            && child_scores.efficiency >= 55.0
        {
            let (required_r, fraction) = if state.add_count == 0 {
                (1.0, 0.5)
            } else {
                (2.0, 0.33)
            };
            if current_r >= required_r {
                let quantity = fraction * state.base_quantity;
                if let Some(executed) = self
                    .executor
                    .increase_position(symbol, direction, quantity)
                    .await
                {
                    state.total_quantity += executed.quantity;
                    state.add_count += 1;
                    tracing::info!(
                        "{}: add #{} of {:.6} at R {:.2}",
                        symbol,
                        state.add_count,
                        executed.quantity,
                        current_r
                    );
                    // Re-cover the enlarged position at the same stop.
                    self.executor
                        .replace_stop_loss(
                            symbol,
                            direction,
                            state.total_quantity,
                            state.stop_price,
                        )
                        .await;
                }
            }
        }

        // Two-stage time stop.
        let now = Utc::now();
        let threshold_candles = time_stop_threshold(
            state.parent_timeframe.minutes,
            state.child_timeframe.minutes,
        );
        if state.time_stop_stage == 0 {
            let elapsed_children =
                state.minutes_open(now) / state.child_timeframe.minutes.max(1) as i64;
            if elapsed_children >= threshold_candles as i64 && state.max_r < 0.5 {
                let tightened = match direction {
                    Direction::Long => state.entry_price - 0.5 * state.initial_sl_distance,
                    Direction::Short => state.entry_price + 0.5 * state.initial_sl_distance,
                }
                .max(MIN_STOP_PRICE);

                let improves = match direction {
                    Direction::Long => tightened > state.effective_stop(),
                    Direction::Short => tightened < state.effective_stop(),
                };
                if !improves {
                    state.time_stop_stage = 1;
                    state.time_stop_at = Some(now);
                } else if self
                    .executor
                    .replace_stop_loss(symbol, direction, state.total_quantity, tightened)
                    .await
                    .is_some()
                {
                    state.stop_price = tightened;
                    state.trail_price = None;
                    state.time_stop_stage = 1;
                    state.time_stop_at = Some(now);
                    tracing::info!("{}: time stop armed, stop tightened to {:.6}", symbol, tightened);
                }
            }
        } else if let Some(armed_at) = state.time_stop_at {
            let stall_minutes = (threshold_candles * state.child_timeframe.minutes) as i64;
            if (now - armed_at).num_minutes() >= stall_minutes && state.max_r < 0.5 {
                self.close_position(&mut positions, symbol, "time stop").await;
                return;
            }
        }

        // Structure break on the child close series.
        let Some(state) = positions.get_mut(symbol) else {
            return;
        };
        state.structure_break_counter = structure_break_counter(state);
        if state.structure_break_counter >= 2 {
            self.close_position(&mut positions, symbol, "structure break")
                .await;
        }
    }

    /// Candidate evaluation over the aggregated board.
    async fn evaluate_candidates(&self, movers: &MoversResult) {
        for aggregated in &movers.aggregated_top {
            let symbol = &aggregated.entry.symbol;
            if self.positions.lock().await.contains_key(symbol) {
                continue;
            }
            if !self.executor.can_open_position(symbol).await {
                continue;
            }
            let Some(metrics) = movers.metrics.get(symbol) else {
                continue;
            };

            let penalty = aggregated.metrics.liquidity_penalty;
            let Some(plan) = plan_entry(metrics, penalty, self.ksl_buffer) else {
                continue;
            };

            self.open_position(symbol, metrics, &plan, aggregated.entry.last_price)
                .await;
        }
    }

    async fn open_position(
        &self,
        symbol: &str,
        metrics: &HashMap<String, TimeframeMetric>,
        plan: &EntryPlan,
        last_price: f64,
    ) {
        let Some(order) = self
            .executor
            .create_market_order(symbol, plan.direction, plan.size_scale)
            .await
        else {
            return;
        };
        if order.quantity <= EPSILON_QTY {
            return;
        }

        let entry_price = order.avg_price.unwrap_or(last_price);
        let stop_price = match plan.direction {
            Direction::Long => (entry_price - plan.sl_distance).max(MIN_STOP_PRICE),
            Direction::Short => entry_price + plan.sl_distance,
        };

        if self
            .executor
            .place_stop_loss(symbol, plan.direction, order.quantity, stop_price)
            .await
            .is_none()
        {
            tracing::warn!("{}: initial stop rejected, position unprotected", symbol);
        }

        let (Some(parent_snapshot), Some(child_snapshot)) =
            (metrics.get(plan.parent.label), metrics.get(plan.child.label))
        else {
            return;
        };

        let state = ManagedPosition {
            symbol: symbol.to_string(),
            direction: plan.direction,
            parent_timeframe: plan.parent,
            child_timeframe: plan.child,
            entry_price,
            base_quantity: order.quantity,
            total_quantity: order.quantity,
            k_sl: plan.k_sl,
            initial_sl_distance: plan.sl_distance,
            sl_distance: plan.sl_distance,
            stop_price,
            trail_atr_multiple: plan.trail_atr_multiple,
            clean_score: plan.clean_score,
            gate_score: plan.gate_score,
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
            parent_atr: parent_snapshot.atr_value,
            child_atr: child_snapshot.atr_value,
            risk_amount: order.quantity * plan.sl_distance,
            max_r: 0.0,
            parent_snapshot: parent_snapshot.clone(),
            child_snapshot: child_snapshot.clone(),
            last_price: entry_price,
        };

        tracing::info!(
            "{}: opened {:?} qty {:.6} @ {:.6}, stop {:.6} (kSl {:.2})",
            symbol,
            plan.direction,
            state.total_quantity,
            entry_price,
            stop_price,
            plan.k_sl
        );
        self.notify(format!(
            "Opened {:?} {} qty {:.6} @ {:.6} (stop {:.6})",
            plan.direction, symbol, state.total_quantity, entry_price, stop_price
        ))
        .await;

        self.positions
            .lock()
            .await
            .insert(symbol.to_string(), state);
        self.spawn_tick_task(symbol.to_string()).await;
    }

    /// Cancel working orders, flatten what is left, drop state, stop the
    /// price stream.
    async fn close_position(
        &self,
        positions: &mut HashMap<String, ManagedPosition>,
        symbol: &str,
        reason: &str,
    ) {
        let Some(state) = positions.remove(symbol) else {
            return;
        };

        self.executor.cancel_all_symbol_orders(symbol).await;
        if state.total_quantity > EPSILON_QTY {
            self.executor
                .reduce_position(symbol, state.direction, state.total_quantity)
                .await;
        }
        self.unsubscribe(symbol).await;

        tracing::info!(
            "{}: closed {:?} ({}), last price {:.6}, max R {:.2}",
            symbol,
            state.direction,
            reason,
            state.last_price,
            state.max_r
        );
        self.notify(format!(
            "Closed {:?} {} ({}), max R {:.2}",
            state.direction, symbol, reason, state.max_r
        ))
        .await;
    }

    /// Per-symbol tick pump: the watch channel keeps only the newest tick,
    /// so a tick arriving mid-evaluation simply replaces the buffered one.
    async fn spawn_tick_task(&self, symbol: String) {
        let subscription = self.executor.subscribe_price_stream(&symbol);
        let mut receiver = subscription.receiver.clone();
        self.subscriptions
            .lock()
            .await
            .insert(symbol.clone(), subscription);

        let engine = self.clone();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let tick = *receiver.borrow_and_update();
                engine.on_price_tick(&symbol, tick.mark_price).await;
            }
        });
    }

    async fn unsubscribe(&self, symbol: &str) {
        // Dropping the subscription aborts the poller; the tick task then
        // sees a closed channel and exits.
        self.subscriptions.lock().await.remove(symbol);
    }

    async fn notify(&self, message: String) {
        if let Err(err) = self.notifier.send(&message).await {
            tracing::warn!("Notification failed: {}", err);
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_position_for_tests(&self, state: ManagedPosition) {
        self.positions
            .lock()
            .await
            .insert(state.symbol.clone(), state);
    }
}

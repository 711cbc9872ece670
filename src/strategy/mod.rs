// Strategy engine: candidate gating plus the position-lifecycle state
// machine (break-even, trailing, partials, adds, time stop, structure break).
pub mod engine;
pub mod state;

pub use engine::StrategyEngine;
pub use state::{
    break_even_stop, break_even_threshold, effective_trail_multiple, plan_entry,
    select_direction, select_framework, structure_break_counter, time_stop_threshold,
    trailing_stop_candidate, EntryPlan, ManagedPosition, TimeframeScores,
};

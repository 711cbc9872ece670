// Exchange-side execution: account state, orders, filters.
pub mod executor;
pub mod filters;

pub use executor::{
    AccountState, ExecutedOrder, PriceSubscription, PriceTick, TradingExecutor, DEFAULT_LEVERAGE,
    MAX_POSITIONS,
};
pub use filters::{FilterCache, SymbolFilters};

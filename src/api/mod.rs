pub mod binance;
pub mod fetcher;
pub mod notifier;

pub use binance::BinanceFuturesClient;
pub use fetcher::{FetchError, RateLimitedFetcher};
pub use notifier::ChatNotifier;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use moverbot::api::notifier::format_movers_message;
use moverbot::api::{BinanceFuturesClient, ChatNotifier, RateLimitedFetcher};
use moverbot::config::Config;
use moverbot::execution::TradingExecutor;
use moverbot::movers::MoversPipeline;
use moverbot::server::{self, SharedMovers};
use moverbot::strategy::StrategyEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        "Moverbot starting: cycle every {}min, trading {}",
        config.refresh_interval_minutes,
        if config.trading_enabled() { "on" } else { "off" }
    );

    let client = Arc::new(BinanceFuturesClient::new(
        RateLimitedFetcher::new(),
        config.api_key.clone(),
        config.api_secret.clone(),
        config.recv_window,
    )?);

    let executor = Arc::new(TradingExecutor::new(client.clone(), config.leverage));
    if let Err(err) = executor.initialize().await {
        tracing::error!("Executor initialization failed: {}", err);
    }

    let notifier = ChatNotifier::new(config.chat_token.clone(), config.chat_id.clone());
    let engine = StrategyEngine::new(executor, notifier.clone(), config.ksl_buffer);
    let pipeline = Arc::new(Mutex::new(MoversPipeline::new(client)));

    let shared: SharedMovers = Arc::new(tokio::sync::RwLock::new(None));
    {
        let shared = shared.clone();
        let port = config.port;
        tokio::spawn(async move {
            if let Err(err) = server::serve(shared, port).await {
                tracing::error!("Movers API failed: {}", err);
            }
        });
    }

    let cycle_active = Arc::new(AtomicBool::new(false));
    let mut ticker = interval(Duration::from_secs(config.refresh_interval_minutes * 60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cycle_active.swap(true, Ordering::SeqCst) {
                    tracing::warn!("Previous cycle still active, dropping this tick");
                    continue;
                }

                let pipeline = pipeline.clone();
                let engine = engine.clone();
                let notifier = notifier.clone();
                let shared = shared.clone();
                let cycle_active = cycle_active.clone();
                tokio::spawn(async move {
                    run_cycle(&pipeline, &engine, &notifier, &shared).await;
                    cycle_active.store(false, Ordering::SeqCst);
                });
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!("Signal handler failed: {}", err);
                }
                tracing::info!("Shutdown signal received, draining current cycle");
                break;
            }
        }
    }

    // Let an in-flight cycle finish before exiting.
    while cycle_active.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tracing::info!("Moverbot stopped");
    Ok(())
}

/// One scan + strategy pass. Failures are logged and never kill the process.
async fn run_cycle(
    pipeline: &Mutex<MoversPipeline>,
    engine: &StrategyEngine,
    notifier: &ChatNotifier,
    shared: &SharedMovers,
) {
    let result = {
        let mut pipeline = pipeline.lock().await;
        pipeline.run_cycle().await
    };

    match result {
        Ok(movers) => {
            *shared.write().await = Some(movers.clone());

            if let Err(err) = notifier.send(&format_movers_message(&movers)).await {
                tracing::warn!("Movers notification failed: {}", err);
            }

            engine.on_cycle(&movers).await;
        }
        Err(err) => {
            tracing::error!("Cycle failed: {:#}", err);
        }
    }
}

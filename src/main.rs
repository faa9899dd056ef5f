// =============================================================================
// Exchange Mirror: Main Entry Point
// =============================================================================
//
// Mirrors Binance order books and candles locally and keeps a fund-partitioned
// balance ledger reconciled against the account. Serves a read-only status
// API. In backtesting mode no candle sync workers are started and the clock
// is simulated.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exchange_mirror::api;
use exchange_mirror::app_state::AppState;
use exchange_mirror::binance::{BinanceClient, BinanceFeed};
use exchange_mirror::clock::{self, SharedClock, SimulatedClock};
use exchange_mirror::market_data::{CandleCache, OrderBookMirror};
use exchange_mirror::reconcile;
use exchange_mirror::runtime_config::MirrorConfig;
use exchange_mirror::types::CandleKey;

const CONFIG_PATH: &str = "mirror_config.json";

/// How often the candle consumer drains fetched batches into the stores.
const CANDLE_PUMP_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Exchange Mirror starting up");

    let mut config = MirrorConfig::load_or_default(CONFIG_PATH);
    config.apply_env();

    info!(
        symbols = ?config.symbols,
        timeframes = ?config.timeframes,
        backtesting = config.backtesting,
        nonce_mode = ?config.nonce_mode,
        "configured markets"
    );

    let clock: SharedClock = if config.backtesting {
        let start = chrono::Utc::now().timestamp_millis();
        info!(start_ms = start, "backtesting: simulated clock");
        Arc::new(SimulatedClock::new(start))
    } else {
        clock::system()
    };

    // ── 2. Exchange adapters ─────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let client = Arc::new(BinanceClient::new(api_key, api_secret)?);

    let (feed, mut updates) = BinanceFeed::new(client.clone());
    let feed = Arc::new(feed);

    // ── 3. Shared state ──────────────────────────────────────────────────
    let mirror = Arc::new(OrderBookMirror::new(
        feed.clone(),
        config.nonce_mode,
        config.max_pending_updates,
    ));
    let state = Arc::new(AppState::new(config.clone(), mirror.clone(), clock.clone()));
    let shutdown = CancellationToken::new();

    // ── 4. Order books ───────────────────────────────────────────────────
    let fwd_mirror = mirror.clone();
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let pair = update.pair().to_string();
            if let Err(e) = fwd_mirror.on_update(update) {
                error!(pair = %pair, error = %e, "order book corrupt, rebuilding");
                fwd_mirror.remove(&pair);
                let m = fwd_mirror.clone();
                tokio::spawn(async move {
                    m.get(&pair).await;
                });
            }
        }
    });

    for symbol in &config.symbols {
        let m = mirror.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            let book = m.get(&sym).await;
            info!(symbol = %sym, nonce = book.nonce, levels = book.buys.len() + book.sells.len(), "book ready");
        });
    }

    // ── 5. Candle sync ───────────────────────────────────────────────────
    let keys: Vec<CandleKey> = config
        .symbols
        .iter()
        .flat_map(|s| config.timeframes.iter().map(move |tf| CandleKey::new(s.clone(), *tf)))
        .collect();
    let mut cache = CandleCache::new(
        client.clone(),
        clock.clone(),
        config.sync_settings(),
        Some(config.candle_db_dir.clone()),
    );
    let candle_state = state.clone();
    let candle_shutdown = shutdown.clone();
    let candle_task = tokio::spawn(async move {
        for key in &keys {
            if let Err(e) = cache.acquire(key) {
                error!(key = %key, error = %e, "failed to open candle store");
            }
        }
        info!(count = keys.len(), "candle series acquired");

        let mut interval = tokio::time::interval(CANDLE_PUMP_INTERVAL);
        loop {
            tokio::select! {
                _ = candle_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let applied = cache.pump();
                    if applied > 0 {
                        info!(applied, "candles stored");
                    }
                    candle_state.publish_candle_status(cache.status());
                }
            }
        }

        for key in &keys {
            cache.release(key).await;
        }
        cache.shutdown().await;
    });

    // ── 6. Balance reconciliation ────────────────────────────────────────
    if client.has_credentials() {
        let recon_state = state.clone();
        let recon_client = client.clone();
        let (exchange, coins, every) = (
            config.exchange_name.clone(),
            config.tracked_coins.clone(),
            Duration::from_secs(config.reconcile_interval_secs.max(1)),
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let outcome = reconcile::reconcile_once(
                    recon_client.as_ref(),
                    &exchange,
                    &coins,
                    &recon_state.ledger,
                    &recon_state.last_report,
                )
                .await;
                if let Err(e) = &outcome {
                    warn!(error = %e, "reconciliation failed");
                }
                recon_state.record_reconcile(outcome);
            }
        });
    } else {
        warn!("BINANCE_API_KEY/BINANCE_API_SECRET not set, balance reconciliation disabled");
    }

    // ── 7. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    shutdown.cancel();
    if let Err(e) = candle_task.await {
        error!(error = %e, "candle task panicked");
    }
    feed.shutdown().await;

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save mirror config on shutdown");
    }

    info!("Exchange Mirror shut down complete.");
    Ok(())
}

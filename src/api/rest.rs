// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// Read-only status surface under `/api/v1/`. CORS is permissive; tighten
// `allowed_origins` when exposing this beyond localhost.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;
use crate::balances::BalanceSummary;
use crate::market_data::{CandleStatus, Offer};
use crate::reconcile::ReconcileResult;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/books/:pair", get(book))
        .route("/api/v1/balances", get(balances))
        .route("/api/v1/candles", get(candles))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    uptime_secs: u64,
    backtesting: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: state.clock.now_ms(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        backtesting: state.config.read().backtesting,
    })
}

// =============================================================================
// Order books
// =============================================================================

fn default_depth() -> usize {
    20
}

#[derive(Deserialize)]
struct BookQuery {
    #[serde(default = "default_depth")]
    depth: usize,
}

#[derive(Serialize)]
struct BookResponse {
    pair: String,
    nonce: i64,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    mid: Option<f64>,
    spread_bps: Option<f64>,
    imbalance: f64,
    buys: Vec<Offer>,
    sells: Vec<Offer>,
}

/// First request for a pair bootstraps its book.
async fn book(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Query(q): Query<BookQuery>,
) -> Json<BookResponse> {
    let book = state.mirror.get(&pair.to_uppercase()).await;
    Json(BookResponse {
        best_bid: book.best_bid(),
        best_ask: book.best_ask(),
        mid: book.mid(),
        spread_bps: book.spread_bps(),
        imbalance: book.imbalance(q.depth),
        buys: book.buys.iter().take(q.depth).copied().collect(),
        sells: book.sells.iter().take(q.depth).copied().collect(),
        pair: book.pair,
        nonce: book.nonce,
    })
}

// =============================================================================
// Balances
// =============================================================================

#[derive(Serialize)]
struct BalancesResponse {
    balances: Vec<BalanceSummary>,
    last_reconcile: Option<ReconcileResult>,
    last_reconcile_error: Option<String>,
}

async fn balances(State(state): State<Arc<AppState>>) -> Json<BalancesResponse> {
    Json(BalancesResponse {
        balances: state.ledger.lock().summary(),
        last_reconcile: state.last_reconcile.read().clone(),
        last_reconcile_error: state.last_reconcile_error.read().clone(),
    })
}

// =============================================================================
// Candles
// =============================================================================

async fn candles(State(state): State<Arc<AppState>>) -> Json<Vec<CandleStatus>> {
    Json(state.candle_status.read().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SimulatedClock};
    use crate::market_data::orderbook::BookSnapshot;
    use crate::market_data::{BookFeed, NonceMode, OrderBookMirror};
    use crate::runtime_config::MirrorConfig;
    use crate::types::BalanceInfo;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FixedFeed;

    #[async_trait]
    impl BookFeed for FixedFeed {
        async fn subscribe(&self, _pair: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn snapshot(&self, pair: &str) -> anyhow::Result<BookSnapshot> {
            if pair != "BTCUSDT" {
                anyhow::bail!("unknown symbol {pair}");
            }
            Ok(BookSnapshot {
                pair: pair.to_string(),
                nonce: 42,
                buys: vec![Offer::new(99.0, 1.0), Offer::new(98.0, 2.0)],
                sells: vec![Offer::new(101.0, 1.0)],
            })
        }

        fn unsubscribe(&self, _pair: &str) {}
    }

    fn state() -> Arc<AppState> {
        let clock = Arc::new(SimulatedClock::new(1_700_000_000_000));
        let mirror = Arc::new(OrderBookMirror::new(
            Arc::new(FixedFeed),
            NonceMode::Contiguous,
            100,
        ));
        Arc::new(AppState::new(MirrorConfig::default(), mirror, clock))
    }

    #[tokio::test]
    async fn health_reports_clock_time() {
        let Json(resp) = health(State(state())).await;
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.server_time, 1_700_000_000_000);
        assert!(!resp.backtesting);
    }

    #[tokio::test]
    async fn book_bootstraps_and_truncates_depth() {
        let s = state();
        let Json(resp) = book(
            State(s.clone()),
            Path("btcusdt".into()),
            Query(BookQuery { depth: 1 }),
        )
        .await;
        assert_eq!(resp.pair, "BTCUSDT");
        assert_eq!(resp.nonce, 42);
        assert_eq!(resp.buys, vec![Offer::new(99.0, 1.0)]);
        assert_eq!(resp.mid, Some(100.0));
        assert!(s.mirror.peek("BTCUSDT").is_some());

        let Json(missing) = book(
            State(s.clone()),
            Path("nope".into()),
            Query(BookQuery { depth: 5 }),
        )
        .await;
        assert_eq!(missing.nonce, 0);
        assert!(missing.buys.is_empty());
    }

    #[tokio::test]
    async fn balances_and_candles_reflect_published_state() {
        let s = state();
        s.ledger
            .lock()
            .apply_exchange_snapshot(
                "binance",
                &[BalanceInfo {
                    asset: "USDT".into(),
                    free: 10.0,
                    locked: 0.0,
                }],
                Utc::now(),
            )
            .unwrap();
        let before = s.current_state_version();
        s.publish_candle_status(vec![CandleStatus {
            key: "BTCUSDT@1m".into(),
            count: 3,
            newest: Some(s.clock.now_ms()),
            data_syncing: false,
            refs: 1,
            worker_running: true,
        }]);
        assert!(s.current_state_version() > before);

        let Json(b) = balances(State(s.clone())).await;
        assert_eq!(b.balances.len(), 1);
        assert_eq!(b.balances[0].coin, "USDT");
        assert!(b.last_reconcile.is_none());

        let Json(c) = candles(State(s)).await;
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].count, 3);
    }
}

// =============================================================================
// Central Application State
// =============================================================================
//
// Shared handles for the order-book mirror, the balance ledger and the last
// published candle status. Background tasks hold `Arc<AppState>`; the REST
// API reads from it.
//
// Thread safety:
//   - The mirror synchronises internally.
//   - parking_lot locks for the ledger and the published snapshots.
//   - The candle cache itself is owned by its consumer task and only its
//     status summary is published here.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::balances::BalanceLedger;
use crate::clock::SharedClock;
use crate::market_data::{CandleStatus, OrderBookMirror};
use crate::reconcile::ReconcileResult;
use crate::runtime_config::MirrorConfig;
use crate::types::BalanceInfo;

pub struct AppState {
    /// Incremented on every published change.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<MirrorConfig>>,
    pub clock: SharedClock,

    // ── Market Data ─────────────────────────────────────────────────────
    pub mirror: Arc<OrderBookMirror>,
    pub candle_status: RwLock<Vec<CandleStatus>>,

    // ── Balances ────────────────────────────────────────────────────────
    pub ledger: Mutex<BalanceLedger>,
    pub last_report: RwLock<Vec<BalanceInfo>>,
    pub last_reconcile: RwLock<Option<ReconcileResult>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: MirrorConfig, mirror: Arc<OrderBookMirror>, clock: SharedClock) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config: Arc::new(RwLock::new(config)),
            ledger: Mutex::new(BalanceLedger::new(clock.clone())),
            clock,
            mirror,
            candle_status: RwLock::new(Vec::new()),
            last_report: RwLock::new(Vec::new()),
            last_reconcile: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn publish_candle_status(&self, status: Vec<CandleStatus>) {
        *self.candle_status.write() = status;
        self.increment_version();
    }

    pub fn record_reconcile(&self, outcome: anyhow::Result<ReconcileResult>) {
        match outcome {
            Ok(result) => {
                *self.last_reconcile.write() = Some(result);
                *self.last_reconcile_error.write() = None;
            }
            Err(e) => {
                *self.last_reconcile_error.write() = Some(format!("{e:#}"));
            }
        }
        self.increment_version();
    }
}

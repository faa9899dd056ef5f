// =============================================================================
// Runtime Configuration: mirror settings with atomic save
// =============================================================================
//
// Every field carries a serde default so that adding fields never breaks
// loading an older config file. Persistence writes a `.tmp` sibling and then
// renames it over the target.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::candle_sync::SyncSettings;
use crate::market_data::NonceMode;
use crate::types::TimeFrame;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_timeframes() -> Vec<TimeFrame> {
    vec![TimeFrame::M1, TimeFrame::H1]
}

fn default_candle_db_dir() -> PathBuf {
    PathBuf::from("data/candles")
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_candles_per_request() -> usize {
    500
}

fn default_initial_history_candles() -> usize {
    1_000
}

fn default_max_pending_updates() -> usize {
    10_000
}

/// Binance depth update ids skip values between events.
fn default_nonce_mode() -> NonceMode {
    NonceMode::Monotonic
}

fn default_exchange_name() -> String {
    "binance".to_string()
}

fn default_tracked_coins() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string(), "USDT".to_string()]
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// MirrorConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    // --- Markets ------------------------------------------------------------

    /// Pairs whose order books and candles are mirrored.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<TimeFrame>,

    // --- Order books --------------------------------------------------------

    /// Per-pair cap on buffered feed updates. Oldest deltas are dropped first.
    #[serde(default = "default_max_pending_updates")]
    pub max_pending_updates: usize,

    #[serde(default = "default_nonce_mode")]
    pub nonce_mode: NonceMode,

    // --- Candles ------------------------------------------------------------

    /// One SQLite file per pair lives here.
    #[serde(default = "default_candle_db_dir")]
    pub candle_db_dir: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_candles_per_request")]
    pub max_candles_per_request: usize,

    /// How far back an empty store starts syncing, in candles.
    #[serde(default = "default_initial_history_candles")]
    pub initial_history_candles: usize,

    /// Replay mode: no sync workers, simulated clock.
    #[serde(default)]
    pub backtesting: bool,

    // --- Balances -----------------------------------------------------------

    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,

    /// Coins kept in the ledger even when the account reports none.
    #[serde(default = "default_tracked_coins")]
    pub tracked_coins: Vec<String>,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    // --- API ----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            max_pending_updates: default_max_pending_updates(),
            nonce_mode: default_nonce_mode(),
            candle_db_dir: default_candle_db_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            max_candles_per_request: default_max_candles_per_request(),
            initial_history_candles: default_initial_history_candles(),
            backtesting: false,
            exchange_name: default_exchange_name(),
            tracked_coins: default_tracked_coins(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl MirrorConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mirror config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse mirror config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            backtesting = config.backtesting,
            "mirror config loaded"
        );

        Ok(config)
    }

    /// Load from `path`, or defaults if it cannot be read.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "using default mirror config");
                Self::default()
            }
        }
    }

    /// Persist to `path` with an atomic write (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise mirror config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "mirror config saved (atomic)");
        Ok(())
    }

    /// Apply `MIRROR_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MIRROR_SYMBOLS") {
            self.symbols = split_list(&v);
        }
        if let Ok(v) = std::env::var("MIRROR_CANDLE_DB_DIR") {
            self.candle_db_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MIRROR_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MIRROR_BACKTESTING") {
            self.backtesting = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_candles_per_request: self.max_candles_per_request,
            initial_history_candles: self.initial_history_candles,
            backtesting: self.backtesting,
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

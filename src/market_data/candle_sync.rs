// =============================================================================
// Candle Sync: background fetch loops feeding per-key candle stores
// =============================================================================
//
// One worker task per (pair, timeframe) while at least one consumer holds a
// reference. Workers only fetch; fetched batches are sent back over a channel
// and written into the store by whoever owns the `CandleCache` when it calls
// `pump()`, so the stores stay single-writer.
//
// Exchange candle endpoints are size-limited and occasionally fail or return
// nothing for a range. A failed request halves the window and retries on the
// next cycle; an empty one skips the gap.
// =============================================================================

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::market_data::candle_store::{Candle, CandleStore};
use crate::types::CandleKey;

/// Remote candle source.
#[async_trait]
pub trait CandleFetcher: Send + Sync {
    /// Candles with open time in `[from_ms, to_ms)`, oldest first.
    ///
    /// `Err` means the request failed and will be retried with a smaller
    /// window; `Ok` with no candles means the range is genuinely empty.
    async fn fetch_candles(&self, key: &CandleKey, from_ms: i64, to_ms: i64) -> Result<Vec<Candle>>;
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub max_candles_per_request: usize,
    pub initial_history_candles: usize,
    /// Backtests read stores only and never start workers.
    pub backtesting: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_candles_per_request: 500,
            initial_history_candles: 1_000,
            backtesting: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch window
// ---------------------------------------------------------------------------

/// The `[beg, end)` range the next fetch will request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWindow {
    beg: i64,
    span: i64,
    max_span: i64,
    min_span: i64,
}

impl SyncWindow {
    pub fn new(beg: i64, period_ms: i64, max_candles: usize) -> Self {
        let max_span = period_ms * max_candles.max(1) as i64;
        Self {
            beg,
            span: max_span,
            max_span,
            min_span: period_ms,
        }
    }

    pub fn beg(&self) -> i64 {
        self.beg
    }

    pub fn span(&self) -> i64 {
        self.span
    }

    /// End of the next request, never past `now`.
    pub fn end(&self, now: i64) -> i64 {
        (self.beg + self.span).min(now)
    }

    fn shrink(&mut self, end: i64) {
        self.span = ((end - self.beg) / 2).max(self.min_span);
    }

    fn skip(&mut self, end: i64) {
        self.beg = end;
        self.span = self.max_span;
    }

    /// Move `beg` to the newest fetched candle so it is fetched again while
    /// it is still forming. A historical window (`end < now`) that returned
    /// only the candle at `beg` jumps to `end` instead of stalling.
    fn advance(&mut self, last_ts: i64, end: i64, now: i64) {
        self.beg = if last_ts <= self.beg && end < now {
            end
        } else {
            last_ts.max(self.beg)
        };
        self.span = self.max_span;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Failed,
    Empty,
    Data(Vec<Candle>),
}

/// Run one fetch for the window and move it according to the result.
pub async fn sync_step(
    fetcher: &dyn CandleFetcher,
    key: &CandleKey,
    window: &mut SyncWindow,
    now: i64,
) -> StepOutcome {
    let end = window.end(now);
    match fetcher.fetch_candles(key, window.beg, end).await {
        Err(e) => {
            window.shrink(end);
            warn!(key = %key, beg = window.beg, end, span = window.span, error = %e,
                "candle fetch failed, shrinking window");
            StepOutcome::Failed
        }
        Ok(candles) if candles.is_empty() => {
            debug!(key = %key, beg = window.beg, end, "empty candle range skipped");
            window.skip(end);
            StepOutcome::Empty
        }
        Ok(candles) => {
            let last = candles.iter().map(|c| c.timestamp).max().unwrap_or(end);
            window.advance(last, end, now);
            StepOutcome::Data(candles)
        }
    }
}

/// True when the local series is known to lag the clock.
pub fn is_data_syncing(newest: Option<&Candle>, period_ms: i64, now: i64) -> bool {
    match newest {
        Some(c) => now > c.timestamp + period_ms,
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SyncBatch {
    key: CandleKey,
    candles: Vec<Candle>,
}

struct SyncWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

async fn run_sync_loop(
    key: CandleKey,
    fetcher: Arc<dyn CandleFetcher>,
    clock: SharedClock,
    settings: SyncSettings,
    start_ms: i64,
    tx: mpsc::UnboundedSender<SyncBatch>,
    cancel: CancellationToken,
) {
    info!(key = %key, start_ms, "candle sync loop started");
    let mut window = SyncWindow::new(
        start_ms,
        key.timeframe.period_ms(),
        settings.max_candles_per_request,
    );

    'poll: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'poll,
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }

        loop {
            if cancel.is_cancelled() {
                break 'poll;
            }
            let now = clock.now_ms();
            if window.beg() >= now {
                break;
            }
            let end = window.end(now);
            match sync_step(fetcher.as_ref(), &key, &mut window, now).await {
                StepOutcome::Failed => break,
                StepOutcome::Empty => {}
                StepOutcome::Data(candles) => {
                    let batch = SyncBatch {
                        key: key.clone(),
                        candles,
                    };
                    if tx.send(batch).is_err() {
                        warn!(key = %key, "candle consumer dropped, stopping sync loop");
                        break 'poll;
                    }
                }
            }
            if end >= now {
                break;
            }
        }
    }

    info!(key = %key, "candle sync loop stopped");
}

// ---------------------------------------------------------------------------
// CandleCache: consumer-owned stores plus ref-counted workers
// ---------------------------------------------------------------------------

struct CandleSeries {
    store: CandleStore,
    refs: usize,
    worker: Option<SyncWorker>,
    syncing: watch::Sender<bool>,
}

/// Serialisable view of one series for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CandleStatus {
    pub key: String,
    pub count: usize,
    pub newest: Option<i64>,
    pub data_syncing: bool,
    pub refs: usize,
    pub worker_running: bool,
}

pub struct CandleCache {
    series: HashMap<CandleKey, CandleSeries>,
    fetcher: Arc<dyn CandleFetcher>,
    clock: SharedClock,
    settings: SyncSettings,
    db_dir: Option<PathBuf>,
    batches_tx: mpsc::UnboundedSender<SyncBatch>,
    batches_rx: mpsc::UnboundedReceiver<SyncBatch>,
}

impl CandleCache {
    /// `db_dir = None` keeps every store in memory.
    pub fn new(
        fetcher: Arc<dyn CandleFetcher>,
        clock: SharedClock,
        settings: SyncSettings,
        db_dir: Option<PathBuf>,
    ) -> Self {
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        Self {
            series: HashMap::new(),
            fetcher,
            clock,
            settings,
            db_dir,
            batches_tx,
            batches_rx,
        }
    }

    /// Open the series for `key` without taking a reference.
    pub fn ensure(&mut self, key: &CandleKey) -> Result<&CandleStore, StoreError> {
        let series = match self.series.entry(key.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let store = match &self.db_dir {
                    Some(dir) => CandleStore::open(dir, key.clone(), self.clock.clone())?,
                    None => CandleStore::in_memory(key.clone(), self.clock.clone())?,
                };
                let newest = store.newest()?;
                let syncing = is_data_syncing(
                    newest.as_ref(),
                    key.timeframe.period_ms(),
                    self.clock.now_ms(),
                );
                let (tx, _rx) = watch::channel(syncing);
                e.insert(CandleSeries {
                    store,
                    refs: 0,
                    worker: None,
                    syncing: tx,
                })
            }
        };
        Ok(&series.store)
    }

    /// Take a reference on `key`, starting its sync worker on 0 -> 1.
    ///
    /// Must be called from within a tokio runtime.
    pub fn acquire(&mut self, key: &CandleKey) -> Result<(), StoreError> {
        self.ensure(key)?;
        let backtesting = self.settings.backtesting;
        let history = self.settings.initial_history_candles as i64;
        let now = self.clock.now_ms();

        let Some(series) = self.series.get_mut(key) else {
            return Ok(());
        };
        series.refs += 1;
        if series.refs > 1 || backtesting {
            return Ok(());
        }

        let period = key.timeframe.period_ms();
        let start_ms = match series.store.newest()? {
            Some(c) => c.timestamp,
            None => key.timeframe.period_start(now) - history * period,
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sync_loop(
            key.clone(),
            self.fetcher.clone(),
            self.clock.clone(),
            self.settings.clone(),
            start_ms,
            self.batches_tx.clone(),
            cancel.clone(),
        ));
        series.worker = Some(SyncWorker { cancel, handle });
        Ok(())
    }

    /// Drop a reference on `key`; on 1 -> 0 the worker is cancelled and joined.
    pub async fn release(&mut self, key: &CandleKey) {
        let worker = match self.series.get_mut(key) {
            Some(series) if series.refs > 0 => {
                series.refs -= 1;
                if series.refs == 0 {
                    series.worker.take()
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(worker) = worker {
            stop_worker(key, worker).await;
        }
    }

    /// Cancel every worker.
    pub async fn shutdown(&mut self) {
        let workers: Vec<(CandleKey, SyncWorker)> = self
            .series
            .iter_mut()
            .filter_map(|(k, s)| {
                s.refs = 0;
                s.worker.take().map(|w| (k.clone(), w))
            })
            .collect();
        for (key, worker) in workers {
            stop_worker(&key, worker).await;
        }
    }

    /// Write every batch fetched so far into its store and refresh the
    /// `DataSyncing` flags. Returns the number of candles applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(batch) = self.batches_rx.try_recv() {
            let Some(series) = self.series.get_mut(&batch.key) else {
                continue;
            };
            let result = match batch.candles.as_slice() {
                [single] => series.store.upsert(*single).map(|_| 1),
                many => series.store.upsert_batch(many),
            };
            match result {
                Ok(n) => applied += n,
                Err(e) => error!(key = %batch.key, error = %e, "failed to store fetched candles"),
            }
        }
        self.refresh_syncing();
        applied
    }

    /// Recompute `DataSyncing` for every series, notifying on change.
    pub fn refresh_syncing(&self) {
        let now = self.clock.now_ms();
        for (key, series) in &self.series {
            let newest = match series.store.newest() {
                Ok(n) => n,
                Err(e) => {
                    error!(key = %key, error = %e, "failed to read newest candle");
                    continue;
                }
            };
            let syncing = is_data_syncing(newest.as_ref(), key.timeframe.period_ms(), now);
            let changed = series.syncing.send_if_modified(|current| {
                if *current == syncing {
                    false
                } else {
                    *current = syncing;
                    true
                }
            });
            if changed {
                info!(key = %key, data_syncing = syncing, "data syncing changed");
            }
        }
    }

    pub fn store(&self, key: &CandleKey) -> Option<&CandleStore> {
        self.series.get(key).map(|s| &s.store)
    }

    pub fn store_mut(&mut self, key: &CandleKey) -> Option<&mut CandleStore> {
        self.series.get_mut(key).map(|s| &mut s.store)
    }

    pub fn data_syncing(&self, key: &CandleKey) -> Option<bool> {
        self.series.get(key).map(|s| *s.syncing.borrow())
    }

    /// Receiver notified whenever `DataSyncing` flips for `key`.
    pub fn subscribe_syncing(&self, key: &CandleKey) -> Option<watch::Receiver<bool>> {
        self.series.get(key).map(|s| s.syncing.subscribe())
    }

    pub fn refs(&self, key: &CandleKey) -> usize {
        self.series.get(key).map_or(0, |s| s.refs)
    }

    pub fn worker_running(&self, key: &CandleKey) -> bool {
        self.series
            .get(key)
            .and_then(|s| s.worker.as_ref())
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn status(&self) -> Vec<CandleStatus> {
        let mut out: Vec<CandleStatus> = self
            .series
            .iter()
            .map(|(key, s)| CandleStatus {
                key: key.to_string(),
                count: s.store.count().unwrap_or(0),
                newest: s.store.newest().ok().flatten().map(|c| c.timestamp),
                data_syncing: *s.syncing.borrow(),
                refs: s.refs,
                worker_running: s.worker.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

async fn stop_worker(key: &CandleKey, worker: SyncWorker) {
    worker.cancel.cancel();
    if let Err(e) = worker.handle.await {
        error!(key = %key, error = %e, "candle sync worker panicked");
    }
}

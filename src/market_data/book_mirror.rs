// =============================================================================
// Order Book Mirror: reconcile snapshot + delta feed messages per pair
// =============================================================================
//
// Feed nonces are not guaranteed to arrive in order (reconnect races, several
// delivery threads). Every update is buffered per pair and the buffer is
// re-examined on each arrival: the newest usable snapshot wins, anything at or
// below the resulting nonce is dropped, and deltas are applied in nonce order.
//
// One mutex guards both the book map and the pending buffers. Readers get a
// deep copy and never observe a book mid-merge.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::MirrorError;
use crate::market_data::orderbook::{BookSnapshot, OrderBook, PendingUpdate};

/// External push feed the mirror bootstraps from.
#[async_trait]
pub trait BookFeed: Send + Sync {
    /// Start delivering updates for `pair` to [`OrderBookMirror::on_update`].
    async fn subscribe(&self, pair: &str) -> Result<()>;

    /// Fetch a full book snapshot for `pair`.
    async fn snapshot(&self, pair: &str) -> Result<BookSnapshot>;

    /// Stop delivering updates for `pair`. Unknown pairs are ignored.
    fn unsubscribe(&self, pair: &str);
}

/// How strictly consecutive deltas must follow each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NonceMode {
    /// A delta is applied only when its nonce is exactly `book.nonce + 1`;
    /// later deltas wait in the buffer until the gap is filled or a newer
    /// snapshot arrives.
    #[default]
    Contiguous,
    /// Any delta with a higher nonce is applied. For feeds whose sequence
    /// numbers skip values (in-order transports).
    Monotonic,
}

#[derive(Default)]
struct MirrorState {
    books: HashMap<String, OrderBook>,
    pending: HashMap<String, Vec<PendingUpdate>>,
    subscribed: HashSet<String>,
}

pub struct OrderBookMirror {
    state: Mutex<MirrorState>,
    feed: Arc<dyn BookFeed>,
    mode: NonceMode,
    max_pending: usize,
}

impl OrderBookMirror {
    pub fn new(feed: Arc<dyn BookFeed>, mode: NonceMode, max_pending: usize) -> Self {
        Self {
            state: Mutex::new(MirrorState::default()),
            feed,
            mode,
            max_pending: max_pending.max(1),
        }
    }

    /// Return a copy of the book for `pair`, bootstrapping it on first use.
    ///
    /// Bootstrap failures are logged and yield an empty book with nonce 0;
    /// any partial state for the pair is discarded.
    pub async fn get(&self, pair: &str) -> OrderBook {
        let cached = self.state.lock().books.get(pair).cloned();
        if let Some(book) = cached {
            return book;
        }

        if let Err(e) = self.bootstrap(pair).await {
            error!(pair = %pair, error = %e, "order book bootstrap failed");
            return self.discard_unbuilt(pair);
        }

        self.state
            .lock()
            .books
            .get(pair)
            .cloned()
            .unwrap_or_else(|| OrderBook::empty(pair))
    }

    /// Copy of the current book without bootstrapping.
    pub fn peek(&self, pair: &str) -> Option<OrderBook> {
        self.state.lock().books.get(pair).cloned()
    }

    async fn bootstrap(&self, pair: &str) -> Result<()> {
        let first = self.state.lock().subscribed.insert(pair.to_string());
        if first {
            self.feed
                .subscribe(pair)
                .await
                .with_context(|| format!("subscribe to {pair} failed"))?;
        }

        let snapshot = self
            .feed
            .snapshot(pair)
            .await
            .with_context(|| format!("snapshot request for {pair} failed"))?;
        let nonce = snapshot.nonce;
        self.on_update(PendingUpdate::Snapshot(snapshot))?;
        if !self.state.lock().books.contains_key(pair) {
            anyhow::bail!("snapshot for {pair} at nonce {nonce} did not produce a book");
        }

        info!(pair = %pair, nonce, "order book bootstrapped");
        Ok(())
    }

    /// Buffer one feed update and reconcile the pair's book.
    ///
    /// Stale and duplicate updates are dropped silently. The only error is a
    /// nonce regression at apply time, which means the feed is corrupt; the
    /// pair's pending buffer is cleared before returning it.
    pub fn on_update(&self, update: PendingUpdate) -> Result<(), MirrorError> {
        let pair = update.pair().to_string();
        let mut guard = self.state.lock();
        let MirrorState { books, pending, .. } = &mut *guard;

        let buffer = pending.entry(pair.clone()).or_default();
        let duplicate = buffer
            .iter()
            .any(|u| u.nonce() == update.nonce() && u.is_snapshot() == update.is_snapshot());
        if duplicate {
            debug!(pair = %pair, nonce = update.nonce(), "duplicate update dropped");
            return Ok(());
        }
        buffer.push(update);

        let result = reconcile(&pair, books, buffer, self.mode);
        if result.is_err() {
            buffer.clear();
            return result;
        }

        if buffer.len() > self.max_pending {
            let excess = buffer.len() - self.max_pending;
            // Deltas go before snapshots, oldest first.
            buffer.sort_by_key(|u| (u.is_snapshot(), u.nonce()));
            buffer.drain(..excess);
            warn!(pair = %pair, dropped = excess, "pending update buffer full, oldest dropped");
        }
        Ok(())
    }

    /// Tear down local state for `pair` and its feed subscription.
    pub fn remove(&self, pair: &str) {
        {
            let mut state = self.state.lock();
            state.books.remove(pair);
            state.pending.remove(pair);
            state.subscribed.remove(pair);
        }
        self.feed.unsubscribe(pair);
    }

    /// After a failed bootstrap: keep a book a concurrent `get` managed to
    /// build, otherwise tear the pair down and return an empty book.
    fn discard_unbuilt(&self, pair: &str) -> OrderBook {
        {
            let mut state = self.state.lock();
            if let Some(book) = state.books.get(pair) {
                return book.clone();
            }
            state.pending.remove(pair);
            state.subscribed.remove(pair);
        }
        self.feed.unsubscribe(pair);
        OrderBook::empty(pair)
    }

    pub fn pairs(&self) -> Vec<String> {
        self.state.lock().books.keys().cloned().collect()
    }

    pub fn pending_len(&self, pair: &str) -> usize {
        self.state.lock().pending.get(pair).map_or(0, Vec::len)
    }
}

fn reconcile(
    pair: &str,
    books: &mut HashMap<String, OrderBook>,
    buffer: &mut Vec<PendingUpdate>,
    mode: NonceMode,
) -> Result<(), MirrorError> {
    let base_nonce = books.get(pair).map_or(0, |b| b.nonce);

    let snap_idx = buffer
        .iter()
        .enumerate()
        .filter(|(_, u)| u.is_snapshot() && u.nonce() > base_nonce)
        .max_by_key(|(_, u)| u.nonce())
        .map(|(i, _)| i);
    let snap = match snap_idx.map(|i| buffer.swap_remove(i)) {
        Some(PendingUpdate::Snapshot(s)) => Some(s),
        _ => None,
    };

    let nonce = snap.as_ref().map_or(base_nonce, |s| s.nonce);
    let before = buffer.len();
    buffer.retain(|u| u.nonce() > nonce);
    if buffer.len() < before {
        debug!(pair = %pair, nonce, dropped = before - buffer.len(), "stale updates discarded");
    }

    if snap.is_none() && buffer.is_empty() {
        return Ok(());
    }
    if snap.is_none() && !books.contains_key(pair) {
        // Deltas alone cannot bootstrap a book.
        return Ok(());
    }

    let book = books
        .entry(pair.to_string())
        .or_insert_with(|| OrderBook::empty(pair));
    if let Some(snap) = &snap {
        book.reset_from(snap);
    }

    // Only deltas remain: every snapshot is at or below `nonce`.
    buffer.sort_by_key(PendingUpdate::nonce);
    let mut applied = 0usize;
    for update in buffer.iter() {
        let PendingUpdate::Delta(delta) = update else {
            continue;
        };
        if delta.nonce <= book.nonce {
            return Err(MirrorError::NonceRegression {
                pair: pair.to_string(),
                book_nonce: book.nonce,
                update_nonce: delta.nonce,
            });
        }
        if mode == NonceMode::Contiguous && delta.nonce != book.nonce + 1 {
            debug!(pair = %pair, book_nonce = book.nonce, next = delta.nonce, "nonce gap, waiting");
            break;
        }
        book.apply_delta(delta);
        applied += 1;
    }

    let book_nonce = book.nonce;
    buffer.retain(|u| u.nonce() > book_nonce);
    if applied > 0 {
        debug!(pair = %pair, nonce = book_nonce, applied, "deltas applied");
    }
    Ok(())
}

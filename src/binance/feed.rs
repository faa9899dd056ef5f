// =============================================================================
// Binance Depth Feed: diff-depth WebSocket stream as a `BookFeed`
// =============================================================================
//
// `<symbol>@depth@100ms` delivers incremental depth events:
//
//   { "e": "depthUpdate", "s": "BNBBTC", "U": 157, "u": 160,
//     "b": [["0.0024", "10"]], "a": [["0.0026", "100"]] }
//
// Each event becomes a `BookDelta` with nonce `u`; a zero quantity removes the
// level and anything else sets it. Update ids are not contiguous across
// events, so the mirror runs in `NonceMode::Monotonic` for this feed.
//
// Stream tasks push into a channel; the owner drains it into
// `OrderBookMirror::on_update`. After a reconnect the task pushes a fresh REST
// snapshot so the book re-bases past whatever was missed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::binance::client::{parse_levels, BinanceClient};
use crate::market_data::book_mirror::BookFeed;
use crate::market_data::orderbook::{BookDelta, BookSnapshot, OfferChange, PendingUpdate};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct DepthStream {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BinanceFeed {
    client: Arc<BinanceClient>,
    updates: mpsc::UnboundedSender<PendingUpdate>,
    streams: Mutex<HashMap<String, DepthStream>>,
    cancel: CancellationToken,
}

impl BinanceFeed {
    /// Returns the feed and the receiving end its stream tasks push into.
    pub fn new(client: Arc<BinanceClient>) -> (Self, mpsc::UnboundedReceiver<PendingUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            client,
            updates: tx,
            streams: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        };
        (feed, rx)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Stop every stream task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            let _ = stream.handle.await;
        }
    }
}

#[async_trait]
impl BookFeed for BinanceFeed {
    async fn subscribe(&self, pair: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(pair) {
            if !stream.handle.is_finished() {
                return Ok(());
            }
        }

        let symbol = pair.to_string();
        let client = self.client.clone();
        let tx = self.updates.clone();
        let cancel = self.cancel.child_token();
        let stream_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = run_depth_stream(&symbol, &client, &tx, attempt > 0) => {
                        if let Err(e) = res {
                            error!(symbol = %symbol, error = %e, "depth stream error, reconnecting in 5s");
                        }
                    }
                }
                if tx.is_closed() {
                    break;
                }
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
            info!(symbol = %symbol, "depth stream stopped");
        });
        streams.insert(
            pair.to_string(),
            DepthStream {
                cancel: stream_cancel,
                handle,
            },
        );
        Ok(())
    }

    async fn snapshot(&self, pair: &str) -> Result<BookSnapshot> {
        self.client.get_depth_snapshot(pair).await
    }

    /// Cancel the pair's stream task; it exits at its next await point.
    fn unsubscribe(&self, pair: &str) {
        if let Some(stream) = self.streams.lock().remove(pair) {
            stream.cancel.cancel();
            info!(symbol = %pair, "depth stream unsubscribed");
        }
    }
}

/// Connect to the diff-depth stream for `symbol` and forward every event.
///
/// Returns when the stream ends or errors so the caller can reconnect.
pub async fn run_depth_stream(
    symbol: &str,
    client: &BinanceClient,
    tx: &mpsc::UnboundedSender<PendingUpdate>,
    resnapshot: bool,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@depth@100ms");
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    if resnapshot {
        let snapshot = client.get_depth_snapshot(symbol).await?;
        if tx.send(PendingUpdate::Snapshot(snapshot)).is_err() {
            return Ok(());
        }
    }

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_depth_update(symbol, &text) {
                Ok(delta) => {
                    if tx.send(PendingUpdate::Delta(delta)).is_err() {
                        warn!(symbol = %symbol, "update receiver dropped");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse depth message");
                }
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn to_changes(levels: Vec<(f64, f64)>) -> Vec<OfferChange> {
    levels
        .into_iter()
        .map(|(price, qty)| {
            if qty == 0.0 {
                OfferChange::remove(price)
            } else {
                OfferChange::add(price, qty)
            }
        })
        .collect()
}

fn parse_depth_update(symbol: &str, text: &str) -> Result<BookDelta> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let nonce = root["u"].as_i64().context("missing field u")?;
    let pair = root["s"].as_str().unwrap_or(symbol).to_uppercase();

    Ok(BookDelta {
        pair,
        nonce,
        buys: to_changes(parse_levels(&root["b"]).context("bad bids")?),
        sells: to_changes(parse_levels(&root["a"]).context("bad asks")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::orderbook::OfferOp;

    #[test]
    fn depth_event_becomes_delta() {
        let text = r#"{
            "e": "depthUpdate", "E": 123456789, "s": "BNBBTC", "U": 157, "u": 160,
            "b": [["0.0024", "10"], ["0.0023", "0.00000000"]],
            "a": [["0.0026", "100"]]
        }"#;
        let delta = parse_depth_update("bnbbtc", text).unwrap();
        assert_eq!(delta.pair, "BNBBTC");
        assert_eq!(delta.nonce, 160);
        assert_eq!(delta.buys.len(), 2);
        assert_eq!(delta.buys[0], OfferChange::add(0.0024, 10.0));
        assert_eq!(delta.buys[1].op, OfferOp::Remove);
        assert_eq!(delta.sells, vec![OfferChange::add(0.0026, 100.0)]);
    }

    #[test]
    fn pair_falls_back_to_subscribed_symbol() {
        let delta = parse_depth_update("ethusdt", r#"{"u": 5, "b": [], "a": []}"#).unwrap();
        assert_eq!(delta.pair, "ETHUSDT");
        assert!(delta.buys.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_cancels_the_stream_task() {
        let client = Arc::new(BinanceClient::new(String::new(), String::new()).unwrap());
        let (feed, _rx) = BinanceFeed::new(client);

        feed.subscribe("BTCUSDT").await.unwrap();
        feed.subscribe("BTCUSDT").await.unwrap();
        assert_eq!(feed.stream_count(), 1);

        feed.unsubscribe("BTCUSDT");
        feed.unsubscribe("ETHUSDT");
        assert_eq!(feed.stream_count(), 0);
        feed.shutdown().await;
    }

    #[test]
    fn malformed_event_is_rejected() {
        assert!(parse_depth_update("X", "not json").is_err());
        assert!(parse_depth_update("X", r#"{"b": [], "a": []}"#).is_err());
        assert!(parse_depth_update("X", r#"{"u": 1, "b": [["x", "1"]], "a": []}"#).is_err());
    }
}

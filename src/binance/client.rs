// =============================================================================
// Binance REST API Client: public market data and HMAC-SHA256 signed account
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between us and Binance.
// =============================================================================

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::market_data::candle_sync::CandleFetcher;
use crate::market_data::orderbook::{BookSnapshot, Offer};
use crate::market_data::Candle;
use crate::types::{BalanceInfo, CandleKey, TimeFrame};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Largest page the klines endpoint serves.
const KLINES_MAX_LIMIT: usize = 1000;

const DEPTH_SNAPSHOT_LIMIT: u32 = 1000;

/// Binance REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// The API key goes in a header and never in query params; the secret is
    /// used only for signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!("BinanceClient initialised (base_url=https://api.binance.com)");

        Ok(Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| anyhow!("invalid HMAC key"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Full query string for a signed request (appends timestamp, recvWindow
    /// and signature).
    fn signed_query(&self, params: &str) -> Result<String> {
        let ts = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    /// GET `url`, failing on a non-success status with the response body.
    async fn get_json(&self, url: &str, what: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {what} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {what} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "binance::get_account")]
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        let qs = self.signed_query("")?;
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        let body = self.get_json(&url, "/api/v3/account").await?;
        debug!("account info retrieved successfully");
        Ok(body)
    }

    /// Non-zero balances from the account endpoint.
    #[instrument(skip(self), name = "binance::get_balances")]
    pub async fn get_balances(&self) -> Result<Vec<BalanceInfo>> {
        let account = self.get_account().await?;
        parse_balances(&account)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/depth (public).
    #[instrument(skip(self), name = "binance::get_depth_snapshot")]
    pub async fn get_depth_snapshot(&self, symbol: &str) -> Result<BookSnapshot> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, symbol, DEPTH_SNAPSHOT_LIMIT
        );
        let body = self.get_json(&url, "/api/v3/depth").await?;
        let snapshot = parse_depth_snapshot(symbol, &body)?;
        debug!(
            symbol,
            nonce = snapshot.nonce,
            bids = snapshot.buys.len(),
            asks = snapshot.sells.len(),
            "depth snapshot fetched"
        );
        Ok(snapshot)
    }

    /// GET /api/v3/klines for open times in `[from_ms, to_ms)` (public).
    #[instrument(skip(self), name = "binance::get_klines_range")]
    pub async fn get_klines_range(
        &self,
        symbol: &str,
        interval: TimeFrame,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>> {
        if to_ms <= from_ms {
            return Ok(Vec::new());
        }
        // endTime is inclusive on Binance.
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url,
            symbol,
            interval.as_str(),
            from_ms,
            to_ms - 1,
            KLINES_MAX_LIMIT
        );
        let body = self.get_json(&url, "/api/v3/klines").await?;
        let mut candles = parse_klines(&body)?;
        candles.retain(|c| c.timestamp >= from_ms && c.timestamp < to_ms);

        debug!(symbol, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

#[async_trait]
impl CandleFetcher for BinanceClient {
    async fn fetch_candles(&self, key: &CandleKey, from_ms: i64, to_ms: i64) -> Result<Vec<Candle>> {
        self.get_klines_range(&key.pair, key.timeframe, from_ms, to_ms)
            .await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// `[["price", "qty"], ...]` levels.
pub(crate) fn parse_levels(val: &serde_json::Value) -> Result<Vec<(f64, f64)>> {
    val.as_array()
        .context("depth levels are not an array")?
        .iter()
        .map(|level| {
            let price = parse_str_f64(&level[0]).context("bad level price")?;
            let qty = parse_str_f64(&level[1]).context("bad level quantity")?;
            Ok((price, qty))
        })
        .collect()
}

/// Expected shape:
/// ```json
/// { "lastUpdateId": 1027024, "bids": [["4.00", "431.00"]], "asks": [["4.02", "12.00"]] }
/// ```
fn parse_depth_snapshot(symbol: &str, body: &serde_json::Value) -> Result<BookSnapshot> {
    let nonce = body["lastUpdateId"]
        .as_i64()
        .context("missing field lastUpdateId")?;
    let to_offers = |levels: Vec<(f64, f64)>| {
        levels
            .into_iter()
            .filter(|&(_, qty)| qty > 0.0)
            .map(|(price, qty)| Offer::new(price, qty))
            .collect()
    };
    Ok(BookSnapshot {
        pair: symbol.to_string(),
        nonce,
        buys: to_offers(parse_levels(&body["bids"])?),
        sells: to_offers(parse_levels(&body["asks"])?),
    })
}

/// Klines arrive as arrays:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let open_time = arr[0].as_i64().context("kline open time is not an integer")?;
        candles.push(Candle::new(
            open_time,
            parse_str_f64(&arr[1])?,
            parse_str_f64(&arr[2])?,
            parse_str_f64(&arr[3])?,
            parse_str_f64(&arr[4])?,
            parse_str_f64(&arr[5])?,
        ));
    }
    Ok(candles)
}

fn parse_balances(account: &serde_json::Value) -> Result<Vec<BalanceInfo>> {
    let raw = account["balances"]
        .as_array()
        .context("account response missing 'balances' array")?;

    let mut out = Vec::new();
    for b in raw {
        let asset = b["asset"].as_str().unwrap_or_default().to_string();
        let free = parse_str_f64(&b["free"]).unwrap_or(0.0);
        let locked = parse_str_f64(&b["locked"]).unwrap_or(0.0);
        // Only assets with a balance; absent ones are read as zero.
        if free > 0.0 || locked > 0.0 {
            out.push(BalanceInfo { asset, free, locked });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_matches_binance_reference() {
        let client = BinanceClient::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        )
        .unwrap();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
        assert!(client.has_credentials());
    }

    #[test]
    fn debug_redacts_keys() {
        let client = BinanceClient::new("key-123", "secret-456").unwrap();
        let shown = format!("{client:?}");
        assert!(!shown.contains("key-123"));
        assert!(!shown.contains("secret-456"));
    }

    #[test]
    fn depth_snapshot_parsed_and_empty_levels_dropped() {
        let body = json!({
            "lastUpdateId": 1027024,
            "bids": [["4.00000000", "431.00000000"], ["3.90", "0.0"]],
            "asks": [["4.00000200", "12.00000000"]]
        });
        let snap = parse_depth_snapshot("BNBBTC", &body).unwrap();
        assert_eq!(snap.pair, "BNBBTC");
        assert_eq!(snap.nonce, 1027024);
        assert_eq!(snap.buys, vec![Offer::new(4.0, 431.0)]);
        assert_eq!(snap.sells, vec![Offer::new(4.000002, 12.0)]);

        assert!(parse_depth_snapshot("BNBBTC", &json!({"bids": []})).is_err());
    }

    #[test]
    fn klines_parsed_to_candles() {
        let body = json!([
            [1499040000000i64, "0.01634790", "0.80000000", "0.01575800", "0.01577100",
             "148976.11427815", 1499644799999i64, "2434.19055334", 308, "1756.87", "28.46", "0"],
            [1499040060000i64, "1", "2"]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 1);
        let c = candles[0];
        assert_eq!(c.timestamp, 1499040000000);
        assert!((c.high - 0.8).abs() < 1e-12);
        assert!((c.median - (0.8 + 0.015758) / 2.0).abs() < 1e-12);
        assert!((c.volume - 148976.11427815).abs() < 1e-9);
    }

    #[test]
    fn balances_keep_only_non_zero_assets() {
        let account = json!({
            "balances": [
                {"asset": "BTC", "free": "0.5", "locked": "0.1"},
                {"asset": "LTC", "free": "0.0", "locked": "0.0"},
                {"asset": "USDT", "free": "100", "locked": "0"}
            ]
        });
        let balances = parse_balances(&account).unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].asset, "BTC");
        assert!((balances[0].locked - 0.1).abs() < 1e-12);
        assert!(parse_balances(&json!({})).is_err());
    }
}

// =============================================================================
// Balance Reconciliation: feed the exchange's account report into the ledger
// =============================================================================
//
// The exchange is authoritative for total and held amounts per coin. Each
// cycle fetches the account, logs any drift against the previous report, and
// applies the report as `ExchangeUpdate(free + locked, locked)` for every coin.
// Local fund attributions are never touched here.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::balances::BalanceLedger;
use crate::binance::client::BinanceClient;
use crate::types::BalanceInfo;

/// Source of the authoritative account report.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn balances(&self) -> Result<Vec<BalanceInfo>>;
}

#[async_trait]
impl AccountSource for BinanceClient {
    async fn balances(&self) -> Result<Vec<BalanceInfo>> {
        self.get_balances().await
    }
}

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    /// Coins whose exchange update was accepted by the ledger.
    pub coins_updated: usize,
    /// Whether any total moved against the previous report.
    pub balance_drift: bool,
    /// ISO-8601 timestamp of this reconciliation run.
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Run one reconciliation cycle against `exchange`'s account.
///
/// `tracked_coins` are created in the ledger up front so that a coin the
/// account does not report still reads as an explicit zero.
pub async fn reconcile_once(
    source: &dyn AccountSource,
    exchange: &str,
    tracked_coins: &[String],
    ledger: &Mutex<BalanceLedger>,
    last_report: &RwLock<Vec<BalanceInfo>>,
) -> Result<ReconcileResult> {
    let now = Utc::now();
    info!(exchange, timestamp = %now.to_rfc3339(), "reconciliation cycle started");

    let report = source
        .balances()
        .await
        .context("reconcile: failed to fetch account balances")?;

    let balance_drift = {
        let old = last_report.read();
        detect_balance_drift(&old, &report)
    };
    if balance_drift {
        warn!(exchange, "balance drift detected during reconciliation");
    } else {
        debug!(exchange, "balances refreshed, no significant drift");
    }

    let coins_updated = {
        let mut ledger = ledger.lock();
        for coin in tracked_coins {
            ledger.get_or_create(exchange, coin);
        }
        let accepted = ledger
            .apply_exchange_snapshot(exchange, &report, now)
            .context("reconcile: exchange report violates balance invariants")?;
        if let Err(e) = ledger.validate() {
            error!(exchange, error = %e, "ledger invalid after reconciliation, funds need rebalancing");
        }
        accepted
    };

    *last_report.write() = report;

    let result = ReconcileResult {
        coins_updated,
        balance_drift,
        timestamp: now.to_rfc3339(),
    };

    info!(
        exchange,
        coins_updated,
        balance_drift,
        "reconciliation cycle completed"
    );

    Ok(result)
}

/// Compare two balance reports and return `true` if any asset's total changed
/// by more than 0.01 %, appeared, or disappeared.
fn detect_balance_drift(old: &[BalanceInfo], new: &[BalanceInfo]) -> bool {
    if old.is_empty() {
        // First run, nothing to compare against.
        return false;
    }

    let old_map: HashMap<&str, f64> = old
        .iter()
        .map(|b| (b.asset.as_str(), b.free + b.locked))
        .collect();

    for nb in new {
        let total_new = nb.free + nb.locked;
        match old_map.get(nb.asset.as_str()) {
            Some(&total_old) if total_old > 0.0 => {
                let pct_change = ((total_new - total_old) / total_old).abs();
                if pct_change > 0.0001 {
                    debug!(
                        asset = %nb.asset,
                        old_total = total_old,
                        new_total = total_new,
                        pct_change = pct_change * 100.0,
                        "balance drift for asset"
                    );
                    return true;
                }
            }
            Some(_) => {
                if total_new > 0.0 {
                    return true;
                }
            }
            None => return true,
        }
    }

    let gone = old
        .iter()
        .find(|ob| (ob.free + ob.locked) > 0.0 && !new.iter().any(|nb| nb.asset == ob.asset));
    if let Some(ob) = gone {
        debug!(asset = %ob.asset, "asset disappeared from balances");
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balances::FundId;
    use crate::clock::system;

    fn info(asset: &str, free: f64, locked: f64) -> BalanceInfo {
        BalanceInfo {
            asset: asset.into(),
            free,
            locked,
        }
    }

    struct StubAccount {
        reports: Mutex<Vec<Result<Vec<BalanceInfo>, String>>>,
    }

    impl StubAccount {
        fn new(reports: Vec<Result<Vec<BalanceInfo>, String>>) -> Self {
            Self {
                reports: Mutex::new(reports),
            }
        }
    }

    #[async_trait]
    impl AccountSource for StubAccount {
        async fn balances(&self) -> Result<Vec<BalanceInfo>> {
            self.reports.lock().remove(0).map_err(anyhow::Error::msg)
        }
    }

    #[test]
    fn drift_detection() {
        let base = vec![info("BTC", 1.0, 0.0), info("USDT", 100.0, 0.0)];
        assert!(!detect_balance_drift(&[], &base));
        assert!(!detect_balance_drift(&base, &base));
        assert!(detect_balance_drift(
            &base,
            &[info("BTC", 0.5, 0.0), info("USDT", 100.0, 0.0)]
        ));
        // Moving free into locked keeps the total: no drift.
        assert!(!detect_balance_drift(
            &base,
            &[info("BTC", 0.4, 0.6), info("USDT", 100.0, 0.0)]
        ));
        assert!(detect_balance_drift(&base, &[info("USDT", 100.0, 0.0)]));
        assert!(detect_balance_drift(&base, &[info("ETH", 1.0, 0.0)]));
    }

    #[tokio::test]
    async fn cycle_updates_ledger_and_keeps_tracked_coins() {
        let source = StubAccount::new(vec![
            Ok(vec![info("BTC", 0.75, 0.25), info("USDT", 500.0, 0.0)]),
            Ok(vec![info("USDT", 400.0, 100.0)]),
            Err("timeout".into()),
        ]);
        let ledger = Mutex::new(BalanceLedger::new(system()));
        let last = RwLock::new(Vec::new());
        let tracked = vec!["BTC".to_string(), "ETH".to_string()];

        let first = reconcile_once(&source, "binance", &tracked, &ledger, &last)
            .await
            .unwrap();
        assert!(!first.balance_drift);
        // BTC and USDT from the report plus ETH set to zero.
        assert_eq!(first.coins_updated, 3);
        {
            let ledger = ledger.lock();
            let btc = ledger.get("binance", "BTC").unwrap();
            assert!((btc.exch_total() - 1.0).abs() < 1e-12);
            assert!((btc.held(&FundId::main()) - 0.25).abs() < 1e-12);
            assert_eq!(ledger.get("binance", "ETH").unwrap().exch_total(), 0.0);
        }

        let second = reconcile_once(&source, "binance", &tracked, &ledger, &last)
            .await
            .unwrap();
        assert!(second.balance_drift);
        assert_eq!(ledger.lock().get("binance", "BTC").unwrap().exch_total(), 0.0);
        assert!((ledger.lock().get("binance", "USDT").unwrap().exch_held() - 100.0).abs() < 1e-12);

        assert!(reconcile_once(&source, "binance", &tracked, &ledger, &last)
            .await
            .is_err());
        assert_eq!(last.read().len(), 1);
    }
}

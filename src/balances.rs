// =============================================================================
// Balance Ledger: fund-partitioned accounting per (exchange, coin)
// =============================================================================
//
// The exchange reports one total/held pair per coin. Locally that balance is
// split into named funds so several strategies can share one account without
// spending each other's allocation:
//
//   - Every fund except Main has an explicitly assigned total and holds only
//     what its own holds add up to.
//   - Main is whatever is left: its total is the exchange total minus all
//     other funds, and its held amount absorbs any exchange-held amount not
//     attributed to another fund.
//
// Not internally synchronised. Owners wrap the ledger in a mutex at the
// boundary (see `AppState`).
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::BalanceError;
use crate::types::BalanceInfo;

/// Negative magnitudes down to `-BALANCE_EPSILON` are treated as rounding
/// noise and clamped to zero.
pub const BALANCE_EPSILON: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Fund identity and holds
// ---------------------------------------------------------------------------

/// Name of a virtual sub-account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FundId(String);

impl FundId {
    pub const MAIN: &'static str = "Main";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FundId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for FundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An amount reserved against a fund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundHold {
    pub id: Uuid,
    pub order_id: Option<String>,
    pub amount: f64,
    /// Not yet reflected in the exchange's own held figure.
    pub is_local: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundHoldContainer {
    holds: Vec<FundHold>,
}

impl FundHoldContainer {
    pub const fn new() -> Self {
        Self { holds: Vec::new() }
    }

    pub fn add(&mut self, amount: f64, order_id: Option<String>, is_local: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.holds.push(FundHold {
            id,
            order_id,
            amount,
            is_local,
        });
        id
    }

    pub fn remove(&mut self, id: Uuid) -> Option<FundHold> {
        let idx = self.holds.iter().position(|h| h.id == id)?;
        Some(self.holds.remove(idx))
    }

    pub fn get(&self, id: Uuid) -> Option<&FundHold> {
        self.holds.iter().find(|h| h.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut FundHold> {
        self.holds.iter_mut().find(|h| h.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FundHold> {
        self.holds.iter()
    }

    pub fn len(&self) -> usize {
        self.holds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.holds.iter().map(|h| h.amount).sum()
    }

    pub fn local_total(&self) -> f64 {
        self.holds.iter().filter(|h| h.is_local).map(|h| h.amount).sum()
    }

    pub fn held_on_exch(&self) -> f64 {
        self.holds.iter().filter(|h| !h.is_local).map(|h| h.amount).sum()
    }
}

static NO_HOLDS: FundHoldContainer = FundHoldContainer::new();

#[derive(Debug, Clone, Default)]
struct FundBalance {
    total: f64,
    holds: FundHoldContainer,
}

/// Read view of one fund.
#[derive(Debug, Clone, Copy)]
pub struct BalanceView<'a> {
    pub total: f64,
    pub held: f64,
    pub available: f64,
    pub holds: &'a FundHoldContainer,
}

// ---------------------------------------------------------------------------
// Balances: one (exchange, coin)
// ---------------------------------------------------------------------------

pub struct Balances {
    exchange: String,
    coin: String,
    exch_total: f64,
    exch_held: f64,
    last_update: Option<DateTime<Utc>>,
    funds: BTreeMap<FundId, FundBalance>,
    clock: SharedClock,
}

impl Balances {
    pub fn new(exchange: impl Into<String>, coin: impl Into<String>, clock: SharedClock) -> Self {
        let mut funds = BTreeMap::new();
        funds.insert(FundId::main(), FundBalance::default());
        Self {
            exchange: exchange.into(),
            coin: coin.into(),
            exch_total: 0.0,
            exch_held: 0.0,
            last_update: None,
            funds,
            clock,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn coin(&self) -> &str {
        &self.coin
    }

    pub fn exch_total(&self) -> f64 {
        self.exch_total
    }

    pub fn exch_held(&self) -> f64 {
        self.exch_held
    }

    pub fn exch_available(&self) -> f64 {
        self.exch_total - self.exch_held
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Accept the exchange-reported balance.
    ///
    /// Returns `Ok(false)` when `as_of` predates the last accepted update
    /// (allowed through under a simulated clock). Negative values within
    /// [`BALANCE_EPSILON`] are clamped to zero; anything beyond that, or
    /// `held > total` by any amount, is an error and leaves state unchanged.
    pub fn exchange_update(
        &mut self,
        total: f64,
        held: f64,
        as_of: DateTime<Utc>,
    ) -> Result<bool, BalanceError> {
        if let Some(last) = self.last_update {
            if as_of < last && !self.clock.is_simulated() {
                debug!(
                    exchange = %self.exchange,
                    coin = %self.coin,
                    as_of = %as_of,
                    last = %last,
                    "stale balance update ignored"
                );
                return Ok(false);
            }
        }

        let (total, held) = check_exchange_amounts(total, held)?;

        self.exch_total = total;
        self.exch_held = held;
        self.last_update = Some(as_of);
        debug!(exchange = %self.exchange, coin = %self.coin, total, held, "exchange balance updated");
        Ok(true)
    }

    /// Set a fund's total directly. The result may be negative; that surfaces
    /// through [`Balances::validate`] so callers can rebalance.
    pub fn assign_fund_balance(&mut self, fund: &FundId, total: f64) {
        if fund.is_main() {
            warn!(coin = %self.coin, "Main fund total is derived, assignment ignored");
            return;
        }
        self.funds.entry(fund.clone()).or_default().total = total;
        info!(coin = %self.coin, fund = %fund, total, "fund balance assigned");
    }

    /// Adjust a fund's total by `delta`. Returns false for unknown funds and
    /// for Main, whose total is derived.
    pub fn change_fund_balance(&mut self, fund: &FundId, delta: f64) -> bool {
        if fund.is_main() {
            return false;
        }
        match self.funds.get_mut(fund) {
            Some(f) => {
                f.total += delta;
                true
            }
            None => false,
        }
    }

    /// Sum of every non-Main fund's total.
    fn allocated(&self) -> f64 {
        self.funds
            .iter()
            .filter(|(id, _)| !id.is_main())
            .map(|(_, f)| f.total)
            .sum()
    }

    pub fn total(&self, fund: &FundId) -> f64 {
        if fund.is_main() {
            (self.exch_total - self.allocated()).max(0.0)
        } else {
            self.funds.get(fund).map_or(0.0, |f| f.total)
        }
    }

    pub fn held(&self, fund: &FundId) -> f64 {
        let holds = self.funds.get(fund).map_or(&NO_HOLDS, |f| &f.holds);
        if !fund.is_main() {
            return holds.total();
        }
        let attributed: f64 = self
            .funds
            .iter()
            .filter(|(id, _)| !id.is_main())
            .map(|(_, f)| f.holds.held_on_exch())
            .sum();
        (holds.local_total() + (self.exch_held - attributed)).max(0.0)
    }

    pub fn available(&self, fund: &FundId) -> f64 {
        self.total(fund) - self.held(fund)
    }

    pub fn fund(&self, fund: &FundId) -> BalanceView<'_> {
        let total = self.total(fund);
        let held = self.held(fund);
        BalanceView {
            total,
            held,
            available: total - held,
            holds: self.funds.get(fund).map_or(&NO_HOLDS, |f| &f.holds),
        }
    }

    pub fn fund_ids(&self) -> impl Iterator<Item = &FundId> {
        self.funds.keys()
    }

    pub fn has_fund(&self, fund: &FundId) -> bool {
        self.funds.contains_key(fund)
    }

    // -------------------------------------------------------------------------
    // Holds
    // -------------------------------------------------------------------------

    /// Reserve `amount` against `fund`. Fails if the fund cannot cover it.
    pub fn add_hold(
        &mut self,
        fund: &FundId,
        amount: f64,
        order_id: Option<String>,
        is_local: bool,
    ) -> Result<Uuid, BalanceError> {
        let available = self.available(fund);
        if amount > available + BALANCE_EPSILON {
            return Err(BalanceError::InsufficientAvailable {
                fund: fund.to_string(),
                available,
                requested: amount,
            });
        }
        let id = self
            .funds
            .entry(fund.clone())
            .or_default()
            .holds
            .add(amount, order_id, is_local);
        debug!(coin = %self.coin, fund = %fund, amount, is_local, hold = %id, "hold added");
        Ok(id)
    }

    pub fn release_hold(&mut self, fund: &FundId, id: Uuid) -> Result<FundHold, BalanceError> {
        let f = self
            .funds
            .get_mut(fund)
            .ok_or_else(|| BalanceError::UnknownFund(fund.to_string()))?;
        f.holds.remove(id).ok_or(BalanceError::UnknownHold(id))
    }

    /// Mark a local hold as now reflected in the exchange's held figure.
    pub fn acknowledge_hold(&mut self, fund: &FundId, id: Uuid) -> Result<(), BalanceError> {
        let f = self
            .funds
            .get_mut(fund)
            .ok_or_else(|| BalanceError::UnknownFund(fund.to_string()))?;
        let hold = f.holds.get_mut(id).ok_or(BalanceError::UnknownHold(id))?;
        hold.is_local = false;
        Ok(())
    }

    pub fn holds_for_order(&self, order_id: &str) -> Vec<(FundId, FundHold)> {
        self.funds
            .iter()
            .flat_map(|(fund, f)| {
                f.holds
                    .iter()
                    .filter(|h| h.order_id.as_deref() == Some(order_id))
                    .map(move |h| (fund.clone(), h.clone()))
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    pub fn validate(&self) -> Result<(), BalanceError> {
        if self.exch_total < 0.0 {
            return Err(BalanceError::NegativeTotal(self.exch_total));
        }
        if self.exch_held < 0.0 {
            return Err(BalanceError::NegativeHeld(self.exch_held));
        }
        if self.exch_held > self.exch_total {
            return Err(BalanceError::HeldExceedsTotal {
                held: self.exch_held,
                total: self.exch_total,
            });
        }
        for fund in self.funds.keys() {
            let total = self.total(fund);
            if total < 0.0 {
                return Err(BalanceError::FundNegativeTotal {
                    fund: fund.to_string(),
                    total,
                });
            }
            let held = self.held(fund);
            if held < 0.0 {
                return Err(BalanceError::FundNegativeHeld {
                    fund: fund.to_string(),
                    held,
                });
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> BalanceSummary {
        BalanceSummary {
            exchange: self.exchange.clone(),
            coin: self.coin.clone(),
            exch_total: self.exch_total,
            exch_held: self.exch_held,
            last_update: self.last_update,
            funds: self
                .funds
                .keys()
                .map(|id| {
                    let view = self.fund(id);
                    FundSummary {
                        fund: id.to_string(),
                        total: view.total,
                        held: view.held,
                        available: view.available,
                        holds: view.holds.len(),
                    }
                })
                .collect(),
        }
    }
}

/// Validate an exchange-reported pair and return it with noise clamped.
fn check_exchange_amounts(total: f64, held: f64) -> Result<(f64, f64), BalanceError> {
    let total = clamp_noise(total).ok_or(BalanceError::NegativeTotal(total))?;
    let held = clamp_noise(held).ok_or(BalanceError::NegativeHeld(held))?;
    if held > total {
        return Err(BalanceError::HeldExceedsTotal { held, total });
    }
    Ok((total, held))
}

/// Clamp rounding noise below zero; `None` if the value is truly negative.
fn clamp_noise(v: f64) -> Option<f64> {
    if v >= 0.0 {
        Some(v)
    } else if v >= -BALANCE_EPSILON {
        Some(0.0)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FundSummary {
    pub fund: String,
    pub total: f64,
    pub held: f64,
    pub available: f64,
    pub holds: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub exchange: String,
    pub coin: String,
    pub exch_total: f64,
    pub exch_held: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub funds: Vec<FundSummary>,
}

// ---------------------------------------------------------------------------
// BalanceLedger: all (exchange, coin) pairs
// ---------------------------------------------------------------------------

pub struct BalanceLedger {
    balances: BTreeMap<(String, String), Balances>,
    clock: SharedClock,
}

impl BalanceLedger {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            balances: BTreeMap::new(),
            clock,
        }
    }

    pub fn get(&self, exchange: &str, coin: &str) -> Option<&Balances> {
        self.balances.get(&(exchange.to_string(), coin.to_string()))
    }

    pub fn get_or_create(&mut self, exchange: &str, coin: &str) -> &mut Balances {
        let clock = self.clock.clone();
        self.balances
            .entry((exchange.to_string(), coin.to_string()))
            .or_insert_with(|| Balances::new(exchange, coin, clock))
    }

    /// Feed an exchange account report into every coin it mentions.
    ///
    /// Coins tracked for `exchange` but absent from the report are set to
    /// zero. Returns the number of coins whose update was accepted. The
    /// report is checked as a whole first; if any entry is invalid nothing
    /// is applied.
    pub fn apply_exchange_snapshot(
        &mut self,
        exchange: &str,
        report: &[BalanceInfo],
        as_of: DateTime<Utc>,
    ) -> Result<usize, BalanceError> {
        for info in report {
            check_exchange_amounts(info.free + info.locked, info.locked).map_err(|e| {
                warn!(exchange, coin = %info.asset, error = %e, "account report rejected");
                e
            })?;
        }

        let mut accepted = 0;
        for info in report {
            let total = info.free + info.locked;
            if self
                .get_or_create(exchange, &info.asset)
                .exchange_update(total, info.locked, as_of)?
            {
                accepted += 1;
            }
        }

        let missing: Vec<String> = self
            .balances
            .keys()
            .filter(|(ex, coin)| ex == exchange && !report.iter().any(|b| &b.asset == coin))
            .map(|(_, coin)| coin.clone())
            .collect();
        for coin in missing {
            if self.get_or_create(exchange, &coin).exchange_update(0.0, 0.0, as_of)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    pub fn validate(&self) -> Result<(), BalanceError> {
        self.balances.values().try_for_each(Balances::validate)
    }

    pub fn summary(&self) -> Vec<BalanceSummary> {
        self.balances.values().map(Balances::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system, SimulatedClock};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn balances() -> Balances {
        Balances::new("binance", "USDT", system())
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn main_is_what_is_left() {
        let mut b = balances();
        b.exchange_update(1_000.0, 0.0, at(0)).unwrap();
        b.assign_fund_balance(&"grid".into(), 300.0);
        b.assign_fund_balance(&"dca".into(), 200.0);

        assert!(close(b.total(&FundId::main()), 500.0));
        assert!(close(b.total(&"grid".into()), 300.0));

        b.assign_fund_balance(&"grid".into(), 900.0);
        assert_eq!(b.total(&FundId::main()), 0.0);
        assert!(b.validate().is_ok());
    }

    #[test]
    fn main_absorbs_unattributed_exchange_holds() {
        let mut b = balances();
        let grid = FundId::new("grid");
        b.exchange_update(1_000.0, 0.0, at(0)).unwrap();
        b.assign_fund_balance(&grid, 400.0);

        let hold = b.add_hold(&grid, 150.0, Some("o-1".into()), true).unwrap();
        assert!(close(b.held(&grid), 150.0));
        assert_eq!(b.held(&FundId::main()), 0.0);

        // The exchange now reports 150 held plus 100 from a manual order.
        b.acknowledge_hold(&grid, hold).unwrap();
        b.exchange_update(1_000.0, 250.0, at(1)).unwrap();
        assert!(close(b.held(&grid), 150.0));
        assert!(close(b.held(&FundId::main()), 100.0));

        let main = b.fund(&FundId::main());
        assert!(close(main.total, 600.0));
        assert!(close(main.available, 500.0));

        b.release_hold(&grid, hold).unwrap();
        assert_eq!(b.held(&grid), 0.0);
        assert!(close(b.held(&FundId::main()), 250.0));
    }

    #[test]
    fn local_main_holds_count_until_exchange_catches_up() {
        let mut b = balances();
        b.exchange_update(100.0, 0.0, at(0)).unwrap();
        let id = b.add_hold(&FundId::main(), 30.0, None, true).unwrap();
        assert!(close(b.held(&FundId::main()), 30.0));
        assert!(close(b.available(&FundId::main()), 70.0));
        assert_eq!(b.fund(&FundId::main()).holds.len(), 1);
        assert!(b.fund(&FundId::main()).holds.get(id).unwrap().is_local);
    }

    #[test]
    fn hold_larger_than_available_is_rejected() {
        let mut b = balances();
        let grid = FundId::new("grid");
        b.exchange_update(100.0, 0.0, at(0)).unwrap();
        b.assign_fund_balance(&grid, 40.0);
        b.add_hold(&grid, 30.0, None, true).unwrap();

        let err = b.add_hold(&grid, 20.0, None, true).unwrap_err();
        assert!(matches!(err, BalanceError::InsufficientAvailable { .. }));
        assert!(b.add_hold(&"unknown".into(), 1.0, None, true).is_err());
    }

    #[test]
    fn stale_update_ignored_on_live_clock() {
        let mut b = balances();
        assert!(b.exchange_update(10.0, 1.0, at(10)).unwrap());
        assert!(!b.exchange_update(99.0, 1.0, at(5)).unwrap());
        assert_eq!(b.exch_total(), 10.0);
        assert!(b.exchange_update(12.0, 1.0, at(10)).unwrap());
        assert_eq!(b.exch_total(), 12.0);
    }

    #[test]
    fn simulated_clock_accepts_earlier_updates() {
        let clock = Arc::new(SimulatedClock::new(0));
        let mut b = Balances::new("binance", "BTC", clock);
        b.exchange_update(10.0, 1.0, at(10)).unwrap();
        assert!(b.exchange_update(5.0, 0.0, at(10) - Duration::hours(1)).unwrap());
        assert_eq!(b.exch_total(), 5.0);
    }

    #[test]
    fn truncation_noise_is_clamped_but_ordering_is_strict() {
        let mut b = balances();
        b.exchange_update(-1e-10, -1e-12, at(0)).unwrap();
        assert_eq!(b.exch_total(), 0.0);
        assert_eq!(b.exch_held(), 0.0);

        assert_eq!(
            b.exchange_update(-0.5, 0.0, at(1)).unwrap_err(),
            BalanceError::NegativeTotal(-0.5)
        );
        assert_eq!(
            b.exchange_update(1.0, -0.1, at(1)).unwrap_err(),
            BalanceError::NegativeHeld(-0.1)
        );
        let err = b.exchange_update(1.0, 1.0 + 1e-12, at(1)).unwrap_err();
        assert!(matches!(err, BalanceError::NegativeTotal(_)));
        assert_eq!(b.exch_total(), 0.0);
    }

    #[test]
    fn change_fund_balance_ignores_unknown_and_main() {
        let mut b = balances();
        let grid = FundId::new("grid");
        assert!(!b.change_fund_balance(&grid, 5.0));
        assert!(!b.has_fund(&grid));

        b.assign_fund_balance(&grid, 10.0);
        assert!(b.change_fund_balance(&grid, -4.0));
        assert!(close(b.total(&grid), 6.0));

        assert!(!b.change_fund_balance(&FundId::main(), 1.0));
        b.assign_fund_balance(&FundId::main(), 1.0);
        assert_eq!(b.total(&FundId::main()), 0.0);
    }

    #[test]
    fn validate_flags_negative_fund_totals() {
        let mut b = balances();
        b.exchange_update(10.0, 0.0, at(0)).unwrap();
        b.assign_fund_balance(&"grid".into(), -3.0);
        assert_eq!(
            b.validate().unwrap_err(),
            BalanceError::FundNegativeTotal {
                fund: "grid".into(),
                total: -3.0
            }
        );
    }

    #[test]
    fn holds_found_by_order_id() {
        let mut b = balances();
        b.exchange_update(100.0, 0.0, at(0)).unwrap();
        b.assign_fund_balance(&"grid".into(), 50.0);
        b.add_hold(&"grid".into(), 10.0, Some("abc".into()), true).unwrap();
        b.add_hold(&FundId::main(), 5.0, Some("abc".into()), true).unwrap();
        b.add_hold(&FundId::main(), 5.0, Some("xyz".into()), true).unwrap();
        assert_eq!(b.holds_for_order("abc").len(), 2);
        assert!(b.holds_for_order("nope").is_empty());
    }

    /// Deterministic pseudo-random stream for the invariant walk.
    fn lcg(seed: &mut u64) -> f64 {
        *seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (*seed >> 11) as f64 / (1u64 << 53) as f64
    }

    #[test]
    fn invariants_hold_across_call_sequences() {
        let mut b = balances();
        let funds = [FundId::new("a"), FundId::new("b"), FundId::new("c")];
        let mut seed = 42u64;
        b.exchange_update(1_000.0, 100.0, at(0)).unwrap();

        for step in 1..500 {
            let allocated: f64 = funds.iter().map(|f| b.total(f)).sum();
            let free = b.exch_total() - b.exch_held() - allocated;
            let fund = &funds[step % funds.len()];

            match step % 3 {
                0 => {
                    let total = allocated + lcg(&mut seed) * 2_000.0;
                    let held = lcg(&mut seed) * (total - allocated);
                    b.exchange_update(total, held, at(step as i64)).unwrap();
                }
                1 => {
                    let current = b.total(fund);
                    b.assign_fund_balance(fund, lcg(&mut seed) * (current + free));
                }
                _ => {
                    let current = b.total(fund);
                    let delta = (lcg(&mut seed) * 2.0 - 1.0) * current.min(free);
                    b.change_fund_balance(fund, delta);
                }
            }

            let others: f64 = funds.iter().map(|f| b.total(f)).sum();
            assert!(close(
                b.total(&FundId::main()),
                (b.exch_total() - others).max(0.0)
            ));
            for f in funds.iter().chain(std::iter::once(&FundId::main())) {
                let held = b.held(f);
                assert!(held >= 0.0, "step {step}: held {held} < 0 for {f}");
                assert!(
                    held <= b.total(f) + 1e-9,
                    "step {step}: held {held} > total {} for {f}",
                    b.total(f)
                );
            }
            b.validate().unwrap();
        }
    }

    #[test]
    fn ledger_applies_account_snapshot() {
        let mut ledger = BalanceLedger::new(system());
        let report = vec![
            BalanceInfo {
                asset: "BTC".into(),
                free: 0.5,
                locked: 0.25,
            },
            BalanceInfo {
                asset: "USDT".into(),
                free: 1_000.0,
                locked: 0.0,
            },
        ];
        assert_eq!(ledger.apply_exchange_snapshot("binance", &report, at(0)).unwrap(), 2);

        let btc = ledger.get("binance", "BTC").unwrap();
        assert!(close(btc.exch_total(), 0.75));
        assert!(close(btc.exch_held(), 0.25));
        assert!(close(btc.held(&FundId::main()), 0.25));

        // BTC disappears from the next report: it is now zero.
        assert_eq!(
            ledger
                .apply_exchange_snapshot("binance", &report[1..], at(1))
                .unwrap(),
            2
        );
        assert_eq!(ledger.get("binance", "BTC").unwrap().exch_total(), 0.0);
        assert!(ledger.validate().is_ok());
        assert_eq!(ledger.summary().len(), 2);
    }

    #[test]
    fn invalid_report_leaves_ledger_untouched() {
        let mut ledger = BalanceLedger::new(system());
        let good = vec![BalanceInfo {
            asset: "BTC".into(),
            free: 1.0,
            locked: 0.0,
        }];
        ledger.apply_exchange_snapshot("binance", &good, at(0)).unwrap();

        let bad = vec![
            BalanceInfo {
                asset: "BTC".into(),
                free: 2.0,
                locked: 0.0,
            },
            BalanceInfo {
                asset: "USDT".into(),
                free: -5.0,
                locked: 1.0,
            },
        ];
        let err = ledger.apply_exchange_snapshot("binance", &bad, at(1)).unwrap_err();
        assert!(matches!(err, BalanceError::NegativeTotal(_)));

        let btc = ledger.get("binance", "BTC").unwrap();
        assert!(close(btc.exch_total(), 1.0));
        assert_eq!(btc.last_update(), Some(at(0)));
        assert!(ledger.get("binance", "USDT").is_none());
    }
}

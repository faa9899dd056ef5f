// =============================================================================
// Order Book: price-ordered offer lists and feed update messages
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub price: f64,
    pub amount: f64,
}

impl Offer {
    pub fn new(price: f64, amount: f64) -> Self {
        Self { price, amount }
    }
}

/// How a delta changes one price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferOp {
    /// Insert the level, or overwrite it if present.
    Add,
    /// Overwrite the level only if it already exists.
    Update,
    /// Delete the level if present.
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OfferChange {
    pub op: OfferOp,
    pub price: f64,
    pub amount: f64,
}

impl OfferChange {
    pub fn add(price: f64, amount: f64) -> Self {
        Self { op: OfferOp::Add, price, amount }
    }

    pub fn update(price: f64, amount: f64) -> Self {
        Self { op: OfferOp::Update, price, amount }
    }

    pub fn remove(price: f64) -> Self {
        Self { op: OfferOp::Remove, price, amount: 0.0 }
    }
}

/// Full book state as of `nonce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: String,
    pub nonce: i64,
    pub buys: Vec<Offer>,
    pub sells: Vec<Offer>,
}

/// Incremental change moving the book to `nonce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub pair: String,
    pub nonce: i64,
    pub buys: Vec<OfferChange>,
    pub sells: Vec<OfferChange>,
}

/// A feed message waiting to be reconciled into the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingUpdate {
    Snapshot(BookSnapshot),
    Delta(BookDelta),
}

impl PendingUpdate {
    pub fn nonce(&self) -> i64 {
        match self {
            Self::Snapshot(s) => s.nonce,
            Self::Delta(d) => d.nonce,
        }
    }

    pub fn pair(&self) -> &str {
        match self {
            Self::Snapshot(s) => &s.pair,
            Self::Delta(d) => &d.pair,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::Snapshot(_))
    }
}

/// Local order book for one pair.
///
/// `buys` are kept descending by price and `sells` ascending, one entry per
/// price level, so index 0 is always the best price on each side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub pair: String,
    pub nonce: i64,
    pub buys: Vec<Offer>,
    pub sells: Vec<Offer>,
}

impl OrderBook {
    pub fn empty(pair: impl Into<String>) -> Self {
        Self {
            pair: pair.into(),
            nonce: 0,
            buys: Vec::new(),
            sells: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buys.is_empty() && self.sells.is_empty()
    }

    pub fn offers(&self, side: Side) -> &[Offer] {
        match side {
            Side::Buy => &self.buys,
            Side::Sell => &self.sells,
        }
    }

    /// Replace both sides with the snapshot's offers, sorted best first.
    pub fn reset_from(&mut self, snapshot: &BookSnapshot) {
        self.buys = sorted_offers(Side::Buy, &snapshot.buys);
        self.sells = sorted_offers(Side::Sell, &snapshot.sells);
        self.nonce = snapshot.nonce;
    }

    /// Merge the delta's changes into both sides. The caller owns nonce checks.
    pub fn apply_delta(&mut self, delta: &BookDelta) {
        merge_offers(Side::Buy, &mut self.buys, &delta.buys);
        merge_offers(Side::Sell, &mut self.sells, &delta.sells);
        self.nonce = delta.nonce;
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.buys.first().map(|o| o.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.sells.first().map(|o| o.price)
    }

    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    /// Spread in basis points of the mid price.
    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid()?;
        if mid <= 0.0 {
            return None;
        }
        Some((self.best_ask()? - self.best_bid()?) / mid * 10_000.0)
    }

    /// Volume imbalance over the top `depth` levels, in [-1, +1].
    /// Positive means more resting size on the bid side.
    pub fn imbalance(&self, depth: usize) -> f64 {
        let bid_depth: f64 = self.buys.iter().take(depth).map(|o| o.amount).sum();
        let ask_depth: f64 = self.sells.iter().take(depth).map(|o| o.amount).sum();
        let total = bid_depth + ask_depth;
        if total > 0.0 {
            (bid_depth - ask_depth) / total
        } else {
            0.0
        }
    }
}

/// Sort snapshot offers best-first, keeping the last entry for a repeated price.
fn sorted_offers(side: Side, offers: &[Offer]) -> Vec<Offer> {
    let mut out: Vec<Offer> = Vec::with_capacity(offers.len());
    for offer in offers {
        match out.binary_search_by(|o| side.order(o.price, offer.price)) {
            Ok(idx) => out[idx] = *offer,
            Err(idx) => out.insert(idx, *offer),
        }
    }
    out
}

/// Merge `changes` into a side's sorted offer list using binary search on price.
pub fn merge_offers(side: Side, offers: &mut Vec<Offer>, changes: &[OfferChange]) {
    for change in changes {
        let found = offers.binary_search_by(|o| side.order(o.price, change.price));
        match (change.op, found) {
            (OfferOp::Add, Ok(idx)) | (OfferOp::Update, Ok(idx)) => {
                offers[idx].amount = change.amount;
            }
            (OfferOp::Add, Err(idx)) => {
                offers.insert(idx, Offer::new(change.price, change.amount));
            }
            (OfferOp::Update, Err(_)) => {}
            (OfferOp::Remove, Ok(idx)) => {
                offers.remove(idx);
            }
            (OfferOp::Remove, Err(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offers(levels: &[(f64, f64)]) -> Vec<Offer> {
        levels.iter().map(|&(p, a)| Offer::new(p, a)).collect()
    }

    fn descending() -> Vec<Offer> {
        offers(&[(10.0, 1.0), (9.0, 2.0), (8.0, 3.0)])
    }

    #[test]
    fn update_overwrites_existing_level() {
        let mut book = descending();
        merge_offers(Side::Buy, &mut book, &[OfferChange::update(9.0, 5.0)]);
        assert_eq!(book, offers(&[(10.0, 1.0), (9.0, 5.0), (8.0, 3.0)]));
    }

    #[test]
    fn update_for_missing_level_is_ignored() {
        let mut book = descending();
        merge_offers(Side::Buy, &mut book, &[OfferChange::update(8.5, 5.0)]);
        assert_eq!(book, descending());
    }

    #[test]
    fn remove_deletes_level() {
        let mut book = descending();
        merge_offers(Side::Buy, &mut book, &[OfferChange::remove(9.0)]);
        assert_eq!(book, offers(&[(10.0, 1.0), (8.0, 3.0)]));

        merge_offers(Side::Buy, &mut book, &[OfferChange::remove(42.0)]);
        assert_eq!(book, offers(&[(10.0, 1.0), (8.0, 3.0)]));
    }

    #[test]
    fn add_inserts_in_order_or_overwrites() {
        let mut book = descending();
        merge_offers(Side::Buy, &mut book, &[OfferChange::add(7.0, 1.0)]);
        assert_eq!(
            book,
            offers(&[(10.0, 1.0), (9.0, 2.0), (8.0, 3.0), (7.0, 1.0)])
        );

        merge_offers(Side::Buy, &mut book, &[OfferChange::add(9.5, 4.0)]);
        assert_eq!(book[1], Offer::new(9.5, 4.0));

        merge_offers(Side::Buy, &mut book, &[OfferChange::add(10.0, 6.0)]);
        assert_eq!(book[0], Offer::new(10.0, 6.0));
        assert_eq!(book.len(), 5);
    }

    #[test]
    fn sell_side_stays_ascending() {
        let mut asks = offers(&[(100.0, 1.0), (101.0, 2.0)]);
        merge_offers(
            Side::Sell,
            &mut asks,
            &[OfferChange::add(99.0, 9.0), OfferChange::add(100.5, 3.0)],
        );
        let prices: Vec<f64> = asks.iter().map(|o| o.price).collect();
        assert_eq!(prices, vec![99.0, 100.0, 100.5, 101.0]);
    }

    #[test]
    fn reset_from_snapshot_sorts_each_side() {
        let snap = BookSnapshot {
            pair: "BTCUSDT".into(),
            nonce: 7,
            buys: offers(&[(9.0, 1.0), (10.0, 1.0), (8.0, 1.0)]),
            sells: offers(&[(12.0, 1.0), (11.0, 1.0), (11.0, 4.0)]),
        };
        let mut book = OrderBook::empty("BTCUSDT");
        book.reset_from(&snap);

        assert_eq!(book.nonce, 7);
        assert_eq!(book.best_bid(), Some(10.0));
        assert_eq!(book.best_ask(), Some(11.0));
        assert_eq!(book.sells, offers(&[(11.0, 4.0), (12.0, 1.0)]));
    }

    #[test]
    fn metrics_from_top_of_book() {
        let book = OrderBook {
            pair: "ETHUSDT".into(),
            nonce: 1,
            buys: offers(&[(99.0, 3.0)]),
            sells: offers(&[(101.0, 1.0)]),
        };
        assert_eq!(book.mid(), Some(100.0));
        assert!((book.spread_bps().unwrap() - 200.0).abs() < 1e-9);
        assert!((book.imbalance(5) - 0.5).abs() < 1e-9);
        assert_eq!(OrderBook::empty("X").spread_bps(), None);
        assert_eq!(OrderBook::empty("X").imbalance(5), 0.0);
    }
}

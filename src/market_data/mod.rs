pub mod book_mirror;
pub mod candle_store;
pub mod candle_sync;
pub mod orderbook;

pub use book_mirror::{BookFeed, NonceMode, OrderBookMirror};
pub use candle_store::{Candle, CandleStore, UpsertKind};
pub use candle_sync::{CandleCache, CandleFetcher, CandleStatus};
pub use orderbook::{BookDelta, BookSnapshot, Offer, OfferChange, OrderBook, PendingUpdate};

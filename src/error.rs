use thiserror::Error;
use uuid::Uuid;

/// Order-book reconciliation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MirrorError {
    /// A delta reached the apply step with a nonce at or below the book's
    /// nonce. The feed is corrupt; the book must be rebuilt.
    #[error("nonce regression on {pair}: book at {book_nonce}, update {update_nonce}")]
    NonceRegression {
        pair: String,
        book_nonce: i64,
        update_nonce: i64,
    },
}

/// Balance accounting invariant violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BalanceError {
    #[error("exchange total is negative: {0}")]
    NegativeTotal(f64),
    #[error("exchange held is negative: {0}")]
    NegativeHeld(f64),
    #[error("exchange held {held} exceeds total {total}")]
    HeldExceedsTotal { held: f64, total: f64 },
    #[error("fund {fund} has negative total {total}")]
    FundNegativeTotal { fund: String, total: f64 },
    #[error("fund {fund} has negative held {held}")]
    FundNegativeHeld { fund: String, held: f64 },
    #[error("fund {fund} has {available} available, hold needs {requested}")]
    InsufficientAvailable {
        fund: String,
        available: f64,
        requested: f64,
    },
    #[error("unknown fund {0}")]
    UnknownFund(String),
    #[error("unknown hold {0}")]
    UnknownHold(Uuid),
}

/// Candle persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("candle timestamp {0} does not postdate the domain epoch")]
    InvalidCandle(i64),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

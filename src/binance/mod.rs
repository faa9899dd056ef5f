pub mod client;
pub mod feed;

pub use client::BinanceClient;
pub use feed::BinanceFeed;

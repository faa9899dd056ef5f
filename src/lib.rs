pub mod api;
pub mod app_state;
pub mod balances;
pub mod binance;
pub mod clock;
pub mod error;
pub mod market_data;
pub mod reconcile;
pub mod runtime_config;
pub mod types;

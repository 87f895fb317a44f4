//! Core of a peer-to-peer fiat exchange: the trade lifecycle, trader bond
//! accounting and dispute resolution, persisted in sled.

pub mod bond;
pub mod config;
pub mod dispute;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod notifier;
pub mod query;
pub mod rating;
pub mod service;
pub mod store;
pub mod trade;
pub mod trader;
pub mod utils;

pub use config::ExchangeConfig;
pub use dispute::{Dispute, DisputeStatus, Resolution};
pub use error::{ErrorKind, ExchangeError};
pub use lifecycle::{TradeAction, TradeStatus};
pub use service::TradeService;
pub use trade::{Recipient, Trade, TradeRequest};
pub use trader::{Corridor, Trader, TraderStatus};

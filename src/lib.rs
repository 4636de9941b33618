pub mod browser;
pub mod config;
pub mod error;
pub mod market_data;
pub mod session;
pub mod telemetry;

pub use config::FeedConfig;
pub use error::{FeedError, FeedResult};
pub use market_data::facade::{Diagnostics, MarketDataFacade};
pub use market_data::types::{Acquisition, Candle, CandleSource, ConnectionState, InstrumentKey};
pub use session::runtime::SessionLoop;

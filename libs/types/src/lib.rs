//! Types library for the market-data capture service
//!
//! Shared identifiers, numeric normalization, persisted row shapes and the
//! error taxonomy. Nothing in here performs I/O.
//!
//! # Modules
//! - `ids`: Exchange and application identifiers (ChannelId, PairId, OrderId, TradeId)
//! - `numeric`: Exact decimal and timestamp normalization of exchange encodings
//! - `book`: Order-book delta events, persisted book rows and episode markers
//! - `trade`: Persisted trade rows
//! - `errors`: Error taxonomy

pub mod ids;
pub mod numeric;
pub mod book;
pub mod trade;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::book::*;
    pub use crate::trade::*;
    pub use crate::errors::*;
}

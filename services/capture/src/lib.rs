//! Capture Service
//!
//! Records a live exchange feed into Postgres:
//! - Order-book deltas regrouped into episodes and bulk-written in batches
//! - Trades written one row at a time as they arrive
//! - Snapshot episode markers written eagerly
//! - Instrument metadata refreshed on a timer
//!
//! # Architecture
//!
//! ```text
//!   Exchange WebSocket
//!          │
//!   ┌──────▼──────┐
//!   │ Supervisor  │  ← connect, subscribe, reconnect
//!   └──────┬──────┘
//!          │ (receive ts, frame)
//!   ┌──────▼──────┐
//!   │ Dispatcher  │  ← channel id → handler
//!   └──┬───────┬──┘
//!      │       │
//!  ┌───▼──┐ ┌──▼────┐
//!  │ Book │ │Trades │
//!  └───┬──┘ └──┬────┘
//!      │ bulk  │ row
//!   ┌──▼───────▼──┐      ┌─────────┐
//!   │ StorageSink │ ◄─── │ Symbols │
//!   └─────────────┘      └─────────┘
//! ```

pub mod book;
pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod episode;
pub mod error;
pub mod events;
pub mod postgres;
pub mod sink;
pub mod supervisor;
pub mod symbols;
pub mod trades;

// Service version
pub const SERVICE_VERSION: &str = "0.1.0";

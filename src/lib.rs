//! Real-time fill/order monitor for a Hyperliquid-style perp/spot
//! exchange: subscribes to watched addresses over WebSocket, aggregates
//! fills into per-order signals, and publishes + persists them.
//!
//! Split into a lib + bin so the pipeline's components are directly
//! unit-testable without spinning up the binary's I/O.

pub mod address_loader;
pub mod aggregator;
pub mod batch_writer;
pub mod caches;
pub mod cleaner;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod health;
pub mod hl_wire;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod pool;
pub mod processor;
pub mod publisher;
pub mod schema;
pub mod signal_sink;
pub mod util;

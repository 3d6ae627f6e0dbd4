//! Error kinds shared across the pipeline.
//!
//! Mirrors the propagation rule: components recover locally from
//! `Transient` errors and escalate via metrics; `Fatal` is the only
//! kind that aborts the process, and only at init time.

use thiserror::Error;

/// Maximum number of raw payload bytes kept in a `MalformedEvent` error.
pub const MALFORMED_PAYLOAD_CAP: usize = 512;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Network blip, DB deadlock, bus publish timeout — retried per
    /// component policy, never escalated beyond a metric increment.
    #[error("transient error: {0}")]
    Transient(String),

    /// No connection has a free subscription slot and the pool is
    /// already at `max_connections`.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// A wire message failed to parse or violated an expected shape.
    /// The raw payload is truncated so logs stay bounded.
    #[error("malformed event: {reason} (raw: {raw})")]
    MalformedEvent { reason: String, raw: String },

    /// Config load failure or a required collaborator unreachable at
    /// startup. The only kind that propagates to `main` and exits.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl MonitorError {
    pub fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        let mut truncated = raw.to_string();
        if truncated.len() > MALFORMED_PAYLOAD_CAP {
            truncated.truncate(MALFORMED_PAYLOAD_CAP);
            truncated.push_str("...(truncated)");
        }
        MonitorError::MalformedEvent {
            reason: reason.into(),
            raw: truncated,
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

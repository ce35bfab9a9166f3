//! Unified error handling for driftd.
//!
//! Most registry failures are not Rust errors at all: protocol violations
//! are answered with notice messages and a log line, timeouts resolve into
//! "try next candidate" or "lock denied", and leadership disagreement is a
//! logged warning. The types here cover the places where a caller genuinely
//! needs a `Result`.

use drift_proto::{Action, Topic};
use thiserror::Error;

// ConfigError lives in config.rs next to the loading and validation code
// it belongs to.

/// Errors surfaced when routing an incoming client message to a registry.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("no registry handles {topic:?}/{action:?}")]
    Unroutable {
        /// Topic of the offending message.
        topic: Topic,
        /// Action of the offending message.
        action: Action,
    },
}

impl MessageError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unroutable { .. } => "unroutable",
        }
    }
}

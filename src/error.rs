//! Error handling types for devbus
//!
//! This module provides the error type shared by promises, the connector and
//! the channel lifecycle components.

use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// Error code for requests the connector could not process at all
/// (dead-lettered requests, connector faults).
pub const INTERNAL_ERROR: i32 = -32603;

/// Error code for requests routed to a service name nobody hosts.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// Error code for requests a service rejected or failed while handling.
pub const SERVICE_ERROR: i32 = -32000;

/// Comprehensive error type for bus operations
///
/// `Clone` because one rejection may be delivered to several continuations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// Publishing a request failed before it left the process
    #[error("Failed to send request {id}")]
    FailedToSend { id: i32 },

    /// A service with the same name is already registered on this connector
    #[error("Service already registered: {name}")]
    DuplicateService { name: String },

    /// The broker refused an operation or the connection is broken
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// The remote side answered with an error response
    #[error("{message} (code {code})")]
    Remote { code: i32, message: String },

    /// The operation needs a channel but the connector is not on one
    #[error("Not connected to a channel")]
    NotConnected,

    /// The connector was closed while the operation was pending
    #[error("Connection closed")]
    Closed,

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Waiting for a result took longer than allowed
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Helper functions for common error patterns
impl BusError {
    /// Create a broker error
    pub fn broker(message: impl Into<String>) -> Self {
        BusError::Broker {
            message: message.into(),
        }
    }

    /// Create a remote error
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        BusError::Remote {
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        BusError::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        BusError::Internal(message.into())
    }

    /// Whether the error was already reported to someone by the peer that
    /// produced it.
    ///
    /// Unhandled rejections carrying such an error are not logged again.
    pub fn is_communicated(&self) -> bool {
        matches!(self, BusError::Remote { .. })
    }
}

/// Helper trait to recover a guard from a poisoned lock
pub trait LockResultExt<G> {
    /// Take the guard even if another thread panicked while holding the lock.
    ///
    /// The context parameter identifies which operation triggered lock recovery,
    /// helping developers debug thread safety issues.
    fn recover_poison(self, context: &str) -> G;
}

impl<G> LockResultExt<G> for Result<G, PoisonError<G>> {
    fn recover_poison(self, context: &str) -> G {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "devbus::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn only_remote_errors_count_as_communicated() {
        assert!(BusError::remote(SERVICE_ERROR, "boom").is_communicated());
        assert!(!BusError::FailedToSend { id: 3 }.is_communicated());
        assert!(!BusError::Closed.is_communicated());
        assert!(!BusError::internal("x").is_communicated());
    }

    #[test]
    fn remote_error_message_carries_code() {
        let err = BusError::remote(INTERNAL_ERROR, "dead-lettered");
        assert_eq!(err.to_string(), "dead-lettered (code -32603)");
    }

    #[test]
    fn recover_poison_returns_guard_after_panic() {
        let lock = Arc::new(Mutex::new(7));
        let clone = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("Intentional panic to poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        let guard = lock.lock().recover_poison("test");
        assert_eq!(*guard, 7);
    }
}

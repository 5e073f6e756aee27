//! Connection status of a connector.
//!
//! Lifecycle:
//! - Initializing: connector created, no channel joined yet (or reconnecting)
//! - Connected: joined a channel, topology declared
//! - Closed: connection closed (terminal)
//!
//! Transitions return a new value; a status is never changed in place.

use crate::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Initializing,
    Connected,
    Closed,
}

/// Immutable connection status plus the last error observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    kind: StatusKind,
    last_error: Option<BusError>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::initializing()
    }
}

impl ConnectionStatus {
    pub fn initializing() -> Self {
        Self {
            kind: StatusKind::Initializing,
            last_error: None,
        }
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn last_error(&self) -> Option<&BusError> {
        self.last_error.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.kind == StatusKind::Connected
    }

    /// Connected, with the previous error cleared. A closed status stays closed.
    pub fn connect(&self) -> Self {
        if self.kind == StatusKind::Closed {
            return self.clone();
        }
        Self {
            kind: StatusKind::Connected,
            last_error: None,
        }
    }

    /// Same kind, remembering `error`.
    pub fn error(&self, error: BusError) -> Self {
        Self {
            kind: self.kind,
            last_error: Some(error),
        }
    }

    /// Back to initializing, keeping the last error. A closed status stays closed.
    pub fn reconnect(&self) -> Self {
        if self.kind == StatusKind::Closed {
            return self.clone();
        }
        Self {
            kind: StatusKind::Initializing,
            last_error: self.last_error.clone(),
        }
    }

    pub fn close(&self) -> Self {
        Self {
            kind: StatusKind::Closed,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_produce_new_values() {
        let initial = ConnectionStatus::initializing();
        let connected = initial.connect();

        assert_eq!(initial.kind(), StatusKind::Initializing);
        assert_eq!(connected.kind(), StatusKind::Connected);
        assert!(connected.is_connected());
    }

    #[test]
    fn error_keeps_kind_and_connect_clears_it() {
        let failed = ConnectionStatus::initializing()
            .connect()
            .error(BusError::broker("channel closed"));
        assert_eq!(failed.kind(), StatusKind::Connected);
        assert_eq!(failed.last_error(), Some(&BusError::broker("channel closed")));

        let reconnecting = failed.reconnect();
        assert_eq!(reconnecting.kind(), StatusKind::Initializing);
        assert!(reconnecting.last_error().is_some());

        assert!(reconnecting.connect().last_error().is_none());
    }

    #[test]
    fn closed_is_terminal() {
        let closed = ConnectionStatus::initializing().connect().close();
        assert_eq!(closed.connect().kind(), StatusKind::Closed);
        assert_eq!(closed.reconnect().kind(), StatusKind::Closed);
    }
}

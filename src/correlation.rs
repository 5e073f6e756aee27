//! Correlation of RPC requests with their pending promises.
//!
//! The connector allocates an id for every outgoing request, stores the
//! caller's promise under it, and completes the promise when a response
//! carrying that id arrives.
//!
//! # Id allocation
//!
//! Ids run from 1 to `i32::MAX` and then start over at 1; 0 is never issued.
//! Ids are not checked against in-flight requests on wrap. A request would
//! have to stay pending for a full cycle of the id space to collide, and
//! callers time requests out long before that.

use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;

use crate::error::BusError;
use crate::promise::Promise;

/// Logging target for correlation diagnostics.
const LOG_TARGET: &str = "devbus::correlation";

/// Pending requests keyed by correlation id.
pub struct CorrelationTable<T> {
    counter: AtomicI32,
    pending: DashMap<i32, Promise<T>>,
}

impl<T: Clone + Send + 'static> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> CorrelationTable<T> {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Create a table whose next id is `last + 1` (or 1 after `i32::MAX`).
    pub(crate) fn starting_after(last: i32) -> Self {
        Self {
            counter: AtomicI32::new(last),
            pending: DashMap::new(),
        }
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> i32 {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current == i32::MAX { 1 } else { current + 1 })
            })
            .unwrap_or_else(|current| current);
        if previous == i32::MAX { 1 } else { previous + 1 }
    }

    /// Allocate an id and store `promise` under it.
    pub fn add(&self, promise: Promise<T>) -> i32 {
        let id = self.next_id();
        if self.pending.insert(id, promise).is_some() {
            log::warn!(
                target: LOG_TARGET,
                "Request id {} reused while still pending; the older request will never complete",
                id
            );
        }
        id
    }

    /// Remove and reject the promise for a request whose publish failed.
    pub fn failed_to_send(&self, id: i32) {
        match self.pending.remove(&id) {
            Some((_, promise)) => {
                promise.set_error(BusError::FailedToSend { id });
            }
            None => log::warn!(
                target: LOG_TARGET,
                "Send failure reported for unknown request id {}",
                id
            ),
        }
    }

    /// Remove and return the promise for a completed request.
    ///
    /// Returns `None` (and logs) when the id is unknown: a duplicate
    /// delivery, a redelivered response or a request that already failed.
    pub fn get_promise_and_remove(&self, id: i32) -> Option<Promise<T>> {
        let promise = self.pending.remove(&id).map(|(_, promise)| promise);
        if promise.is_none() {
            log::warn!(
                target: LOG_TARGET,
                "No pending request for id {}, dropping response",
                id
            );
        }
        promise
    }

    /// Reject every pending request with `error`.
    ///
    /// Called when the connector closes so no caller waits forever.
    pub fn fail_all(&self, error: BusError) {
        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, promise)) = self.pending.remove(&id) {
                promise.set_error(error.clone());
            }
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PromiseState;

    #[test]
    fn ids_start_at_one_and_increase() {
        let table: CorrelationTable<()> = CorrelationTable::new();
        assert_eq!(table.next_id(), 1);
        assert_eq!(table.next_id(), 2);
        assert_eq!(table.next_id(), 3);
    }

    #[test]
    fn ids_wrap_to_one_after_max_and_skip_zero() {
        let table: CorrelationTable<()> = CorrelationTable::starting_after(i32::MAX - 2);
        assert_eq!(table.next_id(), i32::MAX - 1);
        assert_eq!(table.next_id(), i32::MAX);
        assert_eq!(table.next_id(), 1);
        assert_eq!(table.next_id(), 2);
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let table = std::sync::Arc::new(CorrelationTable::<()>::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || (0..1000).map(|_| table.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert!(!all.contains(&0));
    }

    #[test]
    fn add_registers_pending_promise() {
        let table = CorrelationTable::new();
        let id = table.add(Promise::<Vec<u8>>::new());
        assert_eq!(id, 1);
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn get_promise_and_remove_returns_promise_once() {
        let table = CorrelationTable::new();
        let promise = Promise::<Vec<u8>>::new();
        let id = table.add(promise.clone());

        let found = table.get_promise_and_remove(id).expect("pending promise");
        found.set_result(b"ok".to_vec());
        assert_eq!(promise.result(), Some(b"ok".to_vec()));

        assert!(table.get_promise_and_remove(id).is_none(), "second lookup is unknown");
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn failed_to_send_rejects_and_removes() {
        let table = CorrelationTable::new();
        let promise = Promise::<Vec<u8>>::new();
        promise.rejected(|_| {});
        let id = table.add(promise.clone());

        table.failed_to_send(id);
        assert_eq!(promise.state(), PromiseState::Rejected);
        assert_eq!(promise.error(), Some(BusError::FailedToSend { id }));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn fail_all_rejects_every_pending_request() {
        let table = CorrelationTable::new();
        let first = Promise::<()>::new();
        let second = Promise::<()>::new();
        first.rejected(|_| {});
        second.rejected(|_| {});
        table.add(first.clone());
        table.add(second.clone());

        table.fail_all(BusError::Closed);
        assert_eq!(first.error(), Some(BusError::Closed));
        assert_eq!(second.error(), Some(BusError::Closed));
        assert_eq!(table.pending_count(), 0);
    }
}

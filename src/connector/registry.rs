//! Event handler registry keyed by topic name.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::handler::EventHandler;

const LOG_TARGET: &str = "devbus::connector";

/// Identifies one handler registration; pass it to
/// [`MessageConnector::off`](super::MessageConnector::off) to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: AtomicU64,
    topics: DashMap<String, Vec<(HandlerId, Arc<dyn EventHandler>)>>,
}

impl HandlerRegistry {
    pub fn add(&self, topic: &str, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut removed = false;
        self.topics.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Snapshot of the handlers for `topic`.
    ///
    /// Handlers run on the snapshot so they may register or remove handlers
    /// without deadlocking.
    fn handlers(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        self.topics
            .get(topic)
            .map(|handlers| handlers.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Invoke every handler of `topic`. Returns how many handlers ran.
    ///
    /// Errors and panics are logged per handler; the remaining handlers
    /// still run.
    pub fn dispatch(
        &self,
        topic: &str,
        message: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> usize {
        let handlers = self.handlers(topic);
        if handlers.is_empty() {
            log::trace!(target: LOG_TARGET, "No handler for topic {}", topic);
        }
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| {
                handler.handle(message, reply_to, correlation_id)
            })) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!(target: LOG_TARGET, "Handler for topic {} failed: {}", topic, e)
                }
                Err(_) => log::error!(target: LOG_TARGET, "Handler for topic {} panicked", topic),
            }
        }
        handlers.len()
    }
}

//! Answering one RPC request.
//!
//! A [`ReplySink`] is handed to [`Service::reply`]. Whichever comes first of
//! the sink's answer, the service returning an error, or the service
//! finishing without an answer decides the response; later outcomes are
//! ignored.
//!
//! Acknowledgement follows the response: the request is acked once the
//! response is published, and rejected (requeued unless already redelivered)
//! when the publish fails.
//!
//! [`Service::reply`]: crate::handler::Service::reply

use std::sync::{Arc, Mutex};

use super::inbound::ERROR_CODE_HEADER;
use crate::broker::{BrokerConnection, MessageProperties};
use crate::error::{BusError, BusResult, LockResultExt, SERVICE_ERROR};
use crate::handler::ResultSink;

const LOG_TARGET: &str = "devbus::connector";

/// Message sent when a service finishes without answering.
pub(crate) const NO_REPLY_MESSAGE: &str = "service produced no reply";

/// Where and how to answer one request.
pub(crate) struct ReplyTarget {
    pub connection: Arc<dyn BrokerConnection>,
    /// Command exchange of the channel the request arrived on.
    pub exchange: String,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub own_queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl ReplyTarget {
    /// Publish a success response and settle the delivery.
    pub fn send_result(&self, body: Vec<u8>) {
        self.send(MessageProperties::default(), body);
    }

    /// Publish an error response and settle the delivery.
    pub fn send_error(&self, code: i32, message: &str) {
        let properties = MessageProperties::default().with_header(ERROR_CODE_HEADER, code.to_string());
        self.send(properties, message.as_bytes().to_vec());
    }

    fn send(&self, properties: MessageProperties, body: Vec<u8>) {
        let Some(reply_to) = self.reply_to.as_deref() else {
            log::warn!(
                target: LOG_TARGET,
                "Request {:?} has no reply-to, dropping its response",
                self.correlation_id
            );
            self.settle(Ok(()));
            return;
        };

        let mut properties = properties.with_app_id(self.own_queue.clone());
        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(correlation_id.clone());
        }
        let published = self
            .connection
            .basic_publish(&self.exchange, reply_to, properties, body);
        self.settle(published);
    }

    fn settle(&self, published: BusResult<()>) {
        let outcome = match published {
            Ok(()) => self.connection.basic_ack(self.delivery_tag),
            Err(e) => {
                log::warn!(
                    target: LOG_TARGET,
                    "Failed to publish response for {:?}: {}",
                    self.correlation_id,
                    e
                );
                self.connection
                    .basic_reject(self.delivery_tag, !self.redelivered)
            }
        };
        if let Err(e) = outcome {
            log::warn!(
                target: LOG_TARGET,
                "Failed to settle delivery {}: {}",
                self.delivery_tag,
                e
            );
        }
    }
}

#[derive(Debug, Default)]
struct Flags {
    answered: bool,
    sink_dropped: bool,
    dispatch_done: bool,
}

/// Shared between the sink and the dispatching thread.
pub(crate) struct ReplyState {
    target: ReplyTarget,
    flags: Mutex<Flags>,
}

impl ReplyState {
    pub fn new(target: ReplyTarget) -> Arc<Self> {
        Arc::new(Self {
            target,
            flags: Mutex::new(Flags::default()),
        })
    }

    /// Mark the request answered. Returns `false` if it already was.
    fn claim(&self) -> bool {
        let mut flags = self.flags.lock().recover_poison("ReplyState::claim");
        !std::mem::replace(&mut flags.answered, true)
    }

    /// Record the outcome of `Service::reply`.
    ///
    /// `Err` rejects the request unless the sink answered first. `Ok` with the
    /// sink already gone and no answer means the service forgot to reply.
    pub fn finish_dispatch(&self, outcome: Result<(), String>) {
        let send = {
            let mut flags = self.flags.lock().recover_poison("ReplyState::finish_dispatch");
            flags.dispatch_done = true;
            if flags.answered {
                None
            } else {
                match outcome {
                    Err(message) => {
                        flags.answered = true;
                        Some(message)
                    }
                    Ok(()) if flags.sink_dropped => {
                        flags.answered = true;
                        Some(NO_REPLY_MESSAGE.to_string())
                    }
                    Ok(()) => None,
                }
            }
        };
        if let Some(message) = send {
            self.target.send_error(SERVICE_ERROR, &message);
        }
    }

    fn sink_dropped(&self) {
        let unanswered = {
            let mut flags = self.flags.lock().recover_poison("ReplyState::sink_dropped");
            flags.sink_dropped = true;
            if !flags.answered && flags.dispatch_done {
                flags.answered = true;
                true
            } else {
                false
            }
        };
        if unanswered {
            self.target.send_error(SERVICE_ERROR, NO_REPLY_MESSAGE);
        }
    }
}

/// The [`ResultSink`] a service answers through.
pub(crate) struct ReplySink {
    state: Arc<ReplyState>,
}

impl ReplySink {
    pub fn new(state: Arc<ReplyState>) -> Self {
        Self { state }
    }
}

impl ResultSink for ReplySink {
    fn write(self: Box<Self>, result: Vec<u8>) {
        if self.state.claim() {
            self.state.target.send_result(result);
        }
    }

    fn reject(self: Box<Self>, reason: &str) {
        if self.state.claim() {
            self.state.target.send_error(SERVICE_ERROR, reason);
        }
    }

    fn reject_error(self: Box<Self>, error: BusError) {
        if self.state.claim() {
            match error {
                BusError::Remote { code, message } => self.state.target.send_error(code, &message),
                other => self
                    .state
                    .target
                    .send_error(SERVICE_ERROR, &other.to_string()),
            }
        }
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        self.state.sink_dropped();
    }
}

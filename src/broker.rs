//! Broker connection abstraction.
//!
//! The connector talks to an AMQP 0-9-1 style broker through
//! [`BrokerConnection`]. Only the operations the bus protocol needs are
//! modelled: exchange and queue declaration, bindings, publishing, consuming
//! with manual or automatic acknowledgement, and rejection with or without
//! requeue.
//!
//! [`memory::MemoryBroker`] provides an in-process implementation.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BusResult;

pub use memory::{MemoryBroker, MemoryConnection};

/// Header added to a message each time it is dead-lettered.
pub const DEATH_HEADER: &str = "x-death";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes by pattern; `*` matches one dot-separated word, `#` zero or more.
    Topic,
    /// Routes by exact routing key.
    Direct,
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Only the declaring connection may use the queue; removed when it closes.
    pub exclusive: bool,
    /// Removed when its last consumer is cancelled.
    pub auto_delete: bool,
    /// Exchange that receives messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

/// Message properties used by the bus protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag for `basic_ack` / `basic_reject` (manual acknowledgement only).
    pub delivery_tag: u64,
    /// Set when the broker delivered this message before and it was requeued.
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Deliveries count as acknowledged once handed to the consumer.
    Auto,
    /// Deliveries stay unacknowledged until `basic_ack` or `basic_reject`.
    Manual,
}

/// Consumer callback, invoked on a broker-owned thread.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// One connection to the broker.
pub trait BrokerConnection: Send + Sync {
    fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> BusResult<()>;

    /// Declare a queue, letting the broker pick a name when `name` is `None`.
    ///
    /// Returns the queue name.
    fn queue_declare(&self, name: Option<&str>, options: &QueueOptions) -> BusResult<String>;

    fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BusResult<()>;

    /// Start consuming `queue`. Returns the consumer tag.
    fn basic_consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        callback: DeliveryCallback,
    ) -> BusResult<String>;

    fn basic_cancel(&self, consumer_tag: &str) -> BusResult<()>;

    fn basic_ack(&self, delivery_tag: u64) -> BusResult<()>;

    /// Reject a delivery. Without requeue the message is dead-lettered if the
    /// queue has a dead-letter exchange, dropped otherwise.
    fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> BusResult<()>;

    /// Close the connection, waiting at most `timeout`.
    fn close(&self, timeout: Duration) -> BusResult<()>;
}

//! In-process broker with AMQP 0-9-1 routing semantics.
//!
//! `MemoryBroker` holds exchanges, queues and bindings; each
//! [`MemoryConnection`] obtained from it implements [`BrokerConnection`].
//! It is what tests and the `devbus ping` command run the protocol against.
//!
//! # Delivery model
//!
//! ```text
//! basic_publish ──► exchange ──► bindings ──► queue ──► consumer thread ──► callback
//!                                              │
//!                                              └─► backlog (no consumer yet)
//! ```
//!
//! Every consumer owns a delivery thread fed by an unbounded channel, so
//! callbacks run outside the broker lock and may call back into the broker.
//! Consumers of one queue receive messages round-robin.
//!
//! Manual-ack deliveries stay in the unacked table until acknowledged,
//! rejected, or their connection closes (then they are requeued with
//! `redelivered` set).

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use ulid::Ulid;

use super::{
    AckMode, BrokerConnection, DEATH_HEADER, Delivery, DeliveryCallback, ExchangeKind,
    MessageProperties, QueueOptions,
};
use crate::error::{BusError, BusResult, LockResultExt};

/// Logging target for the in-memory broker.
const LOG_TARGET: &str = "devbus::broker";

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    connection: u64,
    ack_mode: AckMode,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    owner: u64,
    consumers: Vec<Consumer>,
    backlog: VecDeque<Message>,
    next_consumer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Unacked {
    queue: String,
    connection: u64,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
    next_connection_id: u64,
    next_consumer_id: u64,
}

impl BrokerState {
    /// Route a message through `exchange` to every matching queue.
    fn route(&mut self, exchange: &str, message: Message) -> BusResult<()> {
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::broker(format!("no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && routing_matches(kind, &binding.routing_key, &message.routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        if targets.is_empty() {
            log::trace!(
                target: LOG_TARGET,
                "Message to {}/{} matched no queue, dropping",
                exchange,
                message.routing_key
            );
        }
        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    /// Hand a message to the next consumer of `queue_name`, or keep it in
    /// the backlog when nobody consumes the queue.
    fn enqueue(&mut self, queue_name: &str, message: Message) {
        let delivery_tag = self.next_delivery_tag + 1;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        if queue.consumers.is_empty() {
            queue.backlog.push_back(message);
            return;
        }
        self.next_delivery_tag = delivery_tag;

        let index = queue.next_consumer % queue.consumers.len();
        queue.next_consumer = index + 1;
        let consumer = &queue.consumers[index];

        let delivery = Delivery {
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            properties: message.properties.clone(),
            body: message.body.clone(),
        };
        if consumer.sender.send(delivery).is_err() {
            log::warn!(
                target: LOG_TARGET,
                "Consumer {} is gone, keeping message in {}",
                consumer.tag,
                queue_name
            );
            queue.backlog.push_back(message);
            return;
        }

        if consumer.ack_mode == AckMode::Manual {
            let connection = consumer.connection;
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    connection,
                    message,
                },
            );
        }
    }

    /// Send a rejected message to its queue's dead-letter exchange.
    fn dead_letter(&mut self, queue_name: &str, mut message: Message) {
        let dead_letter_exchange = self
            .queues
            .get(queue_name)
            .and_then(|queue| queue.options.dead_letter_exchange.clone());
        let Some(exchange) = dead_letter_exchange else {
            log::debug!(
                target: LOG_TARGET,
                "Rejected message from {} has no dead-letter exchange, dropping",
                queue_name
            );
            return;
        };

        let death = match message.properties.headers.get(DEATH_HEADER) {
            Some(previous) => format!("{},rejected:{}", previous, queue_name),
            None => format!("rejected:{}", queue_name),
        };
        message.properties.headers.insert(DEATH_HEADER.to_string(), death);
        message.redelivered = false;
        message.exchange = exchange.clone();

        if let Err(e) = self.route(&exchange, message) {
            log::warn!(
                target: LOG_TARGET,
                "Dead-lettering from {} failed: {}",
                queue_name,
                e
            );
        }
    }

    fn requeue(&mut self, queue_name: &str, mut message: Message) {
        message.redelivered = true;
        self.enqueue(queue_name, message);
    }

    fn delete_queue(&mut self, queue_name: &str) {
        if self.queues.remove(queue_name).is_some() {
            self.bindings.retain(|binding| binding.queue != queue_name);
            log::debug!(target: LOG_TARGET, "Deleted queue {}", queue_name);
        }
    }

    /// Remove a consumer; auto-delete queues go away with their last consumer.
    fn cancel_consumer(&mut self, consumer_tag: &str) -> bool {
        let mut emptied = None;
        let mut found = false;
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
            if queue.consumers.len() != before {
                found = true;
                if queue.consumers.is_empty() && queue.options.auto_delete {
                    emptied = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            self.delete_queue(&name);
        }
        found
    }

    fn check_access(&self, queue_name: &str, connection: u64) -> BusResult<()> {
        let queue = self
            .queues
            .get(queue_name)
            .ok_or_else(|| BusError::broker(format!("no queue '{}'", queue_name)))?;
        if queue.options.exclusive && queue.owner != connection {
            return Err(BusError::broker(format!(
                "queue '{}' is exclusive to another connection",
                queue_name
            )));
        }
        Ok(())
    }
}

/// Whether a binding key matches a routing key for the given exchange kind.
fn routing_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_words_match(&pattern, &words)
        }
    }
}

fn topic_words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_words_match(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_words_match(rest, &words[1..]),
        Some((word, rest)) => {
            words.first() == Some(word) && topic_words_match(rest, &words[1..])
        }
    }
}

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().recover_poison("MemoryBroker")
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = {
            let mut state = self.lock();
            state.next_connection_id += 1;
            state.next_connection_id
        };
        MemoryConnection {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting in a queue's backlog (not yet handed to a consumer).
    pub fn message_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.backlog.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// Deliveries handed out with manual acknowledgement and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Routing keys binding `queue` to `exchange`.
    pub fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue && binding.exchange == exchange)
            .map(|binding| binding.routing_key.clone())
            .collect()
    }
}

/// A connection to a [`MemoryBroker`].
///
/// Closing (or dropping) the connection cancels its consumers, deletes its
/// exclusive queues and requeues its unacknowledged deliveries.
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn lock(&self) -> BusResult<MutexGuard<'_, BrokerState>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::broker("connection closed"));
        }
        Ok(self.state.lock().recover_poison("MemoryConnection"))
    }

    fn spawn_delivery_thread(
        tag: &str,
        mut receiver: mpsc::UnboundedReceiver<Delivery>,
        callback: DeliveryCallback,
    ) -> BusResult<()> {
        let consumer_tag = tag.to_string();
        std::thread::Builder::new()
            .name(format!("memory-broker-{}", tag))
            .spawn(move || {
                while let Some(delivery) = receiver.blocking_recv() {
                    let callback = callback.clone();
                    if catch_unwind(AssertUnwindSafe(move || callback(delivery))).is_err() {
                        log::error!(
                            target: LOG_TARGET,
                            "Consumer {} panicked while handling a delivery",
                            consumer_tag
                        );
                    }
                }
                log::trace!(target: LOG_TARGET, "Consumer {} stopped", consumer_tag);
            })
            .map(|_| ())
            .map_err(|e| BusError::broker(format!("failed to start consumer thread: {}", e)))
    }
}

impl BrokerConnection for MemoryConnection {
    fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> BusResult<()> {
        let mut state = self.lock()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::broker(format!(
                "exchange '{}' already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                log::debug!(target: LOG_TARGET, "Declared {:?} exchange {}", kind, name);
                Ok(())
            }
        }
    }

    fn queue_declare(&self, name: Option<&str>, options: &QueueOptions) -> BusResult<String> {
        let mut state = self.lock()?;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("amq.gen-{}", Ulid::new()),
        };
        if let Some(existing) = state.queues.get(&name) {
            if existing.options != *options {
                return Err(BusError::broker(format!(
                    "PRECONDITION_FAILED: queue '{}' already declared with {:?}",
                    name, existing.options
                )));
            }
            state.check_access(&name, self.id)?;
            return Ok(name);
        }
        state.queues.insert(
            name.clone(),
            QueueState {
                options: options.clone(),
                owner: self.id,
                consumers: Vec::new(),
                backlog: VecDeque::new(),
                next_consumer: 0,
            },
        );
        log::debug!(target: LOG_TARGET, "Declared queue {} ({:?})", name, options);
        Ok(name)
    }

    fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let mut state = self.lock()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::broker(format!("no exchange '{}'", exchange)));
        }
        state.check_access(queue, self.id)?;
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let mut state = self.lock()?;
        state.bindings.retain(|binding| {
            !(binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key)
        });
        Ok(())
    }

    fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BusResult<()> {
        let mut state = self.lock()?;
        state.route(
            exchange,
            Message {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties,
                body,
                redelivered: false,
            },
        )
    }

    fn basic_consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        callback: DeliveryCallback,
    ) -> BusResult<String> {
        let mut state = self.lock()?;
        state.check_access(queue, self.id)?;

        state.next_consumer_id += 1;
        let tag = format!("ctag-{}", state.next_consumer_id);
        let (sender, receiver) = mpsc::unbounded_channel();
        Self::spawn_delivery_thread(&tag, receiver, callback)?;

        let backlog = match state.queues.get_mut(queue) {
            Some(queue_state) => {
                queue_state.consumers.push(Consumer {
                    tag: tag.clone(),
                    connection: self.id,
                    ack_mode,
                    sender,
                });
                std::mem::take(&mut queue_state.backlog)
            }
            None => VecDeque::new(),
        };
        for message in backlog {
            state.enqueue(queue, message);
        }
        Ok(tag)
    }

    fn basic_cancel(&self, consumer_tag: &str) -> BusResult<()> {
        let mut state = self.lock()?;
        if !state.cancel_consumer(consumer_tag) {
            log::debug!(
                target: LOG_TARGET,
                "Cancel for unknown consumer {}",
                consumer_tag
            );
        }
        Ok(())
    }

    fn basic_ack(&self, delivery_tag: u64) -> BusResult<()> {
        let mut state = self.lock()?;
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BusError::broker(format!("unknown delivery tag {}", delivery_tag)))
    }

    fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> BusResult<()> {
        let mut state = self.lock()?;
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BusError::broker(format!("unknown delivery tag {}", delivery_tag)))?;
        if requeue {
            state.requeue(&unacked.queue, unacked.message);
        } else {
            state.dead_letter(&unacked.queue, unacked.message);
        }
        Ok(())
    }

    /// In-memory close completes immediately; `timeout` is not needed.
    fn close(&self, _timeout: Duration) -> BusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock().recover_poison("MemoryConnection::close");

        let own_consumers: Vec<String> = state
            .queues
            .values()
            .flat_map(|queue| queue.consumers.iter())
            .filter(|consumer| consumer.connection == self.id)
            .map(|consumer| consumer.tag.clone())
            .collect();
        for tag in own_consumers {
            state.cancel_consumer(&tag);
        }

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.options.exclusive && queue.owner == self.id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            state.delete_queue(&name);
        }

        let orphaned: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.connection == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut requeued = HashSet::new();
        for tag in orphaned {
            if let Some(unacked) = state.unacked.remove(&tag) {
                requeued.insert(unacked.queue.clone());
                state.requeue(&unacked.queue, unacked.message);
            }
        }

        log::debug!(
            target: LOG_TARGET,
            "Connection {} closed, requeued unacked deliveries into {:?}",
            self.id,
            requeued
        );
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn collector() -> (DeliveryCallback, std_mpsc::Receiver<Delivery>) {
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: DeliveryCallback = Arc::new(move |delivery| {
            let _ = tx.lock().unwrap().send(delivery);
        });
        (callback, rx)
    }

    #[test]
    fn topic_patterns_match_words() {
        assert!(routing_matches(ExchangeKind::Topic, "#", "a"));
        assert!(routing_matches(ExchangeKind::Topic, "#", "a.b.c"));
        assert!(routing_matches(ExchangeKind::Topic, "a.*", "a.b"));
        assert!(!routing_matches(ExchangeKind::Topic, "a.*", "a.b.c"));
        assert!(routing_matches(ExchangeKind::Topic, "a.#", "a"));
        assert!(routing_matches(ExchangeKind::Topic, "*.response", "ping.response"));
        assert!(!routing_matches(ExchangeKind::Topic, "ping", "pong"));
        assert!(routing_matches(ExchangeKind::Direct, "svc", "svc"));
        assert!(!routing_matches(ExchangeKind::Direct, "#", "svc"));
    }

    #[test]
    fn server_named_queues_are_unique() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let first = connection.queue_declare(None, &QueueOptions::default()).unwrap();
        let second = connection.queue_declare(None, &QueueOptions::default()).unwrap();
        assert!(first.starts_with("amq.gen-"));
        assert_ne!(first, second);
    }

    #[test]
    fn publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let result =
            connection.basic_publish("t.nobody", "x", MessageProperties::default(), Vec::new());
        assert!(matches!(result, Err(BusError::Broker { .. })));
    }

    #[test]
    fn backlog_is_delivered_when_consumer_attaches() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection.exchange_declare("d.alice", ExchangeKind::Direct).unwrap();
        let queue = connection
            .queue_declare(Some("work"), &QueueOptions::default())
            .unwrap();
        connection.queue_bind(&queue, "d.alice", "work").unwrap();
        connection
            .basic_publish("d.alice", "work", MessageProperties::default(), b"1".to_vec())
            .unwrap();
        assert_eq!(broker.message_count("work"), 1);

        let (callback, rx) = collector();
        connection.basic_consume("work", AckMode::Auto, callback).unwrap();
        let delivery = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(delivery.body, b"1");
        assert_eq!(broker.message_count("work"), 0);
    }

    #[test]
    fn requeue_sets_redelivered_flag() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection.exchange_declare("d.bob", ExchangeKind::Direct).unwrap();
        connection
            .queue_declare(Some("svc"), &QueueOptions::default())
            .unwrap();
        connection.queue_bind("svc", "d.bob", "svc").unwrap();
        let (callback, rx) = collector();
        connection.basic_consume("svc", AckMode::Manual, callback).unwrap();

        connection
            .basic_publish("d.bob", "svc", MessageProperties::default(), b"x".to_vec())
            .unwrap();
        let first = rx.recv_timeout(WAIT).unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count(), 1);

        connection.basic_reject(first.delivery_tag, true).unwrap();
        let second = rx.recv_timeout(WAIT).unwrap();
        assert!(second.redelivered);

        connection.basic_ack(second.delivery_tag).unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[test]
    fn reject_without_requeue_dead_letters_with_death_header() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection.exchange_declare("d.carol", ExchangeKind::Direct).unwrap();
        connection
            .queue_declare(
                Some("svc"),
                &QueueOptions {
                    dead_letter_exchange: Some("d.carol".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        connection.queue_bind("svc", "d.carol", "svc").unwrap();
        let (callback, rx) = collector();
        connection.basic_consume("svc", AckMode::Manual, callback).unwrap();

        connection
            .basic_publish("d.carol", "svc", MessageProperties::default(), b"x".to_vec())
            .unwrap();
        let first = rx.recv_timeout(WAIT).unwrap();
        connection.basic_reject(first.delivery_tag, false).unwrap();

        let bounced = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(bounced.routing_key, "svc");
        assert_eq!(bounced.properties.header(DEATH_HEADER), Some("rejected:svc"));
        assert!(!bounced.redelivered);
    }

    #[test]
    fn consumers_share_queue_round_robin() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection.exchange_declare("d.dan", ExchangeKind::Direct).unwrap();
        connection
            .queue_declare(Some("svc"), &QueueOptions::default())
            .unwrap();
        connection.queue_bind("svc", "d.dan", "svc").unwrap();
        let (first_cb, first_rx) = collector();
        let (second_cb, second_rx) = collector();
        connection.basic_consume("svc", AckMode::Auto, first_cb).unwrap();
        connection.basic_consume("svc", AckMode::Auto, second_cb).unwrap();

        for _ in 0..4 {
            connection
                .basic_publish("d.dan", "svc", MessageProperties::default(), Vec::new())
                .unwrap();
        }
        for _ in 0..2 {
            first_rx.recv_timeout(WAIT).unwrap();
            second_rx.recv_timeout(WAIT).unwrap();
        }
    }

    #[test]
    fn auto_delete_queue_disappears_with_last_consumer() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .queue_declare(
                Some("temp"),
                &QueueOptions {
                    auto_delete: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let (callback, _rx) = collector();
        let tag = connection.basic_consume("temp", AckMode::Auto, callback).unwrap();
        assert!(broker.queue_exists("temp"));

        connection.basic_cancel(&tag).unwrap();
        assert!(!broker.queue_exists("temp"));
    }

    #[test]
    fn exclusive_queue_is_private_and_removed_on_close() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let other = broker.connect();
        let queue = owner
            .queue_declare(
                None,
                &QueueOptions {
                    exclusive: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let (callback, _rx) = collector();
        assert!(other.basic_consume(&queue, AckMode::Auto, callback).is_err());

        owner.close(Duration::from_secs(1)).unwrap();
        assert!(!broker.queue_exists(&queue));
        assert!(owner.exchange_declare("t.x", ExchangeKind::Topic).is_err());
    }

    #[test]
    fn redeclare_with_different_arguments_is_refused() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let alice = QueueOptions {
            auto_delete: true,
            dead_letter_exchange: Some("d.alice".to_string()),
            ..QueueOptions::default()
        };
        connection.queue_declare(Some("svc"), &alice).unwrap();

        assert_eq!(
            connection.queue_declare(Some("svc"), &alice).unwrap(),
            "svc",
            "identical redeclare is accepted"
        );
        let bob = QueueOptions {
            dead_letter_exchange: Some("d.bob".to_string()),
            ..alice.clone()
        };
        let error = broker
            .connect()
            .queue_declare(Some("svc"), &bob)
            .expect_err("mismatched dead-letter exchange must fail");
        assert!(error.to_string().contains("PRECONDITION_FAILED"), "got: {}", error);
    }

    #[test]
    fn closing_connection_requeues_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect();
        publisher.exchange_declare("d.erin", ExchangeKind::Direct).unwrap();
        publisher
            .queue_declare(Some("shared"), &QueueOptions::default())
            .unwrap();
        publisher.queue_bind("shared", "d.erin", "shared").unwrap();

        let crashing = broker.connect();
        let (callback, rx) = collector();
        crashing.basic_consume("shared", AckMode::Manual, callback).unwrap();
        publisher
            .basic_publish("d.erin", "shared", MessageProperties::default(), b"m".to_vec())
            .unwrap();
        rx.recv_timeout(WAIT).unwrap();

        crashing.close(Duration::ZERO).unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.message_count("shared"), 1);

        let (callback, rx) = collector();
        publisher.basic_consume("shared", AckMode::Auto, callback).unwrap();
        let redelivered = rx.recv_timeout(WAIT).unwrap();
        assert!(redelivered.redelivered);
    }
}

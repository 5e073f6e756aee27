//! Message connector: the bus protocol over one broker connection.
//!
//! A connector owns a server-named queue that receives every broadcast on
//! the current user channel plus the replies addressed to it. When it hosts
//! services it also consumes the channel's services queue, which carries the
//! RPC requests routed to those services.
//!
//! # Threading
//!
//! Broker callbacks run on broker-owned threads; every public method may be
//! called from any thread. Only `connect_to_channel_sync` and `close` block.

pub(crate) mod inbound;
mod registry;
mod reply;
pub mod topology;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::broker::{AckMode, BrokerConnection, Delivery, MemoryBroker, MessageProperties};
use crate::config::BusSettings;
use crate::correlation::CorrelationTable;
use crate::descriptors::{EVENT_RESPONSE_TYPE, ServiceMethod, Topic};
use crate::error::{BusError, BusResult, INTERNAL_ERROR, LockResultExt, METHOD_NOT_FOUND};
use crate::handler::{ChannelListener, EventHandler, Service};
use crate::promise::Promise;
use crate::status::{ConnectionStatus, StatusKind};

use inbound::{Frame, Request};
use registry::HandlerRegistry;
use reply::{ReplySink, ReplyState, ReplyTarget};
use topology::command_exchange;

pub use inbound::ERROR_CODE_HEADER;
pub use registry::HandlerId;

const LOG_TARGET: &str = "devbus::connector";

/// Reply sent for requests that came back through the dead-letter exchange.
const UNDELIVERABLE_MESSAGE: &str = "request could not be delivered";

/// Everything a connector needs from its environment.
#[derive(Clone)]
pub struct BusContext {
    pub connection: Arc<dyn BrokerConnection>,
    pub settings: Arc<BusSettings>,
}

impl BusContext {
    pub fn new(connection: Arc<dyn BrokerConnection>, settings: BusSettings) -> Self {
        Self {
            connection,
            settings: Arc::new(settings),
        }
    }

    /// Context over a fresh connection to `broker`.
    pub fn in_memory(broker: &MemoryBroker, settings: BusSettings) -> Self {
        Self::new(Arc::new(broker.connect()), settings)
    }
}

/// Identifies one channel listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The channel the connector currently occupies.
struct ChannelState {
    user: String,
    /// Consumer tag on the services queue, once a service is hosted.
    services_consumer: Option<String>,
}

struct ConnectorInner {
    me: Weak<ConnectorInner>,
    context: BusContext,
    own_queue: String,
    own_consumer: Mutex<Option<String>>,
    requests: CorrelationTable<Vec<u8>>,
    handlers: HandlerRegistry,
    services: DashMap<String, Arc<dyn Service>>,
    channel: Mutex<Option<ChannelState>>,
    status: ArcSwap<ConnectionStatus>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ChannelListener>)>>,
    next_listener_id: AtomicU64,
}

/// Client side of the bus.
///
/// Cloning yields another handle to the same connector.
#[derive(Clone)]
pub struct MessageConnector {
    inner: Arc<ConnectorInner>,
}

/// Non-owning handle for callbacks registered on the connector itself.
#[derive(Clone)]
pub(crate) struct WeakConnector(Weak<ConnectorInner>);

impl WeakConnector {
    pub fn upgrade(&self) -> Option<MessageConnector> {
        self.0.upgrade().map(|inner| MessageConnector { inner })
    }
}

impl MessageConnector {
    /// Declare the connector's own queue and start consuming it.
    pub fn new(context: BusContext) -> BusResult<Self> {
        let own_queue = context
            .connection
            .queue_declare(None, &topology::own_queue_options())?;

        let inner = Arc::new_cyclic(|me| ConnectorInner {
            me: me.clone(),
            context,
            own_queue,
            own_consumer: Mutex::new(None),
            requests: CorrelationTable::new(),
            handlers: HandlerRegistry::default(),
            services: DashMap::new(),
            channel: Mutex::new(None),
            status: ArcSwap::from_pointee(ConnectionStatus::initializing()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        let tag = inner.context.connection.basic_consume(
            &inner.own_queue,
            AckMode::Auto,
            Arc::new(move |delivery| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_frame(delivery);
                }
            }),
        )?;
        *inner.own_consumer.lock().recover_poison("MessageConnector::new") = Some(tag);

        log::debug!(target: LOG_TARGET, "Connector created with queue {}", inner.own_queue);
        Ok(Self { inner })
    }

    pub(crate) fn downgrade(&self) -> WeakConnector {
        WeakConnector(Arc::downgrade(&self.inner))
    }

    /// Name of the connector's own queue; also its origin tag on messages.
    pub fn own_queue(&self) -> &str {
        &self.inner.own_queue
    }

    pub fn settings(&self) -> &BusSettings {
        &self.inner.context.settings
    }

    /// The user channel the connector is on, if any.
    pub fn channel(&self) -> Option<String> {
        self.inner.current_user()
    }

    pub fn status(&self) -> ConnectionStatus {
        (**self.inner.status.load()).clone()
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count()
    }

    /// Join `user`'s channel, blocking until the broker confirmed the
    /// topology.
    ///
    /// Joining the channel the connector is already on does nothing. Joining
    /// a different one requires leaving the current channel first.
    pub fn connect_to_channel_sync(&self, user: &str) -> BusResult<()> {
        let inner = &self.inner;
        if inner.status.load().kind() == StatusKind::Closed {
            return Err(BusError::Closed);
        }

        let mut channel = inner.lock_channel("connect_to_channel_sync");
        if let Some(current) = channel.as_ref() {
            if current.user == user {
                return Ok(());
            }
            return Err(BusError::config(format!(
                "already on channel '{}', leave it before joining '{}'",
                current.user, user
            )));
        }

        let mut state = ChannelState {
            user: user.to_string(),
            services_consumer: None,
        };
        if let Err(e) = inner.join(&mut state) {
            log::warn!(target: LOG_TARGET, "Failed to join channel {}: {}", user, e);
            inner.leave(&state);
            inner.status.rcu(|status| status.error(e.clone()));
            return Err(e);
        }
        *channel = Some(state);
        drop(channel);

        inner.status.rcu(|status| status.connect());
        log::info!(target: LOG_TARGET, "Joined channel {}", user);
        inner.notify_listeners(|listener| listener.on_connected(user));
        Ok(())
    }

    /// Leave `user`'s channel.
    ///
    /// The connector stops receiving requests immediately; the own queue is
    /// unbound in the background and the returned promise resolves once that
    /// is done. Leaving a channel the connector is not on resolves at once.
    pub fn disconnect_from_channel(&self, user: &str) -> Promise<()> {
        let inner = &self.inner;
        let state = {
            let mut channel = inner.lock_channel("disconnect_from_channel");
            match channel.as_ref() {
                Some(current) if current.user == user => channel.take(),
                _ => None,
            }
        };
        let Some(state) = state else {
            log::debug!(target: LOG_TARGET, "Not on channel {}, nothing to leave", user);
            return Promise::resolve(());
        };

        if let Some(tag) = &state.services_consumer {
            if let Err(e) = inner.context.connection.basic_cancel(tag) {
                log::warn!(target: LOG_TARGET, "Failed to stop serving {}: {}", user, e);
            }
        }
        inner.status.rcu(|status| status.reconnect());

        let done = Promise::new();
        let spawned = {
            let me = inner.me.clone();
            let done = done.clone();
            let user = user.to_string();
            std::thread::Builder::new()
                .name("devbus-disconnect".to_string())
                .spawn(move || finish_disconnect(&me, &user, &done))
        };
        if let Err(e) = spawned {
            log::debug!(target: LOG_TARGET, "Unbinding inline, no thread available: {}", e);
            finish_disconnect(&inner.me, user, &done);
        }

        log::info!(target: LOG_TARGET, "Left channel {}", user);
        inner.notify_listeners(|listener| listener.on_disconnected(&state.user));
        done
    }

    /// Host `service`.
    ///
    /// Fails with [`BusError::DuplicateService`] if a service of the same
    /// name is registered. When on a channel, the service is bound right
    /// away; a failed bind leaves it unregistered.
    pub fn add_service(&self, service: Arc<dyn Service>) -> BusResult<()> {
        let inner = &self.inner;
        let name = service.name().to_string();
        let mut channel = inner.lock_channel("add_service");

        match inner.services.entry(name.clone()) {
            Entry::Occupied(_) => return Err(BusError::DuplicateService { name }),
            Entry::Vacant(entry) => {
                entry.insert(service);
            }
        }

        if let Some(state) = channel.as_mut() {
            if let Err(e) = inner.attach_service(state, &name) {
                inner.services.remove(&name);
                log::warn!(target: LOG_TARGET, "Failed to bind service {}: {}", name, e);
                return Err(e);
            }
        }
        log::debug!(target: LOG_TARGET, "Registered service {}", name);
        Ok(())
    }

    /// Subscribe `handler` to broadcasts on `topic`.
    pub fn on<H: EventHandler + 'static>(&self, topic: &Topic, handler: H) -> HandlerId {
        self.inner.handlers.add(topic.name(), Arc::new(handler))
    }

    /// Subscribe `handler` to replies to broadcasts on `topic`.
    pub fn reply_on<H: EventHandler + 'static>(
        &self,
        topic: &Topic,
        handler: H,
    ) -> BusResult<HandlerId> {
        let response = topic.response_name().ok_or_else(|| {
            BusError::config(format!("topic '{}' declares no response topic", topic))
        })?;
        Ok(self.inner.handlers.add(response, Arc::new(handler)))
    }

    /// Unsubscribe a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(id)
    }

    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner
            .listeners
            .lock()
            .recover_poison("add_channel_listener")
            .push((id, listener));
        id
    }

    pub fn remove_channel_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .recover_poison("remove_channel_listener");
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Broadcast `message` on `topic`.
    ///
    /// If the topic declares a response topic, receivers get what they need
    /// to answer through [`reply_to_event`](Self::reply_to_event).
    pub fn notify(&self, topic: &Topic, message: Vec<u8>) -> Promise<()> {
        let inner = &self.inner;
        let Some(user) = inner.current_user() else {
            return Promise::reject(BusError::NotConnected);
        };

        let mut properties = MessageProperties::default().with_app_id(inner.own_queue.clone());
        if let Some(response) = topic.response_name() {
            properties = properties
                .with_correlation_id(response)
                .with_reply_to(inner.own_queue.clone());
        }
        match inner.context.connection.basic_publish(
            &topology::topic_exchange(&user),
            topic.name(),
            properties,
            message,
        ) {
            Ok(()) => Promise::resolve(()),
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Failed to broadcast on {}: {}", topic, e);
                Promise::reject(e)
            }
        }
    }

    /// Call `method` and get a promise for its response body.
    ///
    /// There is no built-in timeout; combine with
    /// [`Promise::blocking_get`] or an async timeout around
    /// [`Promise::wait`].
    pub fn request(&self, method: &ServiceMethod, message: Vec<u8>) -> Promise<Vec<u8>> {
        let inner = &self.inner;
        let Some(user) = inner.current_user() else {
            return Promise::reject(BusError::NotConnected);
        };

        let promise = Promise::new();
        let id = inner.requests.add(promise.clone());
        let properties = MessageProperties::default()
            .with_kind(method.method())
            .with_correlation_id(id.to_string())
            .with_reply_to(inner.own_queue.clone())
            .with_app_id(inner.own_queue.clone());

        log::trace!(target: LOG_TARGET, "Request {} to {}", id, method);
        if let Err(e) = inner.context.connection.basic_publish(
            &command_exchange(&user),
            method.service(),
            properties,
            message,
        ) {
            log::warn!(target: LOG_TARGET, "Failed to send request {} to {}: {}", id, method, e);
            inner.requests.failed_to_send(id);
        }
        promise
    }

    /// Answer a broadcast that expects a response.
    ///
    /// `reply_to` and `correlation_id` are the values handed to the event
    /// handler. Failures are logged; there is nobody to report them to.
    pub fn reply_to_event(&self, reply_to: &str, correlation_id: &str, message: Vec<u8>) {
        let inner = &self.inner;
        let Some(user) = inner.current_user() else {
            log::warn!(
                target: LOG_TARGET,
                "Not on a channel, dropping reply to {}",
                correlation_id
            );
            return;
        };
        let properties = MessageProperties::default()
            .with_kind(EVENT_RESPONSE_TYPE)
            .with_correlation_id(correlation_id)
            .with_app_id(inner.own_queue.clone());
        if let Err(e) = inner.context.connection.basic_publish(
            &command_exchange(&user),
            reply_to,
            properties,
            message,
        ) {
            log::warn!(
                target: LOG_TARGET,
                "Failed to reply to {} on {}: {}",
                correlation_id,
                reply_to,
                e
            );
        }
    }

    /// Shut the connector down, waiting at most `timeout` for the broker.
    ///
    /// Pending requests are rejected with [`BusError::Closed`]. Errors are
    /// logged, never returned.
    pub fn close(&self, timeout: Duration) {
        let inner = &self.inner;
        if inner.status.load().kind() == StatusKind::Closed {
            return;
        }

        inner.requests.fail_all(BusError::Closed);

        let left = inner.lock_channel("close").take();
        if let Some(state) = &left {
            inner.leave(state);
        }
        if let Some(tag) = inner.own_consumer.lock().recover_poison("close").take() {
            if let Err(e) = inner.context.connection.basic_cancel(&tag) {
                log::debug!(target: LOG_TARGET, "Failed to cancel own consumer: {}", e);
            }
        }
        if let Err(e) = inner.context.connection.close(timeout) {
            log::error!(target: LOG_TARGET, "Failed to close broker connection: {}", e);
            inner.status.rcu(|status| status.error(e.clone()));
        }
        inner.status.rcu(|status| status.close());
        log::info!(target: LOG_TARGET, "Connector {} closed", inner.own_queue);

        if let Some(state) = left {
            inner.notify_listeners(|listener| listener.on_disconnected(&state.user));
        }
    }
}

impl ConnectorInner {
    fn lock_channel(&self, context: &str) -> MutexGuard<'_, Option<ChannelState>> {
        self.channel.lock().recover_poison(context)
    }

    fn current_user(&self) -> Option<String> {
        self.lock_channel("current_user")
            .as_ref()
            .map(|state| state.user.clone())
    }

    fn notify_listeners(&self, notify: impl Fn(&dyn ChannelListener)) {
        let listeners: Vec<Arc<dyn ChannelListener>> = self
            .listeners
            .lock()
            .recover_poison("notify_listeners")
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            notify(listener.as_ref());
        }
    }

    /// Declare the channel topology and start serving registered services.
    fn join(&self, state: &mut ChannelState) -> BusResult<()> {
        let connection = self.context.connection.as_ref();
        topology::declare_user_exchanges(connection, &state.user)?;
        topology::bind_own_queue(connection, &self.own_queue, &state.user)?;

        let names: Vec<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.attach_service(state, &name)?;
        }
        Ok(())
    }

    /// Best-effort undo of [`join`](Self::join).
    fn leave(&self, state: &ChannelState) {
        let connection = self.context.connection.as_ref();
        if let Some(tag) = &state.services_consumer {
            if let Err(e) = connection.basic_cancel(tag) {
                log::debug!(target: LOG_TARGET, "Failed to cancel services consumer: {}", e);
            }
        }
        if let Err(e) = topology::unbind_own_queue(connection, &self.own_queue, &state.user) {
            log::debug!(target: LOG_TARGET, "Failed to unbind own queue: {}", e);
        }
    }

    fn unbind_unless_rejoined(&self, user: &str) -> BusResult<()> {
        let channel = self.lock_channel("unbind_unless_rejoined");
        if channel.as_ref().is_some_and(|state| state.user == user) {
            log::debug!(target: LOG_TARGET, "Channel {} joined again, keeping bindings", user);
            return Ok(());
        }
        topology::unbind_own_queue(self.context.connection.as_ref(), &self.own_queue, user)
    }

    /// Route requests for service `name` on the channel to this connector.
    fn attach_service(&self, state: &mut ChannelState, name: &str) -> BusResult<()> {
        let connection = self.context.connection.as_ref();
        let queue = topology::services_queue(&self.context.settings, &state.user);
        if state.services_consumer.is_none() {
            let options = topology::services_queue_options(&self.context.settings, &state.user);
            connection.queue_declare(Some(&queue), &options)?;

            let me = self.me.clone();
            let user = state.user.clone();
            let tag = connection.basic_consume(
                &queue,
                AckMode::Manual,
                Arc::new(move |delivery| {
                    if let Some(inner) = me.upgrade() {
                        inner.on_request(delivery, &user);
                    }
                }),
            )?;
            state.services_consumer = Some(tag);
        }
        connection.queue_bind(&queue, &command_exchange(&state.user), name)
    }

    /// Handle a delivery on the own queue.
    fn on_frame(&self, delivery: Delivery) {
        match inbound::classify_frame(&delivery, &self.own_queue) {
            Frame::EventResponse { topic } => {
                self.handlers.dispatch(topic, &delivery.body, None, None);
            }
            Frame::StrayEventResponse => {
                log::warn!(
                    target: LOG_TARGET,
                    "Broadcast reply from {:?} names no response topic, dropping",
                    delivery.properties.app_id
                );
            }
            Frame::Event {
                topic,
                reply_to,
                correlation_id,
            } => {
                self.handlers
                    .dispatch(topic, &delivery.body, reply_to, correlation_id);
            }
            Frame::OwnEvent => {
                log::trace!(
                    target: LOG_TARGET,
                    "Suppressed own broadcast on {}",
                    delivery.routing_key
                );
            }
            Frame::Response { id: None } => {
                log::warn!(
                    target: LOG_TARGET,
                    "Response with unusable correlation id {:?}, dropping",
                    delivery.properties.correlation_id
                );
            }
            Frame::Response { id: Some(id) } => {
                if let Some(promise) = self.requests.get_promise_and_remove(id) {
                    match inbound::response_error(&delivery) {
                        Some(error) => promise.set_error(error),
                        None => promise.set_result(delivery.body.clone()),
                    };
                }
            }
        }
    }

    /// Handle a delivery on the services queue.
    fn on_request(&self, delivery: Delivery, user: &str) {
        let target = ReplyTarget {
            connection: self.context.connection.clone(),
            exchange: command_exchange(user),
            reply_to: delivery.properties.reply_to.clone(),
            correlation_id: delivery.properties.correlation_id.clone(),
            own_queue: self.own_queue.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };

        match inbound::classify_request(&delivery, &self.own_queue) {
            Request::DeadLettered => {
                log::debug!(
                    target: LOG_TARGET,
                    "Request {:?} for {} was dead-lettered",
                    target.correlation_id,
                    delivery.routing_key
                );
                target.send_error(INTERNAL_ERROR, UNDELIVERABLE_MESSAGE);
            }
            Request::OwnRequest { requeue } => {
                log::trace!(
                    target: LOG_TARGET,
                    "Handing own request {:?} back (requeue: {})",
                    target.correlation_id,
                    requeue
                );
                if let Err(e) = self
                    .context
                    .connection
                    .basic_reject(delivery.delivery_tag, requeue)
                {
                    log::warn!(target: LOG_TARGET, "Failed to reject own request: {}", e);
                }
            }
            Request::Dispatch { service, method } => {
                let Some(handler) = self.services.get(service).map(|entry| entry.value().clone())
                else {
                    target.send_error(METHOD_NOT_FOUND, &format!("no service '{}'", service));
                    return;
                };

                let state = ReplyState::new(target);
                let sink = Box::new(ReplySink::new(state.clone()));
                let outcome = match catch_unwind(AssertUnwindSafe(|| {
                    handler.reply(method, &delivery.body, sink)
                })) {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        log::debug!(target: LOG_TARGET, "Service {} failed: {}", service, e);
                        Err(e.to_string())
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        log::error!(target: LOG_TARGET, "Service {} panicked: {}", service, message);
                        Err(message)
                    }
                };
                state.finish_dispatch(outcome);
            }
        }
    }
}

/// Unbind a left channel's queue bindings and settle `done`.
fn finish_disconnect(me: &Weak<ConnectorInner>, user: &str, done: &Promise<()>) {
    let Some(inner) = me.upgrade() else {
        done.set_result(());
        return;
    };
    match inner.unbind_unless_rejoined(user) {
        Ok(()) => {
            done.set_result(());
        }
        Err(e) => {
            log::warn!(target: LOG_TARGET, "Failed to unbind from channel {}: {}", user, e);
            done.set_error(e);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "service panicked".to_string()
    }
}

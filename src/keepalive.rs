//! Liveness watchdog for a connector.
//!
//! A [`KeepAliveConnector`] periodically broadcasts a "service required"
//! probe on the connector's channel and expects a reply within a short
//! timeout. Without a reply the process is terminated: a process whose
//! peers are gone must not keep running unnoticed.
//!
//! # Timers
//!
//! ```text
//! probe timer fires ──► arm shutdown timer ──► broadcast probe
//!                              │
//!          reply arrives ──────┼──► cancel shutdown, arm probe timer
//!                              │
//!          timeout ────────────┴──► terminate (once)
//!
//! channel joined / left ──► cancel both, arm probe timer
//! ```
//!
//! Both timers live behind one lock so cancel-then-arm pairs never
//! interleave with a firing timer. Each armed timer carries a generation;
//! a timer that fires after being replaced is ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::config::KeepAliveSettings;
use crate::connector::{HandlerId, ListenerId, MessageConnector, WeakConnector};
use crate::descriptors::Topic;
use crate::error::{BusError, BusResult, LockResultExt};
use crate::handler::ChannelListener;

const LOG_TARGET: &str = "devbus::keepalive";

/// Name of the liveness probe topic.
pub const SERVICE_REQUIRED_TOPIC: &str = "serviceRequired";

/// The probe topic; replies arrive on `serviceRequired.response`.
pub fn service_required_topic() -> Topic {
    Topic::with_response(SERVICE_REQUIRED_TOPIC)
}

/// Probe payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequired {
    /// Channel the prober is on.
    pub user: Option<String>,
    pub service_type: String,
}

/// Reply payload. Replies without a service type confirm any probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAvailable {
    pub service_type: Option<String>,
}

/// Action run when a probe goes unanswered.
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Probe,
    Shutdown,
}

struct ArmedTimer {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Timers {
    probe: Option<ArmedTimer>,
    shutdown: Option<ArmedTimer>,
    next_generation: u64,
    /// Set by `dispose`; nothing is armed afterwards.
    disposed: bool,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::Probe => &mut self.probe,
            TimerKind::Shutdown => &mut self.shutdown,
        }
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.slot(kind).take() {
            timer.cancel.cancel();
        }
    }
}

struct KeepAliveInner {
    me: Weak<KeepAliveInner>,
    connector: MessageConnector,
    settings: KeepAliveSettings,
    scheduler: tokio::runtime::Handle,
    timers: Mutex<Timers>,
    terminator: Terminator,
    terminated: AtomicBool,
}

impl KeepAliveInner {
    fn lock_timers(&self, context: &str) -> MutexGuard<'_, Timers> {
        self.timers.lock().recover_poison(context)
    }

    /// Arm `kind`, replacing any timer of that kind. Caller holds the lock.
    fn arm(&self, timers: &mut Timers, kind: TimerKind, delay: Duration) {
        if timers.disposed {
            return;
        }
        timers.cancel(kind);
        timers.next_generation += 1;
        let generation = timers.next_generation;
        let cancel = CancellationToken::new();

        let cancelled = cancel.clone();
        let me = self.me.clone();
        self.scheduler.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = me.upgrade() {
                        inner.fire(kind, generation);
                    }
                }
            }
        });
        *timers.slot(kind) = Some(ArmedTimer { generation, cancel });
    }

    fn fire(&self, kind: TimerKind, generation: u64) {
        {
            let mut timers = self.lock_timers("KeepAlive::fire");
            let current = timers.slot(kind).as_ref().map(|timer| timer.generation);
            if current != Some(generation) {
                log::trace!(target: LOG_TARGET, "Ignoring superseded {:?} timer", kind);
                return;
            }
            *timers.slot(kind) = None;

            if kind == TimerKind::Probe {
                timers.cancel(TimerKind::Shutdown);
                self.arm(&mut timers, TimerKind::Shutdown, self.settings.response_timeout());
            }
        }

        match kind {
            TimerKind::Probe => self.send_probe(),
            TimerKind::Shutdown => self.terminate(),
        }
    }

    fn send_probe(&self) {
        let probe = ServiceRequired {
            user: self.connector.channel(),
            service_type: self.settings.service_type.clone(),
        };
        let body = match serde_json::to_vec(&probe) {
            Ok(body) => body,
            Err(e) => {
                log::error!(target: LOG_TARGET, "Failed to encode probe: {}", e);
                return;
            }
        };
        log::debug!(target: LOG_TARGET, "Probing channel {:?}", probe.user);
        self.connector
            .notify(&service_required_topic(), body)
            .rejected(|e| {
                log::warn!(target: LOG_TARGET, "Probe could not be sent: {}", e);
            });
    }

    fn on_reply(&self, message: &[u8]) {
        let reply = match serde_json::from_slice::<ServiceAvailable>(message) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Ignoring malformed liveness reply: {}", e);
                return;
            }
        };
        if let Some(service_type) = reply.service_type {
            if service_type != self.settings.service_type {
                log::trace!(
                    target: LOG_TARGET,
                    "Ignoring liveness reply for {}",
                    service_type
                );
                return;
            }
        }

        let mut timers = self.lock_timers("KeepAlive::on_reply");
        if timers.shutdown.is_none() {
            log::trace!(target: LOG_TARGET, "Liveness reply without pending probe");
            return;
        }
        timers.cancel(TimerKind::Shutdown);
        self.arm(&mut timers, TimerKind::Probe, self.settings.probe_interval());
        log::debug!(target: LOG_TARGET, "Liveness confirmed");
    }

    fn reset(&self) {
        let mut timers = self.lock_timers("KeepAlive::reset");
        timers.cancel(TimerKind::Shutdown);
        self.arm(&mut timers, TimerKind::Probe, self.settings.probe_interval());
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!(
            target: LOG_TARGET,
            "No {} service answered within {:?}, terminating",
            self.settings.service_type,
            self.settings.response_timeout()
        );
        (self.terminator)();
    }
}

/// Resets the liveness clock on every channel transition.
struct ChannelReset(Weak<KeepAliveInner>);

impl ChannelListener for ChannelReset {
    fn on_connected(&self, channel: &str) {
        if let Some(inner) = self.0.upgrade() {
            log::debug!(target: LOG_TARGET, "Joined {}, restarting liveness clock", channel);
            inner.reset();
        }
    }

    fn on_disconnected(&self, channel: &str) {
        if let Some(inner) = self.0.upgrade() {
            log::debug!(target: LOG_TARGET, "Left {}, restarting liveness clock", channel);
            inner.reset();
        }
    }
}

struct Registrations {
    listener: ListenerId,
    handler: HandlerId,
    scheduler: Runtime,
}

/// Terminates the process when no peer answers liveness probes.
pub struct KeepAliveConnector {
    inner: Arc<KeepAliveInner>,
    registrations: Mutex<Option<Registrations>>,
}

impl KeepAliveConnector {
    /// Watch `connector`, exiting the process with status 1 on timeout.
    pub fn new(connector: MessageConnector, settings: KeepAliveSettings) -> BusResult<Self> {
        Self::with_terminator(connector, settings, || std::process::exit(1))
    }

    /// Watch `connector`, running `terminator` on timeout.
    pub fn with_terminator(
        connector: MessageConnector,
        settings: KeepAliveSettings,
        terminator: impl Fn() + Send + Sync + 'static,
    ) -> BusResult<Self> {
        let scheduler = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("devbus-keepalive")
            .enable_time()
            .build()
            .map_err(|e| BusError::internal(format!("failed to start keep-alive scheduler: {}", e)))?;

        let inner = Arc::new_cyclic(|me| KeepAliveInner {
            me: me.clone(),
            connector: connector.clone(),
            settings,
            scheduler: scheduler.handle().clone(),
            timers: Mutex::new(Timers::default()),
            terminator: Arc::new(terminator),
            terminated: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let handler = connector.reply_on(
            &service_required_topic(),
            move |message: &[u8], _: Option<&str>, _: Option<&str>| -> BusResult<()> {
                if let Some(inner) = weak.upgrade() {
                    inner.on_reply(message);
                }
                Ok(())
            },
        )?;
        let listener = connector.add_channel_listener(Arc::new(ChannelReset(Arc::downgrade(&inner))));

        {
            let mut timers = inner.lock_timers("KeepAliveConnector::new");
            inner.arm(&mut timers, TimerKind::Probe, inner.settings.probe_interval());
        }
        log::debug!(
            target: LOG_TARGET,
            "Keep-alive armed: probe every {:?}, timeout {:?}",
            inner.settings.probe_interval(),
            inner.settings.response_timeout()
        );

        Ok(Self {
            inner,
            registrations: Mutex::new(Some(Registrations {
                listener,
                handler,
                scheduler,
            })),
        })
    }

    /// Whether the terminator has run.
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Stop watching. Safe to call more than once and from any thread.
    pub fn dispose(&self) {
        let Some(registrations) = self
            .registrations
            .lock()
            .recover_poison("KeepAliveConnector::dispose")
            .take()
        else {
            return;
        };

        self.inner.connector.remove_channel_listener(registrations.listener);
        self.inner.connector.off(registrations.handler);
        {
            let mut timers = self.inner.lock_timers("KeepAliveConnector::dispose");
            timers.disposed = true;
            timers.cancel(TimerKind::Probe);
            timers.cancel(TimerKind::Shutdown);
        }
        registrations.scheduler.shutdown_background();
        log::debug!(target: LOG_TARGET, "Keep-alive disposed");
    }
}

impl Drop for KeepAliveConnector {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Answers liveness probes for one service type on a connector.
pub struct ServiceRequiredResponder {
    connector: WeakConnector,
    handler: Option<HandlerId>,
}

impl ServiceRequiredResponder {
    pub fn register(connector: &MessageConnector, service_type: impl Into<String>) -> Self {
        let service_type = service_type.into();
        let weak = connector.downgrade();
        let handler = connector.on(
            &service_required_topic(),
            move |message: &[u8],
                  reply_to: Option<&str>,
                  correlation_id: Option<&str>|
                  -> BusResult<()> {
                let probe: ServiceRequired = serde_json::from_slice(message)
                    .map_err(|e| BusError::internal(format!("malformed probe: {}", e)))?;
                if probe.service_type != service_type {
                    return Ok(());
                }
                let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) else {
                    log::debug!(target: LOG_TARGET, "Probe without reply address, ignoring");
                    return Ok(());
                };
                let Some(connector) = weak.upgrade() else {
                    return Ok(());
                };
                let reply = ServiceAvailable {
                    service_type: Some(service_type.clone()),
                };
                let body = serde_json::to_vec(&reply)
                    .map_err(|e| BusError::internal(format!("failed to encode reply: {}", e)))?;
                connector.reply_to_event(reply_to, correlation_id, body);
                Ok(())
            },
        );
        Self {
            connector: connector.downgrade(),
            handler: Some(handler),
        }
    }

    /// Stop answering probes.
    pub fn unregister(&mut self) {
        if let (Some(handler), Some(connector)) = (self.handler.take(), self.connector.upgrade()) {
            connector.off(handler);
        }
    }
}

impl Drop for ServiceRequiredResponder {
    fn drop(&mut self) {
        self.unregister();
    }
}

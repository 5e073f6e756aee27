//! Single-assignment promise with chainable continuations.
//!
//! Every asynchronous bus operation (`notify`, `request`, channel disconnect)
//! hands back a [`Promise`]. A promise starts pending and is settled exactly
//! once, either with a value or with a [`BusError`]. Later attempts to settle
//! it are silent no-ops.
//!
//! # Continuations
//!
//! `done` and `rejected` register callbacks. Callbacks registered while the
//! promise is pending are stored and fired exactly once on settlement, then
//! released. Callbacks registered after settlement fire synchronously inside
//! the registering call.
//!
//! A callback may carry an [`Obsolescent`] capability. If that capability
//! reports obsolete at delivery time, the callback is skipped. Skipping does
//! not affect the promise state or any other callback.
//!
//! # Unhandled rejections
//!
//! A promise rejected while no `rejected` callback is registered logs the
//! error, unless the error was already communicated by the remote peer
//! (see [`BusError::is_communicated`]).

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{BusError, BusResult, LockResultExt};

/// Logging target for promise diagnostics.
const LOG_TARGET: &str = "devbus::promise";

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// Cooperative cancel signal a continuation may carry.
///
/// Checked right before the continuation would run; an obsolete continuation
/// is dropped without being invoked.
pub trait Obsolescent: Send + Sync {
    fn is_obsolete(&self) -> bool;
}

/// Shareable flag implementing [`Obsolescent`].
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct ObsolescenceToken(Arc<AtomicBool>);

impl ObsolescenceToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every continuation guarded by this token as obsolete.
    pub fn mark_obsolete(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Obsolescent for ObsolescenceToken {
    fn is_obsolete(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Continuation<A> {
    callback: Box<dyn FnOnce(A) + Send>,
    obsolescence: Option<Arc<dyn Obsolescent>>,
}

impl<A> Continuation<A> {
    fn new(callback: impl FnOnce(A) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            obsolescence: None,
        }
    }

    fn guarded(
        obsolescence: Arc<dyn Obsolescent>,
        callback: impl FnOnce(A) + Send + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
            obsolescence: Some(obsolescence),
        }
    }

    fn run(self, arg: A) {
        if self
            .obsolescence
            .as_ref()
            .is_some_and(|obsolescence| obsolescence.is_obsolete())
        {
            log::trace!(target: LOG_TARGET, "Skipping obsolete continuation");
            return;
        }
        let callback = self.callback;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(arg))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!(target: LOG_TARGET, "Promise continuation panicked: {}", message);
        }
    }
}

/// Stored continuations for one outcome.
///
/// The first registration is kept as is; the second merges both into a
/// compound list that later registrations append to.
enum Continuations<A> {
    Empty,
    Single(Continuation<A>),
    Compound(Vec<Continuation<A>>),
}

impl<A> Default for Continuations<A> {
    fn default() -> Self {
        Continuations::Empty
    }
}

impl<A> Continuations<A> {
    fn push(&mut self, continuation: Continuation<A>) {
        *self = match std::mem::take(self) {
            Continuations::Empty => Continuations::Single(continuation),
            Continuations::Single(first) => Continuations::Compound(vec![first, continuation]),
            Continuations::Compound(mut list) => {
                list.push(continuation);
                Continuations::Compound(list)
            }
        };
    }

    fn is_empty(&self) -> bool {
        matches!(self, Continuations::Empty)
    }

    fn into_vec(self) -> Vec<Continuation<A>> {
        match self {
            Continuations::Empty => Vec::new(),
            Continuations::Single(one) => vec![one],
            Continuations::Compound(list) => list,
        }
    }
}

enum Slot<T> {
    Pending,
    Fulfilled(T),
    Rejected(BusError),
}

struct Inner<T> {
    slot: Slot<T>,
    done: Continuations<T>,
    rejected: Continuations<BusError>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Signalled on settlement for `blocking_get` waiters.
    settled: Condvar,
}

/// Single-assignment future with chainable continuations.
///
/// Cloning a `Promise` yields another handle to the same promise.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create a pending promise.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slot: Slot::Pending,
                    done: Continuations::Empty,
                    rejected: Continuations::Empty,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// Create an already fulfilled promise.
    pub fn resolve(value: T) -> Self {
        let promise = Self::new();
        promise.set_result(value);
        promise
    }

    /// Create an already rejected promise.
    ///
    /// The rejection is not logged: whoever builds a rejected promise hands the
    /// error to its caller.
    pub fn reject(error: BusError) -> Self {
        let promise = Self::new();
        promise.lock("Promise::reject").slot = Slot::Rejected(error);
        promise
    }

    fn lock(&self, context: &str) -> MutexGuard<'_, Inner<T>> {
        self.shared.inner.lock().recover_poison(context)
    }

    pub fn state(&self) -> PromiseState {
        match self.lock("Promise::state").slot {
            Slot::Pending => PromiseState::Pending,
            Slot::Fulfilled(_) => PromiseState::Fulfilled,
            Slot::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// The value, if the promise is fulfilled.
    pub fn result(&self) -> Option<T> {
        match &self.lock("Promise::result").slot {
            Slot::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The error, if the promise is rejected.
    pub fn error(&self) -> Option<BusError> {
        match &self.lock("Promise::error").slot {
            Slot::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Fulfil the promise. Returns `false` if it was already settled.
    pub fn set_result(&self, value: T) -> bool {
        let callbacks = {
            let mut inner = self.lock("Promise::set_result");
            if !matches!(inner.slot, Slot::Pending) {
                return false;
            }
            inner.slot = Slot::Fulfilled(value.clone());
            inner.rejected = Continuations::Empty;
            std::mem::take(&mut inner.done)
        };
        self.shared.settled.notify_all();

        for callback in callbacks.into_vec() {
            callback.run(value.clone());
        }
        true
    }

    /// Reject the promise. Returns `false` if it was already settled.
    pub fn set_error(&self, error: BusError) -> bool {
        let callbacks = {
            let mut inner = self.lock("Promise::set_error");
            if !matches!(inner.slot, Slot::Pending) {
                return false;
            }
            inner.slot = Slot::Rejected(error.clone());
            inner.done = Continuations::Empty;
            std::mem::take(&mut inner.rejected)
        };
        self.shared.settled.notify_all();

        if callbacks.is_empty() {
            if !error.is_communicated() {
                log::error!(target: LOG_TARGET, "Unhandled promise rejection: {}", error);
            }
            return true;
        }
        for callback in callbacks.into_vec() {
            callback.run(error.clone());
        }
        true
    }

    fn register_done(&self, continuation: Continuation<T>) {
        let mut inner = self.lock("Promise::done");
        let value = match &inner.slot {
            Slot::Pending => None,
            Slot::Fulfilled(value) => Some(value.clone()),
            Slot::Rejected(_) => return,
        };
        match value {
            None => inner.done.push(continuation),
            Some(value) => {
                drop(inner);
                continuation.run(value);
            }
        }
    }

    fn register_rejected(&self, continuation: Continuation<BusError>) {
        let mut inner = self.lock("Promise::rejected");
        let error = match &inner.slot {
            Slot::Pending => None,
            Slot::Rejected(error) => Some(error.clone()),
            Slot::Fulfilled(_) => return,
        };
        match error {
            None => inner.rejected.push(continuation),
            Some(error) => {
                drop(inner);
                continuation.run(error);
            }
        }
    }

    /// Run `f` with the value once the promise is fulfilled.
    pub fn done(&self, f: impl FnOnce(T) + Send + 'static) -> &Self {
        self.register_done(Continuation::new(f));
        self
    }

    /// Like [`Promise::done`], but `f` is skipped if `obsolescence` reports
    /// obsolete when the value arrives.
    pub fn done_unless_obsolete(
        &self,
        obsolescence: Arc<dyn Obsolescent>,
        f: impl FnOnce(T) + Send + 'static,
    ) -> &Self {
        self.register_done(Continuation::guarded(obsolescence, f));
        self
    }

    /// Run `f` with the error once the promise is rejected.
    pub fn rejected(&self, f: impl FnOnce(BusError) + Send + 'static) -> &Self {
        self.register_rejected(Continuation::new(f));
        self
    }

    /// Like [`Promise::rejected`], guarded by an obsolescence capability.
    pub fn rejected_unless_obsolete(
        &self,
        obsolescence: Arc<dyn Obsolescent>,
        f: impl FnOnce(BusError) + Send + 'static,
    ) -> &Self {
        self.register_rejected(Continuation::guarded(obsolescence, f));
        self
    }

    /// Run `f` on settlement with `Some(value)` or `None` on rejection.
    pub fn on_processed(&self, f: impl FnOnce(Option<T>) + Send + 'static) -> &Self {
        let slot = Arc::new(Mutex::new(Some(f)));
        let on_error = slot.clone();
        self.done(move |value| {
            if let Some(f) = slot.lock().recover_poison("Promise::on_processed").take() {
                f(Some(value));
            }
        });
        self.rejected(move |_| {
            if let Some(f) = on_error.lock().recover_poison("Promise::on_processed").take() {
                f(None);
            }
        });
        self
    }

    /// Derive a promise fed by `f(value)`.
    ///
    /// Errors propagate unchanged. If this promise is already settled, the
    /// returned promise is settled before `then` returns.
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let child = Promise::new();
        let on_done = child.clone();
        let on_error = child.clone();
        self.done(move |value| {
            on_done.set_result(f(value));
        });
        self.rejected(move |error| {
            on_error.set_error(error);
        });
        child
    }

    /// Derive a promise settled by the promise `f(value)` returns.
    pub fn then_async<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let child = Promise::new();
        let on_done = child.clone();
        let on_error = child.clone();
        self.done(move |value| {
            f(value).notify(&on_done);
        });
        self.rejected(move |error| {
            on_error.set_error(error);
        });
        child
    }

    /// Propagate this promise's outcome into an existing promise.
    pub fn notify(&self, child: &Promise<T>) -> &Self {
        let on_done = child.clone();
        let on_error = child.clone();
        self.done(move |value| {
            on_done.set_result(value);
        });
        self.rejected(move |error| {
            on_error.set_error(error);
        });
        self
    }

    /// Resolve `signal` once this promise settles, whatever the outcome.
    pub fn processed(&self, signal: &Promise<()>) -> &Self {
        let signal = signal.clone();
        self.on_processed(move |_| {
            signal.set_result(());
        })
    }

    /// Wait for settlement from async code.
    ///
    /// Continuations are registered immediately, so the returned future may
    /// be polled from any task.
    pub fn wait(&self) -> impl Future<Output = BusResult<T>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(tx)));
        let on_error = sender.clone();
        self.done(move |value| {
            if let Some(tx) = sender.lock().recover_poison("Promise::wait").take() {
                let _ = tx.send(Ok(value));
            }
        });
        self.rejected(move |error| {
            if let Some(tx) = on_error.lock().recover_poison("Promise::wait").take() {
                let _ = tx.send(Err(error));
            }
        });
        async move {
            rx.await
                .unwrap_or_else(|_| Err(BusError::internal("promise dropped before settling")))
        }
    }

    /// Block the calling thread until the promise settles or `timeout` passes.
    pub fn blocking_get(&self, timeout: Duration) -> BusResult<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock("Promise::blocking_get");
        loop {
            match &inner.slot {
                Slot::Fulfilled(value) => return Ok(value.clone()),
                Slot::Rejected(error) => return Err(error.clone()),
                Slot::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::Timeout(timeout));
            }
            let (guard, _) = self
                .shared
                .settled
                .wait_timeout(inner, deadline - now)
                .recover_poison("Promise::blocking_get");
            inner = guard;
        }
    }

    /// Combine promises into one fulfilled with every value, in input order.
    ///
    /// The first rejection rejects the combined promise; later outcomes are
    /// ignored.
    pub fn all(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        let combined = Promise::new();
        let total = promises.len();
        if total == 0 {
            combined.set_result(Vec::new());
            return combined;
        }

        let collected: Arc<Mutex<(Vec<Option<T>>, usize)>> =
            Arc::new(Mutex::new((vec![None; total], 0)));
        for (index, promise) in promises.iter().enumerate() {
            let collected = collected.clone();
            let on_done = combined.clone();
            promise.done(move |value| {
                let finished = {
                    let mut guard = collected.lock().recover_poison("Promise::all");
                    guard.0[index] = Some(value);
                    guard.1 += 1;
                    (guard.1 == total).then(|| std::mem::take(&mut guard.0))
                };
                if let Some(values) = finished {
                    on_done.set_result(values.into_iter().flatten().collect());
                }
            });
            let on_error = combined.clone();
            promise.rejected(move |error| {
                on_error.set_error(error);
            });
        }
        combined
    }
}

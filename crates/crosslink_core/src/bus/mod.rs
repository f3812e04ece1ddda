//! # Typed Event Bus
//!
//! Synchronous publish/subscribe between subsystems that never see each other.
//!
//! ## Architecture
//!
//! ```text
//! publish(event)
//!     │
//!     ▼
//! ┌──────────────┐   Drop { reason } ──> logged, nobody called
//! │  middleware  │──────────────────────────────────────────────
//! │  (in order)  │
//! └──────┬───────┘
//!        │ Continue(event)
//!        ▼
//!   EventEnvelope { kind, payload, created_at, sequence }
//!        │
//!        ▼  Arc clone of the subscriber list for `kind` (read lock, then released)
//! ┌──────────────┐
//! │ handler 1    │  called in subscription order,
//! │ handler 2    │  with NO bus lock held
//! │ handler N    │
//! └──────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Every subscriber present when the list is captured gets exactly one
//!   delivery, in registration order.
//! - Subscribers added during delivery miss the in-flight event; subscribers
//!   removed during delivery still get it.
//! - A handler may publish, subscribe or unsubscribe from inside its callback.
//! - Handler failures (errors or panics) never reach the publisher.
//! - A panicking middleware stage drops the event with a `panicked:` reason.

mod middleware;
mod publisher;

pub use middleware::{FilterMiddleware, FnMiddleware, Middleware, MiddlewareOutcome};
pub use publisher::AsyncPublisher;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::diagnostics::{status, AlertRecord, Diagnostics, LogLevel};
use crate::error::{panic_message, HandlerError, HandlerResult};
use crate::retry::RetryPolicy;

/// An event that can travel on the bus.
///
/// Events are a closed enum owned by the host; `Kind` is the fieldless
/// discriminant used for routing.
pub trait BusEvent: Clone + Send + Sync + 'static {
    /// Routing key.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The routing key of this event.
    fn kind(&self) -> Self::Kind;
}

/// An event as delivered to handlers. Immutable.
#[derive(Clone, Debug)]
pub struct EventEnvelope<E: BusEvent> {
    kind: E::Kind,
    payload: E,
    created_at: SystemTime,
    sequence: u64,
}

impl<E: BusEvent> EventEnvelope<E> {
    /// Routing key.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> E::Kind {
        self.kind
    }

    /// The event itself.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &E {
        &self.payload
    }

    /// When the envelope was sealed (after middleware).
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Bus-wide publish sequence number.
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Identifier of a single subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Shared handler type.
pub type Handler<E> = Arc<dyn Fn(&EventEnvelope<E>) -> HandlerResult + Send + Sync>;

/// One handler failure during a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Subscription whose handler failed.
    pub subscription: SubscriptionId,
    /// What went wrong.
    pub error: HandlerError,
}

/// Result of delivering one envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sequence number of the envelope.
    pub sequence: u64,
    /// Handlers invoked.
    pub delivered: usize,
    /// Handlers that failed.
    pub failures: Vec<HandlerFailure>,
}

impl DeliveryReport {
    /// Whether every handler succeeded.
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.subscription, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of a plain publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Middleware suppressed the event.
    Dropped {
        /// Reason given by the middleware.
        reason: String,
    },
    /// The event reached its subscribers (some may have failed).
    Delivered(DeliveryReport),
}

/// Result of a retrying publish. Never an error: see the module docs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// All handlers succeeded on attempt `attempts`.
    Delivered {
        /// Attempts used.
        attempts: u32,
        /// Handlers reached on the final attempt.
        receivers: usize,
    },
    /// Middleware suppressed the event.
    Dropped {
        /// Reason given by the middleware.
        reason: String,
    },
    /// Every attempt had at least one failing handler; an alert was raised.
    Exhausted {
        /// Attempts used.
        attempts: u32,
        /// Failures of the final attempt.
        last_error: String,
    },
}

impl DeliveryStatus {
    /// Whether all handlers eventually succeeded.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

// ============================================================================
// Subscriber table
// ============================================================================

struct SubscriberEntry<E: BusEvent> {
    id: SubscriptionId,
    handler: Handler<E>,
}

impl<E: BusEvent> Clone for SubscriberEntry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
        }
    }
}

type SubscriberList<E> = Arc<[SubscriberEntry<E>]>;

/// Copy-on-write subscriber lists, one per kind.
struct SubscriberTable<E: BusEvent> {
    lists: RwLock<HashMap<E::Kind, SubscriberList<E>>>,
}

impl<E: BusEvent> SubscriberTable<E> {
    fn new() -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, kind: E::Kind, entry: SubscriberEntry<E>) {
        let mut lists = self.lists.write();
        let mut next: Vec<SubscriberEntry<E>> = lists
            .get(&kind)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        next.push(entry);
        lists.insert(kind, next.into());
    }

    fn remove(&self, kind: E::Kind, id: SubscriptionId) -> bool {
        let mut lists = self.lists.write();
        let Some(current) = lists.get(&kind) else {
            return false;
        };
        if !current.iter().any(|e| e.id == id) {
            return false;
        }
        let next: Vec<SubscriberEntry<E>> =
            current.iter().filter(|e| e.id != id).cloned().collect();
        if next.is_empty() {
            lists.remove(&kind);
        } else {
            lists.insert(kind, next.into());
        }
        true
    }

    fn snapshot(&self, kind: E::Kind) -> Option<SubscriberList<E>> {
        self.lists.read().get(&kind).cloned()
    }

    fn count(&self, kind: E::Kind) -> usize {
        self.lists.read().get(&kind).map_or(0, |l| l.len())
    }
}

/// Subscription token. Dropping it unsubscribes.
///
/// Holds only a weak reference to the bus, so a token outliving the bus is
/// harmless.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<E: BusEvent> {
    id: SubscriptionId,
    kind: E::Kind,
    table: Weak<SubscriberTable<E>>,
    armed: bool,
}

impl<E: BusEvent> Subscription<E> {
    /// Identifier of this subscription.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Kind this subscription listens to.
    #[must_use]
    pub fn kind(&self) -> E::Kind {
        self.kind
    }

    /// Keeps the handler subscribed for the rest of the bus lifetime.
    pub fn detach(mut self) {
        self.armed = false;
    }

    fn release(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        self.armed = false;
        self.table
            .upgrade()
            .is_some_and(|table| table.remove(self.kind, self.id))
    }
}

impl<E: BusEvent> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<E: BusEvent> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("armed", &self.armed)
            .finish()
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Typed publish/subscribe hub.
pub struct EventBus<E: BusEvent> {
    table: Arc<SubscriberTable<E>>,
    middleware: RwLock<Arc<[Arc<dyn Middleware<E>>]>>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
    diagnostics: Diagnostics,
}

impl<E: BusEvent> EventBus<E> {
    /// Creates an empty bus.
    #[must_use]
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            table: Arc::new(SubscriberTable::new()),
            middleware: RwLock::new(Arc::from(Vec::new())),
            next_subscription: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            diagnostics,
        }
    }

    /// The diagnostics handle this bus reports to.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Subscribes `handler` to events of `kind`.
    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> Subscription<E>
    where
        F: Fn(&EventEnvelope<E>) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_handler(kind, Arc::new(handler))
    }

    /// Subscribes an already shared handler to events of `kind`.
    pub fn subscribe_handler(&self, kind: E::Kind, handler: Handler<E>) -> Subscription<E> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.table.insert(kind, SubscriberEntry { id, handler });

        self.diagnostics.trace(
            "subscribe",
            &format!("{id} -> {kind:?}"),
            "bus",
            &format!("{kind:?}"),
        );

        Subscription {
            id,
            kind,
            table: Arc::downgrade(&self.table),
            armed: true,
        }
    }

    /// Subscribes one handler to several kinds.
    pub fn subscribe_kinds<F>(&self, kinds: &[E::Kind], handler: F) -> Vec<Subscription<E>>
    where
        F: Fn(&EventEnvelope<E>) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: Handler<E> = Arc::new(handler);
        kinds
            .iter()
            .map(|kind| self.subscribe_handler(*kind, Arc::clone(&handler)))
            .collect()
    }

    /// Explicitly ends a subscription. Returns `false` if it was already gone.
    #[allow(clippy::needless_pass_by_value)]
    pub fn unsubscribe(&self, mut subscription: Subscription<E>) -> bool {
        subscription.release()
    }

    /// Number of live subscriptions for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.table.count(kind)
    }

    /// Appends a middleware stage. Stages run in registration order.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware<E>>) {
        let mut stages = self.middleware.write();
        let mut next: Vec<Arc<dyn Middleware<E>>> = stages.to_vec();
        next.push(middleware);
        *stages = next.into();
    }

    /// Number of middleware stages.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middleware.read().len()
    }

    /// Total envelopes sealed so far.
    #[must_use]
    pub fn events_published(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Publishes once. Never fails; handler failures are logged and reported.
    pub fn publish(&self, event: E) -> PublishOutcome {
        let outcome = self.deliver(event);
        if let PublishOutcome::Delivered(report) = &outcome {
            for failure in &report.failures {
                self.diagnostics.emit(
                    LogLevel::Error,
                    &format!("handler {} failed: {}", failure.subscription, failure.error),
                    "bus",
                    "subscriber",
                    "publish",
                    None,
                );
            }
        }
        outcome
    }

    /// Publishes, re-running the whole pipeline while any handler fails.
    ///
    /// Each failed attempt logs a warning. Exhaustion logs an error and raises
    /// exactly one alert, then returns [`DeliveryStatus::Exhausted`]; it is
    /// never raised to the caller.
    pub fn publish_with_retry(&self, event: &E, policy: RetryPolicy) -> DeliveryStatus {
        let kind = format!("{:?}", event.kind());
        let mut dropped = None;

        let result = policy.run(
            |_| match self.deliver(event.clone()) {
                PublishOutcome::Dropped { reason } => {
                    dropped = Some(reason);
                    Ok(0)
                }
                PublishOutcome::Delivered(report) if report.is_clean() => Ok(report.delivered),
                PublishOutcome::Delivered(report) => Err(report.summary()),
            },
            |attempt, error, will_retry| {
                if will_retry {
                    self.diagnostics.emit(
                        LogLevel::Warning,
                        &format!("attempt {attempt}/{} failed: {error}", policy.max_attempts()),
                        "bus",
                        &kind,
                        "publish_with_retry",
                        Some(status::RETRYING),
                    );
                }
            },
        );

        match result {
            Ok((_, _)) if dropped.is_some() => DeliveryStatus::Dropped {
                reason: dropped.unwrap_or_default(),
            },
            Ok((receivers, attempts)) => DeliveryStatus::Delivered {
                attempts,
                receivers,
            },
            Err((last_error, attempts)) => {
                let message = format!("delivery exhausted after {attempts} attempts: {last_error}");
                self.diagnostics.emit(
                    LogLevel::Error,
                    &message,
                    "bus",
                    &kind,
                    "publish_with_retry",
                    Some(status::EXHAUSTED),
                );
                self.diagnostics.alert(&AlertRecord {
                    level: LogLevel::Critical,
                    message: &message,
                    source: "bus",
                    target: &kind,
                    operation: "publish_with_retry",
                });
                self.diagnostics.metric("bus.delivery_exhausted", 1.0);
                DeliveryStatus::Exhausted {
                    attempts,
                    last_error,
                }
            }
        }
    }

    /// Middleware, envelope, snapshot, handlers. No logging of failures.
    fn deliver(&self, event: E) -> PublishOutcome {
        let stages = Arc::clone(&*self.middleware.read());

        let mut event = event;
        for stage in stages.iter() {
            // A panicking stage consumed the event; it is dropped, not delivered.
            let outcome =
                catch_unwind(AssertUnwindSafe(|| stage.process(event))).unwrap_or_else(|payload| {
                    let reason = format!("panicked: {}", panic_message(payload.as_ref()));
                    self.diagnostics.emit(
                        LogLevel::Error,
                        &format!("middleware {} {reason}", stage.name()),
                        "bus",
                        "middleware",
                        "publish",
                        Some(status::DROPPED),
                    );
                    self.diagnostics.metric("bus.middleware_panics", 1.0);
                    MiddlewareOutcome::Drop { reason }
                });
            match outcome {
                MiddlewareOutcome::Continue(next) => event = next,
                MiddlewareOutcome::Drop { reason } => {
                    self.diagnostics.emit(
                        LogLevel::Debug,
                        &format!("dropped by {}: {reason}", stage.name()),
                        "bus",
                        "middleware",
                        "publish",
                        Some(status::DROPPED),
                    );
                    self.diagnostics.metric("bus.dropped", 1.0);
                    return PublishOutcome::Dropped { reason };
                }
            }
        }

        let kind = event.kind();
        let envelope = EventEnvelope {
            kind,
            payload: event,
            created_at: SystemTime::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        };

        // Lock released before the first handler runs.
        let subscribers = self.table.snapshot(kind);
        let mut report = DeliveryReport {
            sequence: envelope.sequence,
            delivered: 0,
            failures: Vec::new(),
        };

        for entry in subscribers.iter().flat_map(|list| list.iter()) {
            report.delivered += 1;
            let handler = &entry.handler;
            let result = catch_unwind(AssertUnwindSafe(|| handler(&envelope)))
                .unwrap_or_else(|payload| Err(HandlerError(panic_message(payload.as_ref()))));
            if let Err(error) = result {
                report.failures.push(HandlerFailure {
                    subscription: entry.id,
                    error,
                });
            }
        }

        self.diagnostics.metric("bus.published", 1.0);
        if !report.failures.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let failures = report.failures.len() as f64;
            self.diagnostics.metric("bus.handler_failures", failures);
        }

        PublishOutcome::Delivered(report)
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(Diagnostics::default())
    }
}

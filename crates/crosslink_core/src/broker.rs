//! # Request Broker
//!
//! Request/response on top of the event bus, paired by correlation id.
//!
//! ## Lifecycle of a request
//!
//! ```text
//! send_request(q, callback)
//!     │  1. pending[id] = { callback, deadline }
//!     │  2. bus.publish(E::from(RequestEnvelope { id, q }))
//!     ▼
//! handler ... complete_request(id, response)
//!     │  3. pending.remove(id)          (lock released)
//!     │  4. callback(Ok(response))      (exactly once)
//!     ▼
//! later complete_request(id, ..)  ──> no-op, returns false
//! ```
//!
//! Every accepted request ends in exactly one callback invocation: a
//! response, a timeout from [`RequestBroker::sweep_expired`], a cancellation,
//! or retry exhaustion. The sender never blocks; callers that want to wait use
//! [`RequestBroker::request`] and block on the returned [`ResponseHandle`]
//! outside the framework.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::bus::{BusEvent, EventBus, PublishOutcome};
use crate::diagnostics::{status, AlertRecord, Diagnostics, LogLevel};
use crate::error::{panic_message, IntegrationError, IntegrationResult};
use crate::retry::RetryPolicy;

// ============================================================================
// Identifiers and envelopes
// ============================================================================

/// Process-unique request identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A request as carried on the bus.
///
/// The host's event enum wraps this in one of its variants and implements
/// `From<RequestEnvelope<Q>>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestEnvelope<Q> {
    /// Id the responder must pass to [`RequestBroker::complete_request`].
    pub correlation_id: CorrelationId,
    /// The request payload.
    pub request: Q,
}

type Completion<R> = Box<dyn FnOnce(Result<R, IntegrationError>) + Send>;

struct PendingRequest<R> {
    completion: Completion<R>,
    created_at: Instant,
    deadline: Instant,
}

// ============================================================================
// ResponseHandle
// ============================================================================

/// Blocking side of [`RequestBroker::request`].
///
/// Waiting happens on the caller's thread, never inside the broker.
#[derive(Debug)]
pub struct ResponseHandle<R> {
    id: CorrelationId,
    receiver: Receiver<Result<R, IntegrationError>>,
}

impl<R> ResponseHandle<R> {
    /// Correlation id of the request.
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Blocks until the request resolves.
    ///
    /// # Errors
    ///
    /// The request's own failure, or `CompletionClosed` if the broker was
    /// dropped with the request still pending.
    pub fn wait(self) -> IntegrationResult<R> {
        self.receiver
            .recv()
            .map_err(|_| IntegrationError::CompletionClosed(self.id))?
    }

    /// Blocks for at most `timeout`.
    ///
    /// # Errors
    ///
    /// `RequestTimedOut` if nothing arrived in time. The request itself stays
    /// pending in the broker until its own deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> IntegrationResult<R> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(IntegrationError::RequestTimedOut(self.id)),
            Err(RecvTimeoutError::Disconnected) => Err(IntegrationError::CompletionClosed(self.id)),
        }
    }

    /// Takes the result if it has already arrived.
    #[must_use]
    pub fn try_take(&self) -> Option<IntegrationResult<R>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(Err(IntegrationError::CompletionClosed(self.id)))
            }
        }
    }
}

// ============================================================================
// RequestBroker
// ============================================================================

/// Correlates requests published on an [`EventBus`] with their responses.
pub struct RequestBroker<E: BusEvent, R: Send + 'static> {
    bus: Arc<EventBus<E>>,
    pending: Mutex<HashMap<CorrelationId, PendingRequest<R>>>,
    next_id: AtomicU64,
    timeout: Duration,
    diagnostics: Diagnostics,
}

impl<E: BusEvent, R: Send + 'static> RequestBroker<E, R> {
    /// Creates a broker that publishes on `bus`.
    ///
    /// Requests not completed within `timeout` are failed by the next sweep.
    #[must_use]
    pub fn new(bus: Arc<EventBus<E>>, timeout: Duration) -> Self {
        let diagnostics = bus.diagnostics().clone();
        Self {
            bus,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
            diagnostics,
        }
    }

    /// The bus requests travel on.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus<E>> {
        &self.bus
    }

    /// Per-request deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Requests awaiting completion.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether `id` is still awaiting completion.
    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Publishes `request` and returns without waiting.
    ///
    /// On `Ok`, `callback` runs exactly once later. On `Err` the request was
    /// never accepted and `callback` is dropped without being called.
    ///
    /// # Errors
    ///
    /// - `RequestCancelled` if middleware dropped the request event.
    /// - `DeliveryExhausted` if a request handler failed before completing it.
    pub fn send_request<Q, F>(&self, request: Q, callback: F) -> IntegrationResult<CorrelationId>
    where
        E: From<RequestEnvelope<Q>>,
        F: FnOnce(Result<R, IntegrationError>) + Send + 'static,
    {
        let id = self.register(Box::new(callback));

        match self.dispatch(id, request) {
            Ok(()) => Ok(id),
            Err(DispatchFailure::Dropped(reason)) => {
                self.discard(id);
                Err(IntegrationError::RequestCancelled { id, reason })
            }
            Err(DispatchFailure::HandlerFailed(last_error)) => {
                self.discard(id);
                Err(IntegrationError::DeliveryExhausted {
                    attempts: 1,
                    last_error,
                })
            }
        }
    }

    /// [`send_request`](Self::send_request) with the bus retry policy.
    ///
    /// Every attempt reuses the same correlation id. A warning is logged per
    /// failed attempt. After the last one the request is failed with
    /// `DeliveryExhausted`, one alert is raised, and `None` is returned; the
    /// caller is never handed an error.
    pub fn send_request_with_retry<Q, F>(
        &self,
        request: &Q,
        callback: F,
        policy: RetryPolicy,
    ) -> Option<CorrelationId>
    where
        Q: Clone,
        E: From<RequestEnvelope<Q>>,
        F: FnOnce(Result<R, IntegrationError>) + Send + 'static,
    {
        let id = self.register(Box::new(callback));
        let target = id.to_string();

        let result = policy.run(
            |_| self.dispatch(id, request.clone()),
            |attempt, failure, will_retry| {
                if will_retry {
                    self.diagnostics.emit(
                        LogLevel::Warning,
                        &format!("attempt {attempt}/{} failed: {failure}", policy.max_attempts()),
                        "broker",
                        &target,
                        "send_request_with_retry",
                        Some(status::RETRYING),
                    );
                }
            },
        );

        match result {
            Ok(_) => Some(id),
            Err((failure, attempts)) => {
                let message =
                    format!("request delivery exhausted after {attempts} attempts: {failure}");
                self.diagnostics.emit(
                    LogLevel::Error,
                    &message,
                    "broker",
                    &target,
                    "send_request_with_retry",
                    Some(status::EXHAUSTED),
                );
                self.diagnostics.alert(&AlertRecord {
                    level: LogLevel::Critical,
                    message: &message,
                    source: "broker",
                    target: &target,
                    operation: "send_request_with_retry",
                });
                self.resolve(
                    id,
                    Err(IntegrationError::DeliveryExhausted {
                        attempts,
                        last_error: failure.to_string(),
                    }),
                );
                None
            }
        }
    }

    /// Sends a request whose result is collected through a [`ResponseHandle`].
    ///
    /// # Errors
    ///
    /// Same as [`send_request`](Self::send_request).
    pub fn request<Q>(&self, request: Q) -> IntegrationResult<ResponseHandle<R>>
    where
        E: From<RequestEnvelope<Q>>,
    {
        let (sender, receiver): (Sender<Result<R, IntegrationError>>, _) = bounded(1);
        let id = self.send_request(request, move |result| {
            let _ = sender.try_send(result);
        })?;
        Ok(ResponseHandle { id, receiver })
    }

    /// Resolves request `id` with `response`.
    ///
    /// Returns `false` (and does nothing else) if `id` is unknown or was
    /// already resolved; a late second completion is a no-op by contract.
    pub fn complete_request(&self, id: CorrelationId, response: R) -> bool {
        if self.resolve(id, Ok(response)) {
            self.diagnostics.metric("requests.completed", 1.0);
            true
        } else {
            self.diagnostics.emit(
                LogLevel::Debug,
                "completion for unknown or already resolved request ignored",
                "broker",
                &id.to_string(),
                "complete_request",
                None,
            );
            false
        }
    }

    /// Fails request `id` with `RequestCancelled`. Returns `false` if unknown.
    pub fn cancel(&self, id: CorrelationId, reason: &str) -> bool {
        let cancelled = self.resolve(
            id,
            Err(IntegrationError::RequestCancelled {
                id,
                reason: reason.to_owned(),
            }),
        );
        if cancelled {
            self.diagnostics.emit(
                LogLevel::Info,
                reason,
                "broker",
                &id.to_string(),
                "cancel",
                Some(status::CANCELLED),
            );
        }
        cancelled
    }

    /// Cancels every pending request. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (id, pending) in drained {
            self.invoke(
                id,
                pending.completion,
                Err(IntegrationError::RequestCancelled {
                    id,
                    reason: reason.to_owned(),
                }),
            );
        }

        if count > 0 {
            self.diagnostics.emit(
                LogLevel::Info,
                &format!("cancelled {count} pending requests: {reason}"),
                "broker",
                "*",
                "cancel_all",
                Some(status::CANCELLED),
            );
        }
        self.record_pending_gauge();
        count
    }

    /// Fails every request past its deadline with `RequestTimedOut`.
    ///
    /// Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(CorrelationId, PendingRequest<R>)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (id, pending) in expired {
            self.diagnostics.emit(
                LogLevel::Warning,
                &format!(
                    "request expired after {:?}",
                    now.saturating_duration_since(pending.created_at)
                ),
                "broker",
                &id.to_string(),
                "sweep_expired",
                Some(status::TIMED_OUT),
            );
            self.invoke(id, pending.completion, Err(IntegrationError::RequestTimedOut(id)));
        }

        if count > 0 {
            #[allow(clippy::cast_precision_loss)]
            let timed_out = count as f64;
            self.diagnostics.metric("requests.timed_out", timed_out);
            self.record_pending_gauge();
        }
        count
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn register(&self, completion: Completion<R>) -> CorrelationId {
        let id = CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let created_at = Instant::now();
        self.pending.lock().insert(
            id,
            PendingRequest {
                completion,
                created_at,
                deadline: created_at + self.timeout,
            },
        );
        self.record_pending_gauge();
        id
    }

    /// Removes a request that was never accepted. The callback is dropped.
    fn discard(&self, id: CorrelationId) {
        self.pending.lock().remove(&id);
        self.record_pending_gauge();
    }

    /// One publish of the request event.
    fn dispatch<Q>(&self, id: CorrelationId, request: Q) -> Result<(), DispatchFailure>
    where
        E: From<RequestEnvelope<Q>>,
    {
        let event = E::from(RequestEnvelope {
            correlation_id: id,
            request,
        });

        match self.bus.publish(event) {
            PublishOutcome::Dropped { reason } => Err(DispatchFailure::Dropped(reason)),
            PublishOutcome::Delivered(report) if report.is_clean() => Ok(()),
            // A handler that completed the request and then failed still
            // completed it.
            PublishOutcome::Delivered(_) if !self.is_pending(id) => Ok(()),
            PublishOutcome::Delivered(report) => Err(DispatchFailure::HandlerFailed(
                report
                    .failures
                    .iter()
                    .map(|f| f.error.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }

    /// Removes `id` and runs its callback with `result`, outside the lock.
    fn resolve(&self, id: CorrelationId, result: Result<R, IntegrationError>) -> bool {
        let Some(pending) = self.pending.lock().remove(&id) else {
            return false;
        };
        self.record_pending_gauge();
        self.invoke(id, pending.completion, result);
        true
    }

    fn invoke(
        &self,
        id: CorrelationId,
        completion: Completion<R>,
        result: Result<R, IntegrationError>,
    ) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || completion(result))) {
            self.diagnostics.emit(
                LogLevel::Error,
                &format!("request callback failed: {}", panic_message(payload.as_ref())),
                "broker",
                &id.to_string(),
                "callback",
                None,
            );
        }
    }

    fn record_pending_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        let pending = self.pending.lock().len() as f64;
        self.diagnostics.metric("requests.pending", pending);
    }
}

impl<E: BusEvent, R: Send + 'static> Drop for RequestBroker<E, R> {
    fn drop(&mut self) {
        self.cancel_all("broker shut down");
    }
}

/// Why a single dispatch failed.
#[derive(Debug)]
enum DispatchFailure {
    Dropped(String),
    HandlerFailed(String),
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dropped(reason) => write!(f, "dropped: {reason}"),
            Self::HandlerFailed(reason) => f.write_str(reason),
        }
    }
}

// ============================================================================
// RequestSweeper
// ============================================================================

/// Background thread that periodically calls
/// [`RequestBroker::sweep_expired`].
///
/// Holds only a weak reference to the broker and exits on its own once the
/// broker is gone. Dropping the sweeper stops and joins the thread.
pub struct RequestSweeper {
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl RequestSweeper {
    /// Starts sweeping `broker` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::Io` if the thread cannot be spawned.
    pub fn spawn<E, R>(
        broker: &Arc<RequestBroker<E, R>>,
        interval: Duration,
    ) -> IntegrationResult<Self>
    where
        E: BusEvent,
        R: Send + 'static,
    {
        let (shutdown, stop) = bounded::<()>(0);
        let broker: Weak<RequestBroker<E, R>> = Arc::downgrade(broker);
        let ticker = tick(interval);

        let worker = std::thread::Builder::new()
            .name("crosslink-sweeper".into())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        let Some(broker) = broker.upgrade() else { break };
                        broker.sweep_expired();
                    }
                    recv(stop) -> _ => break,
                }
            })
            .map_err(|e| IntegrationError::Io(e.to_string()))?;

        Ok(Self {
            shutdown: Some(shutdown),
            worker: Some(worker),
        })
    }

    /// Stops and joins the sweeper thread.
    pub fn stop(mut self) {
        self.close();
    }

    fn close(&mut self) {
        // Disconnecting the channel wakes the worker.
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RequestSweeper {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RequestSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSweeper")
            .field("running", &self.worker.is_some())
            .finish()
    }
}

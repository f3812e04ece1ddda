//! # Async Publisher
//!
//! Hands events to a dedicated worker thread which publishes them with retry.
//!
//! ```text
//! enqueue(event) ──try_send──> [bounded queue] ──> worker ──> bus.publish_with_retry
//!        │
//!        └─ queue full: event dropped, warning logged, returns false
//! ```
//!
//! The caller never blocks and never waits for delivery. Events enqueued from
//! one thread are published in enqueue order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};

use super::{BusEvent, DeliveryStatus, EventBus};
use crate::diagnostics::{status, LogLevel};
use crate::error::{IntegrationError, IntegrationResult};
use crate::retry::RetryPolicy;

/// Fire-and-forget front end of an [`EventBus`].
pub struct AsyncPublisher<E: BusEvent> {
    sender: Option<Sender<E>>,
    worker: Option<JoinHandle<()>>,
    bus: Arc<EventBus<E>>,
    rejected: Arc<AtomicU64>,
    exhausted: Arc<AtomicU64>,
}

impl<E: BusEvent> AsyncPublisher<E> {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::Io` if the thread cannot be spawned.
    pub fn spawn(
        bus: Arc<EventBus<E>>,
        capacity: usize,
        policy: RetryPolicy,
    ) -> IntegrationResult<Self> {
        let (sender, receiver) = bounded::<E>(capacity.max(1));
        let exhausted = Arc::new(AtomicU64::new(0));

        let worker_bus = Arc::clone(&bus);
        let worker_exhausted = Arc::clone(&exhausted);
        let worker = std::thread::Builder::new()
            .name("crosslink-publisher".into())
            .spawn(move || {
                for event in receiver {
                    let outcome = worker_bus.publish_with_retry(&event, policy);
                    if matches!(outcome, DeliveryStatus::Exhausted { .. }) {
                        worker_exhausted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .map_err(|e| IntegrationError::Io(e.to_string()))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            bus,
            rejected: Arc::new(AtomicU64::new(0)),
            exhausted,
        })
    }

    /// Queues `event` for publication. Returns `false` if the queue was full
    /// or the worker has stopped.
    pub fn enqueue(&self, event: E) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        let (event, message) = match sender.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(event)) => (event, "publish queue full, event dropped"),
            Err(TrySendError::Disconnected(event)) => {
                (event, "publisher worker gone, event dropped")
            }
        };

        self.rejected.fetch_add(1, Ordering::Relaxed);
        let kind = format!("{:?}", event.kind());
        self.bus.diagnostics().emit(
            LogLevel::Warning,
            message,
            "publisher",
            &kind,
            "enqueue",
            Some(status::DROPPED),
        );
        self.bus.diagnostics().metric("bus.queue_rejected", 1.0);
        false
    }

    /// Events currently waiting for the worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Events refused at `enqueue`.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Events whose retries ran out on the worker.
    #[must_use]
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Stops accepting events, drains the queue and joins the worker.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<E: BusEvent> Drop for AsyncPublisher<E> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventEnvelope;
    use crate::diagnostics::{Diagnostics, MemorySink};
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Tick(u32);

    impl BusEvent for Tick {
        type Kind = ();

        fn kind(&self) {}
    }

    #[test]
    fn test_worker_publishes_in_order() {
        let bus = Arc::new(EventBus::new(Diagnostics::new(Arc::new(MemorySink::new()))));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let _sub = bus.subscribe((), move |env: &EventEnvelope<Tick>| {
            log.lock().push(env.payload().0);
            Ok(())
        });

        let publisher = AsyncPublisher::spawn(Arc::clone(&bus), 16, RetryPolicy::once()).unwrap();
        for i in 0..10 {
            assert!(publisher.enqueue(Tick(i)));
        }
        publisher.shutdown();

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_survives_panicking_middleware() {
        let bus = Arc::new(EventBus::new(Diagnostics::new(Arc::new(MemorySink::new()))));
        bus.add_middleware(Arc::new(crate::bus::FnMiddleware::new(
            "odd-panics",
            |t: Tick| {
                assert!(t.0 % 2 == 0, "odd tick");
                crate::bus::MiddlewareOutcome::Continue(t)
            },
        )));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let _sub = bus.subscribe((), move |env: &EventEnvelope<Tick>| {
            log.lock().push(env.payload().0);
            Ok(())
        });

        let publisher = AsyncPublisher::spawn(Arc::clone(&bus), 16, RetryPolicy::once()).unwrap();
        for i in 0..6 {
            assert!(publisher.enqueue(Tick(i)));
        }
        publisher.shutdown();

        assert_eq!(*seen.lock(), vec![0, 2, 4]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let sink = Arc::new(MemorySink::new());
        let bus = Arc::new(EventBus::new(Diagnostics::new(sink.clone())));
        let gate = Arc::new(Barrier::new(2));

        let worker_gate = Arc::clone(&gate);
        let _sub = bus.subscribe((), move |env: &EventEnvelope<Tick>| {
            if env.payload().0 == 0 {
                worker_gate.wait();
            }
            Ok(())
        });

        let publisher = AsyncPublisher::spawn(Arc::clone(&bus), 1, RetryPolicy::once()).unwrap();
        assert!(publisher.enqueue(Tick(0)));

        // Wait until the worker has taken Tick(0) off the queue.
        while publisher.queued() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(publisher.enqueue(Tick(1)));
        assert!(!publisher.enqueue(Tick(2)));
        assert_eq!(publisher.rejected(), 1);

        gate.wait();
        publisher.shutdown();
        assert_eq!(sink.logs_with_status(status::DROPPED).len(), 1);
    }

    #[test]
    fn test_exhaustion_is_counted() {
        let bus = Arc::new(EventBus::new(Diagnostics::new(Arc::new(MemorySink::new()))));
        let _sub = bus.subscribe((), |_: &EventEnvelope<Tick>| Err("down".into()));

        let publisher = AsyncPublisher::spawn(
            Arc::clone(&bus),
            4,
            RetryPolicy::new(2, Duration::ZERO),
        )
        .unwrap();
        publisher.enqueue(Tick(1));

        let exhausted = Arc::clone(&publisher.exhausted);
        drop(publisher);

        assert_eq!(exhausted.load(Ordering::Relaxed), 1);
    }
}

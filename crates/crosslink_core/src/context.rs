//! # Integration Context
//!
//! The explicitly constructed hub handed to every subsystem at startup.
//!
//! ```text
//! IntegrationContext::builder()
//!     .config(IntegrationConfig::load("crosslink.toml")?)
//!     .sink(Arc::new(MemorySink::new()))
//!     .build()?
//!         │
//!         ├── registry   Arc<CapabilityRegistry>
//!         ├── bus        Arc<EventBus<E>>
//!         ├── broker     Arc<RequestBroker<E, R>>
//!         └── journal    Arc<TransactionJournal>   (shared by guarded())
//! ```
//!
//! There is no global instance. Two contexts in one process are fully
//! isolated, which is what the tests rely on.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::broker::{RequestBroker, RequestSweeper};
use crate::bus::{AsyncPublisher, BusEvent, EventBus};
use crate::config::IntegrationConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSink, LogLevel};
use crate::error::IntegrationResult;
use crate::registry::CapabilityRegistry;
use crate::retry::RetryPolicy;
use crate::state::SyncedState;
use crate::transaction::{GuardedResource, Rollback, TransactionJournal};

/// Shared framework services for one host process.
pub struct IntegrationContext<E: BusEvent, R: Send + 'static> {
    config: IntegrationConfig,
    diagnostics: Diagnostics,
    registry: Arc<CapabilityRegistry>,
    bus: Arc<EventBus<E>>,
    broker: Arc<RequestBroker<E, R>>,
    journal: Arc<TransactionJournal>,
}

impl<E: BusEvent, R: Send + 'static> IntegrationContext<E, R> {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> IntegrationContextBuilder<E, R> {
        IntegrationContextBuilder::new()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    /// Diagnostics handle shared by every component.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Capability registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus<E>> {
        &self.bus
    }

    /// Request broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<RequestBroker<E, R>> {
        &self.broker
    }

    /// Journal shared by resources created with [`guarded`](Self::guarded).
    #[must_use]
    pub fn journal(&self) -> &Arc<TransactionJournal> {
        &self.journal
    }

    /// Retry policy from `[bus]`.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.bus.retry_policy()
    }

    /// New state container using `[state]` settings.
    #[must_use]
    pub fn synced_state<T>(&self, domain: &str) -> SyncedState<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        SyncedState::new(domain, self.config.state.max_snapshots, self.diagnostics.clone())
    }

    /// Guards `resource` using `[idempotency]` settings and the shared journal.
    #[must_use]
    pub fn guarded<Res, O>(&self, target: &str, resource: Res) -> GuardedResource<Res, O>
    where
        Res: Rollback,
        O: Clone,
    {
        let idempotency = &self.config.idempotency;
        GuardedResource::new(target, resource, self.diagnostics.clone())
            .with_idempotency(idempotency.ttl(), idempotency.max_keys)
            .with_journal(Arc::clone(&self.journal))
    }

    /// Starts the pending-request sweeper at `[requests] sweep_interval_ms`.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::Io` if the thread cannot be spawned.
    pub fn spawn_sweeper(&self) -> IntegrationResult<RequestSweeper> {
        RequestSweeper::spawn(&self.broker, self.config.requests.sweep_interval())
    }

    /// Starts a background publisher sized by `[bus] async_queue_capacity`.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::Io` if the thread cannot be spawned.
    pub fn async_publisher(&self) -> IntegrationResult<AsyncPublisher<E>> {
        AsyncPublisher::spawn(
            Arc::clone(&self.bus),
            self.config.bus.async_queue_capacity,
            self.retry_policy(),
        )
    }

    /// Cancels every pending request. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.broker.cancel_all("integration context shut down");
        self.diagnostics.emit(
            LogLevel::Info,
            &format!("shutdown, {cancelled} pending requests cancelled"),
            "context",
            "*",
            "shutdown",
            None,
        );
        cancelled
    }
}

impl<E: BusEvent, R: Send + 'static> Clone for IntegrationContext<E, R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            diagnostics: self.diagnostics.clone(),
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            broker: Arc::clone(&self.broker),
            journal: Arc::clone(&self.journal),
        }
    }
}

impl<E: BusEvent, R: Send + 'static> fmt::Debug for IntegrationContext<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationContext")
            .field("config", &self.config)
            .field("capabilities", &self.registry.len())
            .field("pending_requests", &self.broker.pending_count())
            .finish_non_exhaustive()
    }
}

/// Builder for [`IntegrationContext`].
///
/// Carries the event and response types so `build` needs no annotations.
pub struct IntegrationContextBuilder<E, R> {
    config: Option<IntegrationConfig>,
    sink: Option<Arc<dyn DiagnosticsSink>>,
    _types: PhantomData<fn() -> (E, R)>,
}

impl<E: BusEvent, R: Send + 'static> IntegrationContextBuilder<E, R> {
    /// Empty builder: default configuration, `tracing` diagnostics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: None,
            sink: None,
            _types: PhantomData,
        }
    }

    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: IntegrationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Reports to `sink` instead of `tracing`.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the configuration and wires every component.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration fails validation.
    pub fn build(self) -> IntegrationResult<IntegrationContext<E, R>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let diagnostics = self.sink.map_or_else(Diagnostics::tracing, Diagnostics::new);
        let registry = Arc::new(CapabilityRegistry::new(diagnostics.clone()));
        let bus = Arc::new(EventBus::new(diagnostics.clone()));
        let broker = Arc::new(RequestBroker::new(Arc::clone(&bus), config.requests.timeout()));
        let journal = Arc::new(TransactionJournal::new(config.idempotency.journal_capacity));

        diagnostics.emit(
            LogLevel::Info,
            "integration context ready",
            "context",
            "*",
            "build",
            None,
        );

        Ok(IntegrationContext {
            config,
            diagnostics,
            registry,
            bus,
            broker,
            journal,
        })
    }
}

impl<E: BusEvent, R: Send + 'static> Default for IntegrationContextBuilder<E, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, R> fmt::Debug for IntegrationContextBuilder<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationContextBuilder")
            .field("config", &self.config)
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

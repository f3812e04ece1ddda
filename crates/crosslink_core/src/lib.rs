//! # CROSSLINK Core
//!
//! The decoupling layer between independently developed game subsystems
//! (combat, inventory, economy, quest, world).
//!
//! ## Design Principles
//!
//! 1. **No direct references** - subsystems meet through capabilities, events and requests
//! 2. **Degrade, never crash** - delivery failures become diagnostics, not panics
//! 3. **Caller-visible faults stay visible** - lookups, snapshots and transactions return errors
//! 4. **Locks per structure** - combat state never waits on inventory
//! 5. **No handler under a lock** - handlers may publish, subscribe and unsubscribe freely
//!
//! ## Components
//!
//! | Component | Type | Purpose |
//! |-----------|------|---------|
//! | Registry | [`CapabilityRegistry`] | capability → provider |
//! | Event bus | [`EventBus`] | typed pub/sub, middleware, retry |
//! | Requests | [`RequestBroker`] | correlation ids, deadlines |
//! | Shared state | [`SyncedState`] | versioned value, snapshots, conflicts |
//! | Transactions | [`GuardedResource`] | atomic, idempotent, journaled mutation |
//! | Diagnostics | [`DiagnosticsSink`] | logs, metrics, alerts, traces |
//!
//! ## Example
//!
//! ```rust,ignore
//! use crosslink_core::{IntegrationContext, TxRequest};
//!
//! let ctx: IntegrationContext<GameEvent, GameResponse> = IntegrationContext::builder()
//!     .config(IntegrationConfig::load("crosslink.toml")?)
//!     .build()?;
//!
//! let _quest = ctx.bus().subscribe(EventKind::ItemTraded, |env| {
//!     tracker.on_trade(env.payload())
//! });
//!
//! let wallet = ctx.guarded("ledger", Ledger::default());
//! wallet.apply(&TxRequest::new("credit").with_key("purchase-42"), |l| l.credit(player, 100))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod bus;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod registry;
pub mod retry;
pub mod state;
pub mod transaction;

pub use broker::{CorrelationId, RequestBroker, RequestEnvelope, RequestSweeper, ResponseHandle};
pub use bus::{
    AsyncPublisher, BusEvent, DeliveryReport, DeliveryStatus, EventBus, EventEnvelope,
    FilterMiddleware, FnMiddleware, Middleware, MiddlewareOutcome, PublishOutcome, Subscription,
};
pub use config::IntegrationConfig;
pub use context::{IntegrationContext, IntegrationContextBuilder};
pub use diagnostics::{Diagnostics, DiagnosticsSink, LogLevel, MemorySink, TracingSink};
pub use error::{HandlerError, HandlerResult, IntegrationError, IntegrationResult};
pub use registry::CapabilityRegistry;
pub use retry::RetryPolicy;
pub use state::{SnapshotStamp, StateDelta, SyncedState};
pub use transaction::{
    Applied, AppliedStatus, GuardedResource, Rollback, TransactionId, TransactionJournal,
    TxRequest, TxStatus,
};

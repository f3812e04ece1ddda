//! # Idempotent Transactions
//!
//! Guards mutations of one shared resource instance (an inventory, a
//! ledger) so that they are atomic, deduplicated and journaled.
//!
//! ## apply(request, mutation)
//!
//! ```text
//! lock(resource)                                  ← per instance, never global
//!   ├─ key seen and not expired ──> return stored output   "idempotent skip"
//!   ├─ journal.begin()  → Pending
//!   ├─ checkpoint = resource.snapshot()
//!   ├─ mutation(&mut resource)
//!   │     ├─ Ok(out)        ──> remember key, Committed    "committed"
//!   │     └─ Err / panic    ──> restore(checkpoint),
//!   │                           RolledBack, Err to caller  "rolled back"
//! unlock                                          ← on every path (guard drop)
//! ```
//!
//! Unlike delivery failures, a failed mutation is always returned to the
//! caller: it has to know its change did not happen.

mod idempotency;
mod journal;

pub use idempotency::{IdempotencyCache, Receipt};
pub use journal::{TransactionId, TransactionJournal, TransactionRecord, TxStatus};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::diagnostics::{status, Diagnostics, LogLevel};
use crate::error::{panic_message, IntegrationError, IntegrationResult};

/// Default key lifetime: longest plausible outer retry window.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(600);

/// Default number of keys remembered per resource.
pub const DEFAULT_MAX_KEYS: usize = 4096;

/// A resource that can checkpoint itself and roll back to the checkpoint.
pub trait Rollback {
    /// Checkpoint type.
    type Snapshot;

    /// Captures the current state.
    fn snapshot(&self) -> Self::Snapshot;

    /// Returns to a captured state.
    fn restore(&mut self, snapshot: Self::Snapshot);
}

/// Describes one guarded mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRequest {
    /// Operation name for the journal and logs.
    pub operation: String,
    /// Capability asking for the mutation.
    pub source: String,
    /// Idempotency key; `None` means every call mutates.
    pub key: Option<String>,
}

impl TxRequest {
    /// A request without source or key.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            source: "unknown".to_owned(),
            key: None,
        }
    }

    /// Sets the requesting capability.
    #[must_use]
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// How an `apply` call was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppliedStatus {
    /// The mutation ran and committed.
    Committed,
    /// The key was already accepted; nothing ran.
    IdempotentSkip,
}

/// Successful result of [`GuardedResource::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied<O> {
    /// Output of the mutation (the original one on a skip).
    pub output: O,
    /// Transaction that produced `output`.
    pub transaction_id: TransactionId,
    /// Whether this call ran the mutation.
    pub status: AppliedStatus,
}

impl<O> Applied<O> {
    /// Whether this call was deduplicated.
    #[must_use]
    pub fn was_skipped(&self) -> bool {
        self.status == AppliedStatus::IdempotentSkip
    }
}

struct Guarded<R, O> {
    resource: R,
    receipts: IdempotencyCache<O>,
}

/// A resource instance whose mutations go through the transaction layer.
pub struct GuardedResource<R, O> {
    target: String,
    state: Mutex<Guarded<R, O>>,
    journal: Arc<TransactionJournal>,
    diagnostics: Diagnostics,
}

impl<R, O> GuardedResource<R, O>
where
    R: Rollback,
    O: Clone,
{
    /// Guards `resource` under the name `target`, with its own journal.
    #[must_use]
    pub fn new(target: impl Into<String>, resource: R, diagnostics: Diagnostics) -> Self {
        Self {
            target: target.into(),
            state: Mutex::new(Guarded {
                resource,
                receipts: IdempotencyCache::new(DEFAULT_KEY_TTL, DEFAULT_MAX_KEYS),
            }),
            journal: Arc::new(TransactionJournal::default()),
            diagnostics,
        }
    }

    /// Writes records to a (possibly shared) journal instead.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<TransactionJournal>) -> Self {
        self.journal = journal;
        self
    }

    /// Replaces the idempotency policy. Existing keys are dropped.
    #[must_use]
    pub fn with_idempotency(self, ttl: Duration, max_keys: usize) -> Self {
        self.state.lock().receipts = IdempotencyCache::new(ttl, max_keys);
        self
    }

    /// Resource name.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The journal this resource writes to.
    #[must_use]
    pub fn journal(&self) -> &Arc<TransactionJournal> {
        &self.journal
    }

    /// Runs `f` on the resource under its lock.
    pub fn read<U>(&self, f: impl FnOnce(&R) -> U) -> U {
        f(&self.state.lock().resource)
    }

    /// Idempotency keys currently remembered.
    #[must_use]
    pub fn receipt_count(&self) -> usize {
        self.state.lock().receipts.len()
    }

    /// Forgets expired idempotency keys. Returns how many were removed.
    pub fn purge_expired_keys(&self) -> usize {
        self.state.lock().receipts.purge_expired(Instant::now())
    }

    /// Runs `mutation` as one atomic, deduplicated, journaled transaction.
    ///
    /// # Errors
    ///
    /// `TransactionRolledBack` if `mutation` returned an error or panicked.
    /// The resource is back in its pre-call state and the journal record is
    /// `RolledBack`.
    pub fn apply<F, E>(&self, request: &TxRequest, mutation: F) -> IntegrationResult<Applied<O>>
    where
        F: FnOnce(&mut R) -> Result<O, E>,
        E: fmt::Display,
    {
        let mut guard = self.state.lock();
        let now = Instant::now();

        if let Some(key) = request.key.as_deref() {
            if let Some(receipt) = guard.receipts.get(key, now) {
                let applied = Applied {
                    output: receipt.output.clone(),
                    transaction_id: receipt.transaction_id,
                    status: AppliedStatus::IdempotentSkip,
                };
                drop(guard);
                self.log(
                    LogLevel::Info,
                    &format!("key {key} already applied by {}", applied.transaction_id),
                    request,
                    status::IDEMPOTENT_SKIP,
                );
                self.diagnostics.metric("tx.idempotent_skip", 1.0);
                return Ok(applied);
            }
        }

        let transaction_id = self
            .journal
            .begin(&request.operation, &request.source, &self.target);
        let checkpoint = guard.resource.snapshot();

        let resource = &mut guard.resource;
        let outcome = catch_unwind(AssertUnwindSafe(|| mutation(resource)));

        let failure = match outcome {
            Ok(Ok(output)) => {
                if let Some(key) = &request.key {
                    guard
                        .receipts
                        .insert(key.clone(), output.clone(), transaction_id, now);
                }
                self.journal.finish(transaction_id, TxStatus::Committed, None);
                drop(guard);

                self.log(
                    LogLevel::Info,
                    &format!("{transaction_id} committed"),
                    request,
                    status::COMMITTED,
                );
                self.diagnostics.metric("tx.committed", 1.0);
                return Ok(Applied {
                    output,
                    transaction_id,
                    status: AppliedStatus::Committed,
                });
            }
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        guard.resource.restore(checkpoint);
        self.journal
            .finish(transaction_id, TxStatus::RolledBack, Some(failure.clone()));
        drop(guard);

        self.log(
            LogLevel::Warning,
            &format!("{transaction_id} rolled back: {failure}"),
            request,
            status::ROLLED_BACK,
        );
        self.diagnostics.metric("tx.rolled_back", 1.0);

        Err(IntegrationError::TransactionRolledBack {
            transaction_id,
            operation: request.operation.clone(),
            reason: failure,
        })
    }

    fn log(&self, level: LogLevel, message: &str, request: &TxRequest, outcome: &str) {
        self.diagnostics.emit(
            level,
            message,
            &request.source,
            &self.target,
            &request.operation,
            Some(outcome),
        );
    }
}

impl<R, O> fmt::Debug for GuardedResource<R, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedResource")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

//! # Synchronized State
//!
//! One versioned value per shared domain ("world clock", "combat state"),
//! read and written only through the container.
//!
//! ## Commit pipeline
//!
//! ```text
//! set_state_at(base, proposed)
//!     │
//!     ├─ base != version && resolver?  ──> proposed = resolver(current, proposed)
//!     ├─ pre-validator rejects         ──> Err(Pre),  value untouched
//!     ├─ commit (version + 1)
//!     ├─ post-validator rejects        ──> roll back, Err(Post)
//!     │
//!     └─ lock released ──> observers(new value)
//! ```
//!
//! Everything up to the commit happens under the container's own lock, so no
//! reader and no observer ever sees a value that was not committed. Each
//! container has its own lock; unrelated domains never contend.
//!
//! ## Snapshots
//!
//! `create_snapshot` records the current value under a [`SnapshotStamp`]
//! (microseconds since the epoch, strictly increasing per container).
//! `restore_snapshot` puts that exact value back as a new version and
//! notifies observers. History is bounded; the oldest snapshot goes first.

mod delta;

pub use delta::{FnDelta, StateDelta};

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::diagnostics::{status, AlertRecord, Diagnostics, LogLevel};
use crate::error::{panic_message, IntegrationError, IntegrationResult, ValidationStage};

/// Default number of snapshots a container keeps.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 10;

/// Identifier of a snapshot: microseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotStamp(u64);

impl SnapshotStamp {
    /// Builds a stamp from a raw microsecond value.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Raw microsecond value.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identifier of a registered observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Metadata of a retained snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Restore key.
    pub stamp: SnapshotStamp,
    /// Version of the value when it was captured.
    pub version: u64,
    /// Caller-supplied label.
    pub context: String,
}

struct Snapshot<T> {
    info: SnapshotInfo,
    value: T,
}

type Validator<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;
type Resolver<T> = Box<dyn Fn(&T, &T) -> T + Send + Sync>;
type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: Option<T>,
    version: u64,
    snapshots: VecDeque<Snapshot<T>>,
    last_stamp: u64,
}

/// Versioned, validated, observable value shared across subsystems.
pub struct SyncedState<T> {
    domain: String,
    inner: Mutex<Inner<T>>,
    observers: RwLock<Arc<[(ObserverId, Observer<T>)]>>,
    next_observer: AtomicU64,
    pre_validator: Option<Validator<T>>,
    post_validator: Option<Validator<T>>,
    resolver: Option<Resolver<T>>,
    max_snapshots: usize,
    diagnostics: Diagnostics,
}

impl<T> SyncedState<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an uninitialized container for `domain`.
    #[must_use]
    pub fn new(domain: impl Into<String>, max_snapshots: usize, diagnostics: Diagnostics) -> Self {
        Self {
            domain: domain.into(),
            inner: Mutex::new(Inner {
                value: None,
                version: 0,
                snapshots: VecDeque::new(),
                last_stamp: 0,
            }),
            observers: RwLock::new(Arc::from(Vec::new())),
            next_observer: AtomicU64::new(1),
            pre_validator: None,
            post_validator: None,
            resolver: None,
            max_snapshots: max_snapshots.max(1),
            diagnostics,
        }
    }

    /// Creates a container already holding `value` at version 1.
    #[must_use]
    pub fn with_initial(self, value: T) -> Self {
        {
            let mut inner = self.inner.lock();
            inner.value = Some(value);
            inner.version = 1;
        }
        self
    }

    /// Hook run on every proposed value before it is committed.
    #[must_use]
    pub fn with_pre_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.pre_validator = Some(Box::new(validator));
        self
    }

    /// Hook run on the committed value; rejection rolls the commit back.
    #[must_use]
    pub fn with_post_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.post_validator = Some(Box::new(validator));
        self
    }

    /// Policy for proposals made against an outdated version.
    ///
    /// Called as `resolver(current, proposed)`; its result is committed.
    /// Without a resolver the later writer wins.
    #[must_use]
    pub fn with_conflict_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Domain name.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Current committed version; 0 before the first commit.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Whether a value has been committed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Clone of the committed value.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    /// Runs `f` on the committed value without cloning it.
    ///
    /// `f` runs under the container lock and must not call back into it.
    ///
    /// # Errors
    ///
    /// `StateUninitialized` if nothing has been committed.
    pub fn with_state<U>(&self, f: impl FnOnce(&T) -> U) -> IntegrationResult<U> {
        let inner = self.inner.lock();
        inner.value.as_ref().map(f).ok_or_else(|| self.uninitialized())
    }

    /// Commits `value` unconditionally (last write wins).
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// `ValidationRejected` if a validator refused the value; the committed
    /// value is then unchanged.
    pub fn set_state(&self, value: T) -> IntegrationResult<u64> {
        self.commit(None, value)
    }

    /// Commits `value` as a successor of `base_version`.
    ///
    /// If another commit happened since `base_version`, the conflict
    /// resolver (if any) picks the value to commit.
    ///
    /// # Errors
    ///
    /// Same as [`set_state`](Self::set_state).
    pub fn set_state_at(&self, base_version: u64, value: T) -> IntegrationResult<u64> {
        self.commit(Some(base_version), value)
    }

    /// Applies `delta` to the committed value in place.
    ///
    /// # Errors
    ///
    /// - `StateUninitialized` if nothing has been committed.
    /// - `ValidationRejected` if the delta failed or a validator refused the
    ///   result; the delta is reverted.
    pub fn apply_delta<D: StateDelta<T> + ?Sized>(&self, delta: &D) -> IntegrationResult<u64> {
        let (version, committed) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(value) = inner.value.as_mut() else {
                return Err(self.uninitialized());
            };

            let applied = catch_unwind(AssertUnwindSafe(|| delta.apply(value)));
            let reason = match applied {
                Ok(Ok(())) => None,
                Ok(Err(reason)) => Some(format!("{}: {reason}", delta.describe())),
                Err(payload) => {
                    // The panic may have left a partial write behind.
                    self.revert(delta, value);
                    Some(format!(
                        "{} panicked: {}",
                        delta.describe(),
                        panic_message(payload.as_ref())
                    ))
                }
            };
            if let Some(reason) = reason {
                return Err(self.rejected(ValidationStage::Pre, reason));
            }
            if let Err(reason) = Self::validate(self.pre_validator.as_ref(), value) {
                self.revert(delta, value);
                return Err(self.rejected(ValidationStage::Pre, reason));
            }
            if let Err(reason) = Self::validate(self.post_validator.as_ref(), value) {
                self.revert(delta, value);
                return Err(self.rejected(ValidationStage::Post, reason));
            }

            inner.version += 1;
            (inner.version, value.clone())
        };

        self.diagnostics.trace(
            "apply_delta",
            &format!("{} -> v{version}", delta.describe()),
            "state",
            &self.domain,
        );
        self.diagnostics.metric("state.commits", 1.0);
        self.notify(&committed);
        Ok(version)
    }

    /// Registers an observer called after every successful commit.
    pub fn register_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let mut observers = self.observers.write();
        let mut next: Vec<(ObserverId, Observer<T>)> = observers.to_vec();
        next.push((id, Arc::new(observer)));
        *observers = next.into();
        id
    }

    /// Removes an observer. Returns `false` if it was unknown.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        if !observers.iter().any(|(oid, _)| *oid == id) {
            return false;
        }
        let next: Vec<(ObserverId, Observer<T>)> =
            observers.iter().filter(|(oid, _)| *oid != id).cloned().collect();
        *observers = next.into();
        true
    }

    /// Records the committed value under a new stamp.
    ///
    /// # Errors
    ///
    /// `StateUninitialized` if nothing has been committed.
    pub fn create_snapshot(&self, context: &str) -> IntegrationResult<SnapshotStamp> {
        let mut inner = self.inner.lock();
        let Some(value) = inner.value.clone() else {
            return Err(self.uninitialized());
        };

        let stamp = now_micros().max(inner.last_stamp + 1);
        inner.last_stamp = stamp;

        let info = SnapshotInfo {
            stamp: SnapshotStamp(stamp),
            version: inner.version,
            context: context.to_owned(),
        };
        inner.snapshots.push_back(Snapshot { info, value });
        while inner.snapshots.len() > self.max_snapshots {
            inner.snapshots.pop_front();
        }

        Ok(SnapshotStamp(stamp))
    }

    /// Puts the value recorded under `stamp` back as a new version.
    ///
    /// Validators are not consulted: the value was committed once already.
    ///
    /// # Errors
    ///
    /// `SnapshotNotFound` if `stamp` is unknown or was evicted; state is
    /// unchanged.
    pub fn restore_snapshot(&self, stamp: SnapshotStamp) -> IntegrationResult<u64> {
        let (version, restored) = {
            let mut inner = self.inner.lock();
            let Some(snapshot) = inner.snapshots.iter().find(|s| s.info.stamp == stamp) else {
                return Err(IntegrationError::SnapshotNotFound {
                    domain: self.domain.clone(),
                    stamp,
                });
            };
            let restored = snapshot.value.clone();
            inner.value = Some(restored.clone());
            inner.version += 1;
            (inner.version, restored)
        };

        self.diagnostics.emit(
            LogLevel::Info,
            &format!("restored snapshot {stamp} as v{version}"),
            "state",
            &self.domain,
            "restore_snapshot",
            Some(status::COMMITTED),
        );
        self.notify(&restored);
        Ok(version)
    }

    /// Retained snapshots, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SnapshotInfo> {
        self.inner
            .lock()
            .snapshots
            .iter()
            .map(|s| s.info.clone())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn commit(&self, base_version: Option<u64>, proposed: T) -> IntegrationResult<u64> {
        let (version, committed) = {
            let mut inner = self.inner.lock();

            let mut proposed = proposed;
            if let (Some(base), Some(current)) = (base_version, inner.value.as_ref()) {
                if base != inner.version {
                    if let Some(resolve) = &self.resolver {
                        match catch_unwind(AssertUnwindSafe(|| resolve(current, &proposed))) {
                            Ok(resolved) => proposed = resolved,
                            Err(payload) => {
                                let reason = format!(
                                    "conflict resolver panicked: {}",
                                    panic_message(payload.as_ref())
                                );
                                return Err(self.rejected(ValidationStage::Pre, reason));
                            }
                        }
                    }
                    self.diagnostics.emit(
                        LogLevel::Debug,
                        &format!("proposal against v{base} resolved at v{}", inner.version),
                        "state",
                        &self.domain,
                        "set_state",
                        None,
                    );
                    self.diagnostics.metric("state.conflicts", 1.0);
                }
            }

            if let Err(reason) = Self::validate(self.pre_validator.as_ref(), &proposed) {
                return Err(self.rejected(ValidationStage::Pre, reason));
            }

            let prior = inner.value.replace(proposed);
            inner.version += 1;

            if let Some(committed) = inner.value.as_ref() {
                if let Err(reason) = Self::validate(self.post_validator.as_ref(), committed) {
                    inner.value = prior;
                    inner.version -= 1;
                    return Err(self.rejected(ValidationStage::Post, reason));
                }
            }

            (inner.version, inner.value.clone())
        };

        self.diagnostics.metric("state.commits", 1.0);
        if let Some(committed) = committed {
            self.notify(&committed);
        }
        Ok(version)
    }

    /// Undoes `delta`. A panicking revert leaves the value as the delta left
    /// it, so it is raised as a critical alert.
    fn revert<D: StateDelta<T> + ?Sized>(&self, delta: &D, value: &mut T) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| delta.revert(value))) {
            let message = format!(
                "revert of {} panicked: {}",
                delta.describe(),
                panic_message(payload.as_ref())
            );
            self.diagnostics.emit(
                LogLevel::Critical,
                &message,
                "state",
                &self.domain,
                "apply_delta",
                Some(status::ROLLED_BACK),
            );
            self.diagnostics.alert(&AlertRecord {
                level: LogLevel::Critical,
                message: &message,
                source: "state",
                target: &self.domain,
                operation: "apply_delta",
            });
        }
    }

    fn validate(validator: Option<&Validator<T>>, value: &T) -> Result<(), String> {
        match validator {
            None => Ok(()),
            Some(check) => catch_unwind(AssertUnwindSafe(|| check(value)))
                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()))),
        }
    }

    fn notify(&self, value: &T) {
        let observers = Arc::clone(&*self.observers.read());
        for (id, observer) in observers.iter() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer(value))) {
                self.diagnostics.emit(
                    LogLevel::Error,
                    &format!("observer {} failed: {}", id.0, panic_message(payload.as_ref())),
                    "state",
                    &self.domain,
                    "notify",
                    None,
                );
            }
        }
    }

    fn rejected(&self, stage: ValidationStage, reason: String) -> IntegrationError {
        self.diagnostics.emit(
            LogLevel::Warning,
            &format!("{stage} rejected: {reason}"),
            "state",
            &self.domain,
            "set_state",
            Some(status::ROLLED_BACK),
        );
        IntegrationError::ValidationRejected {
            domain: self.domain.clone(),
            stage,
            reason,
        }
    }

    fn uninitialized(&self) -> IntegrationError {
        IntegrationError::StateUninitialized {
            domain: self.domain.clone(),
        }
    }
}

impl<T> fmt::Debug for SyncedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedState")
            .field("domain", &self.domain)
            .field("max_snapshots", &self.max_snapshots)
            .finish_non_exhaustive()
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

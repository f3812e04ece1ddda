//! # Diagnostics Boundary
//!
//! The framework reports everything it swallows through a sink: logs,
//! metrics, alerts and traces. Where that output ends up is the host's
//! business.
//!
//! ## Contract
//!
//! ```text
//! framework ──> Diagnostics (catch_unwind) ──> dyn DiagnosticsSink
//!                                                ├─ TracingSink  (default)
//!                                                ├─ MemorySink   (tests, debug UI)
//!                                                └─ ChannelSink  (off-thread shipping)
//! ```
//!
//! Sink calls must not block and must not fail back into the caller. The
//! [`Diagnostics`] handle enforces the second half: a panicking sink is
//! contained and the record is lost.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

/// Well-known status strings attached to log records.
pub mod status {
    /// A guarded mutation committed.
    pub const COMMITTED: &str = "committed";
    /// A guarded mutation rolled back.
    pub const ROLLED_BACK: &str = "rolled back";
    /// A duplicate idempotency key skipped the mutation.
    pub const IDEMPOTENT_SKIP: &str = "idempotent skip";
    /// An event reached its subscribers.
    pub const DELIVERED: &str = "delivered";
    /// Middleware suppressed an event.
    pub const DROPPED: &str = "dropped";
    /// A failed attempt will be retried.
    pub const RETRYING: &str = "retrying";
    /// All attempts failed.
    pub const EXHAUSTED: &str = "exhausted";
    /// A pending request passed its deadline.
    pub const TIMED_OUT: &str = "timed out";
    /// A pending request was cancelled.
    pub const CANCELLED: &str = "cancelled";
}

/// Severity of a log record or alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Very verbose internals.
    Trace,
    /// Developer diagnostics.
    Debug,
    /// Normal operation.
    Info,
    /// Recovered problem.
    Warning,
    /// Failed operation.
    Error,
    /// Needs a human.
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A structured log record, borrowed for the duration of the sink call.
#[derive(Clone, Copy, Debug)]
pub struct LogRecord<'a> {
    /// Severity.
    pub level: LogLevel,
    /// Human readable message.
    pub message: &'a str,
    /// Originating capability or component.
    pub source: &'a str,
    /// Capability or resource acted upon.
    pub target: &'a str,
    /// Operation name.
    pub operation: &'a str,
    /// Outcome, see [`status`].
    pub status: Option<&'a str>,
}

/// An alert, borrowed for the duration of the sink call.
#[derive(Clone, Copy, Debug)]
pub struct AlertRecord<'a> {
    /// Severity.
    pub level: LogLevel,
    /// Human readable message.
    pub message: &'a str,
    /// Originating capability or component.
    pub source: &'a str,
    /// Capability or resource acted upon.
    pub target: &'a str,
    /// Operation name.
    pub operation: &'a str,
}

/// The external diagnostics collaborator.
///
/// Implementations must return promptly; queue or drop rather than block.
pub trait DiagnosticsSink: Send + Sync {
    /// Records a log line.
    fn log(&self, record: &LogRecord<'_>);

    /// Records a numeric sample.
    fn record_metric(&self, name: &str, value: f64);

    /// Raises an alert.
    fn alert(&self, alert: &AlertRecord<'_>);

    /// Records a trace point.
    fn trace(&self, operation: &str, message: &str, source: &str, target: &str);
}

// ============================================================================
// Diagnostics handle
// ============================================================================

/// Panic-proof handle the framework uses to talk to its sink.
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticsSink>,
}

impl Diagnostics {
    /// Wraps a sink.
    #[must_use]
    pub fn new(sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self { sink }
    }

    /// A handle that forwards to `tracing`.
    #[must_use]
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// The wrapped sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn DiagnosticsSink> {
        &self.sink
    }

    /// Forwards a log record.
    pub fn log(&self, record: &LogRecord<'_>) {
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| sink.log(record)));
    }

    /// Forwards a metric sample.
    pub fn metric(&self, name: &str, value: f64) {
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| sink.record_metric(name, value)));
    }

    /// Forwards an alert.
    pub fn alert(&self, alert: &AlertRecord<'_>) {
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| sink.alert(alert)));
    }

    /// Forwards a trace point.
    pub fn trace(&self, operation: &str, message: &str, source: &str, target: &str) {
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| {
            sink.trace(operation, message, source, target);
        }));
    }

    /// Shorthand for a log line with every field.
    pub fn emit(
        &self,
        level: LogLevel,
        message: &str,
        source: &str,
        target: &str,
        operation: &str,
        status: Option<&str>,
    ) {
        self.log(&LogRecord {
            level,
            message,
            source,
            target,
            operation,
            status,
        });
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}

// ============================================================================
// TracingSink
// ============================================================================

/// Forwards everything to `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn log(&self, r: &LogRecord<'_>) {
        let status = r.status.unwrap_or("");
        match r.level {
            LogLevel::Trace => tracing::trace!(
                source = r.source,
                target_cap = r.target,
                operation = r.operation,
                status,
                "{}",
                r.message
            ),
            LogLevel::Debug => tracing::debug!(
                source = r.source,
                target_cap = r.target,
                operation = r.operation,
                status,
                "{}",
                r.message
            ),
            LogLevel::Info => tracing::info!(
                source = r.source,
                target_cap = r.target,
                operation = r.operation,
                status,
                "{}",
                r.message
            ),
            LogLevel::Warning => tracing::warn!(
                source = r.source,
                target_cap = r.target,
                operation = r.operation,
                status,
                "{}",
                r.message
            ),
            LogLevel::Error | LogLevel::Critical => tracing::error!(
                source = r.source,
                target_cap = r.target,
                operation = r.operation,
                status,
                "{}",
                r.message
            ),
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        tracing::trace!(metric = name, value, "metric");
    }

    fn alert(&self, a: &AlertRecord<'_>) {
        tracing::error!(
            alert = true,
            level = %a.level,
            source = a.source,
            target_cap = a.target,
            operation = a.operation,
            "{}",
            a.message
        );
    }

    fn trace(&self, operation: &str, message: &str, source: &str, target: &str) {
        tracing::trace!(operation, source, target_cap = target, "{}", message);
    }
}

// ============================================================================
// Owned records (MemorySink / ChannelSink)
// ============================================================================

/// Owned copy of a [`LogRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedLog {
    /// Severity.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Source.
    pub source: String,
    /// Target.
    pub target: String,
    /// Operation.
    pub operation: String,
    /// Status.
    pub status: Option<String>,
}

impl From<&LogRecord<'_>> for CapturedLog {
    fn from(r: &LogRecord<'_>) -> Self {
        Self {
            level: r.level,
            message: r.message.to_owned(),
            source: r.source.to_owned(),
            target: r.target.to_owned(),
            operation: r.operation.to_owned(),
            status: r.status.map(str::to_owned),
        }
    }
}

/// Owned copy of an [`AlertRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedAlert {
    /// Severity.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Source.
    pub source: String,
    /// Target.
    pub target: String,
    /// Operation.
    pub operation: String,
}

impl From<&AlertRecord<'_>> for CapturedAlert {
    fn from(a: &AlertRecord<'_>) -> Self {
        Self {
            level: a.level,
            message: a.message.to_owned(),
            source: a.source.to_owned(),
            target: a.target.to_owned(),
            operation: a.operation.to_owned(),
        }
    }
}

/// Any record a sink can receive.
#[derive(Clone, Debug, PartialEq)]
pub enum DiagnosticRecord {
    /// A log line.
    Log(CapturedLog),
    /// A metric sample.
    Metric {
        /// Metric name.
        name: String,
        /// Sample value.
        value: f64,
    },
    /// An alert.
    Alert(CapturedAlert),
    /// A trace point.
    Trace {
        /// Operation.
        operation: String,
        /// Message.
        message: String,
        /// Source.
        source: String,
        /// Target.
        target: String,
    },
}

// ============================================================================
// MemorySink
// ============================================================================

/// Keeps every record in memory.
///
/// The assertion surface for tests, and a cheap backing store for debug UIs.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().clone()
    }

    /// All log lines.
    #[must_use]
    pub fn logs(&self) -> Vec<CapturedLog> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                DiagnosticRecord::Log(log) => Some(log.clone()),
                _ => None,
            })
            .collect()
    }

    /// Log lines at exactly `level`.
    #[must_use]
    pub fn logs_at(&self, level: LogLevel) -> Vec<CapturedLog> {
        self.logs().into_iter().filter(|l| l.level == level).collect()
    }

    /// Log lines carrying `status`.
    #[must_use]
    pub fn logs_with_status(&self, status: &str) -> Vec<CapturedLog> {
        self.logs()
            .into_iter()
            .filter(|l| l.status.as_deref() == Some(status))
            .collect()
    }

    /// All alerts.
    #[must_use]
    pub fn alerts(&self) -> Vec<CapturedAlert> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                DiagnosticRecord::Alert(alert) => Some(alert.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sum of every sample recorded under `name`.
    #[must_use]
    pub fn metric_total(&self, name: &str) -> f64 {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                DiagnosticRecord::Metric { name: n, value } if n == name => Some(*value),
                _ => None,
            })
            .sum()
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl DiagnosticsSink for MemorySink {
    fn log(&self, record: &LogRecord<'_>) {
        self.records.lock().push(DiagnosticRecord::Log(record.into()));
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.records.lock().push(DiagnosticRecord::Metric {
            name: name.to_owned(),
            value,
        });
    }

    fn alert(&self, alert: &AlertRecord<'_>) {
        self.records.lock().push(DiagnosticRecord::Alert(alert.into()));
    }

    fn trace(&self, operation: &str, message: &str, source: &str, target: &str) {
        self.records.lock().push(DiagnosticRecord::Trace {
            operation: operation.to_owned(),
            message: message.to_owned(),
            source: source.to_owned(),
            target: target.to_owned(),
        });
    }
}

// ============================================================================
// ChannelSink
// ============================================================================

/// Ships records to another thread over a bounded channel.
///
/// Never blocks: when the channel is full the record is dropped and counted.
pub struct ChannelSink {
    sender: Sender<DiagnosticRecord>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Creates a sink and the receiving end for the shipping thread.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<DiagnosticRecord>) {
        let (sender, receiver) = bounded(capacity.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// Records lost to a full (or disconnected) channel.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, record: DiagnosticRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl DiagnosticsSink for ChannelSink {
    fn log(&self, record: &LogRecord<'_>) {
        self.push(DiagnosticRecord::Log(record.into()));
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.push(DiagnosticRecord::Metric {
            name: name.to_owned(),
            value,
        });
    }

    fn alert(&self, alert: &AlertRecord<'_>) {
        self.push(DiagnosticRecord::Alert(alert.into()));
    }

    fn trace(&self, operation: &str, message: &str, source: &str, target: &str) {
        self.push(DiagnosticRecord::Trace {
            operation: operation.to_owned(),
            message: message.to_owned(),
            source: source.to_owned(),
            target: target.to_owned(),
        });
    }
}

//! # Integration Error Types
//!
//! All caller-visible errors of the integration framework.
//!
//! ## Propagation Policy
//!
//! - **Lookup, validation, snapshot and transaction errors** are returned to
//!   the immediate caller.
//! - **Delivery errors** never reach the publisher. They are reported through
//!   the diagnostics sink and surface here only as the payload of a
//!   [`crate::bus::DeliveryStatus`] or a request callback.
//! - **Conflicts** are not errors at all: the resolver decides.

use std::fmt;
use thiserror::Error;

use crate::broker::CorrelationId;
use crate::state::SnapshotStamp;
use crate::transaction::TransactionId;

/// Phase of a state commit in which a validator rejected the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationStage {
    /// Rejected before the value was committed.
    Pre,
    /// Rejected after commit; the container rolled back.
    Post,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => f.write_str("pre-validation"),
            Self::Post => f.write_str("post-validation"),
        }
    }
}

/// Errors that can occur in the integration framework.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// No provider is bound to the requested capability.
    #[error("capability not registered: {capability}")]
    CapabilityNotRegistered {
        /// Type name of the capability that was looked up.
        capability: &'static str,
    },

    /// A state validator refused the proposed value.
    #[error("{stage} rejected state for {domain}: {reason}")]
    ValidationRejected {
        /// State domain the container synchronizes.
        domain: String,
        /// Which validator rejected.
        stage: ValidationStage,
        /// Reason reported by the validator.
        reason: String,
    },

    /// Operation needs a committed value but the container is empty.
    #[error("state {domain} has no committed value yet")]
    StateUninitialized {
        /// State domain the container synchronizes.
        domain: String,
    },

    /// No snapshot with the given stamp is retained.
    #[error("snapshot not found: {stamp} in {domain}")]
    SnapshotNotFound {
        /// State domain the container synchronizes.
        domain: String,
        /// Stamp that was requested.
        stamp: SnapshotStamp,
    },

    /// A guarded mutation failed and was rolled back.
    #[error("transaction {transaction_id} ({operation}) rolled back: {reason}")]
    TransactionRolledBack {
        /// Journal id of the failed transaction.
        transaction_id: TransactionId,
        /// Operation name supplied by the caller.
        operation: String,
        /// Reason for rollback.
        reason: String,
    },

    /// A pending request reached its deadline without a response.
    #[error("request {0} timed out")]
    RequestTimedOut(CorrelationId),

    /// A pending request was cancelled before a response arrived.
    #[error("request {id} cancelled: {reason}")]
    RequestCancelled {
        /// Correlation id of the cancelled request.
        id: CorrelationId,
        /// Why it was cancelled.
        reason: String,
    },

    /// A response handle was dropped by the broker without a value.
    #[error("request {0} completion slot closed")]
    CompletionClosed(CorrelationId),

    /// Every delivery attempt failed.
    #[error("delivery exhausted after {attempts} attempts: {last_error}")]
    DeliveryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O failure while loading configuration.
    #[error("io error: {0}")]
    Io(String),
}

/// Result type for integration operations.
pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// Failure reported by an event handler.
///
/// Handlers return this instead of panicking; the bus records it, retries if
/// asked to, and never hands it back to the publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Creates a handler error from any displayable reason.
    #[must_use]
    pub fn new(reason: impl fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self(reason.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<IntegrationError> for HandlerError {
    fn from(err: IntegrationError) -> Self {
        Self(err.to_string())
    }
}

/// Result type returned by event handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_owned()
    }
}

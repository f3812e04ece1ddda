//! # Bus Middleware
//!
//! Ordered transforms every event passes through before delivery.
//!
//! A middleware either hands the (possibly rewritten) event on, or drops it
//! explicitly. There is no implicit "None means drop".

use std::fmt;

/// What a middleware decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MiddlewareOutcome<E> {
    /// Keep going with this event.
    Continue(E),
    /// Suppress delivery.
    Drop {
        /// Why the event was dropped (logged).
        reason: String,
    },
}

impl<E> MiddlewareOutcome<E> {
    /// Shorthand for [`MiddlewareOutcome::Drop`].
    #[must_use]
    pub fn drop_with(reason: impl fmt::Display) -> Self {
        Self::Drop {
            reason: reason.to_string(),
        }
    }
}

/// A stage in the publish pipeline.
pub trait Middleware<E>: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "middleware"
    }

    /// Transforms or drops an event.
    fn process(&self, event: E) -> MiddlewareOutcome<E>;
}

/// Adapts a closure into a named middleware.
pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

impl<F> FnMiddleware<F> {
    /// Wraps `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<E, F> Middleware<E> for FnMiddleware<F>
where
    F: Fn(E) -> MiddlewareOutcome<E> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, event: E) -> MiddlewareOutcome<E> {
        (self.f)(event)
    }
}

/// Drops events for which the predicate returns `false`.
pub struct FilterMiddleware<P> {
    name: String,
    predicate: P,
}

impl<P> FilterMiddleware<P> {
    /// Keeps only events accepted by `predicate`.
    pub fn new(name: impl Into<String>, predicate: P) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<E, P> Middleware<E> for FilterMiddleware<P>
where
    P: Fn(&E) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, event: E) -> MiddlewareOutcome<E> {
        if (self.predicate)(&event) {
            MiddlewareOutcome::Continue(event)
        } else {
            MiddlewareOutcome::drop_with(format!("filtered by {}", self.name))
        }
    }
}

//! Partial in-place updates for large state values.

/// A reversible partial change to a `T`.
///
/// `revert` must undo exactly what a successful `apply` did; the container
/// uses it to roll back when validation rejects the result. It is also
/// called when `apply` panics, so it must tolerate a partially applied
/// change.
pub trait StateDelta<T>: Send + Sync {
    /// Applies the change in place.
    ///
    /// # Errors
    ///
    /// Returns a reason if the change cannot be applied. The value must be
    /// left untouched in that case.
    fn apply(&self, state: &mut T) -> Result<(), String>;

    /// Undoes a successful [`apply`](Self::apply).
    fn revert(&self, state: &mut T);

    /// Short label for diagnostics.
    fn describe(&self) -> String {
        "delta".to_owned()
    }
}

/// Delta built from a pair of closures.
pub struct FnDelta<A, R> {
    label: String,
    apply: A,
    revert: R,
}

impl<A, R> FnDelta<A, R> {
    /// Creates a delta from an apply and a revert closure.
    pub fn new(label: impl Into<String>, apply: A, revert: R) -> Self {
        Self {
            label: label.into(),
            apply,
            revert,
        }
    }
}

impl<T, A, R> StateDelta<T> for FnDelta<A, R>
where
    A: Fn(&mut T) -> Result<(), String> + Send + Sync,
    R: Fn(&mut T) + Send + Sync,
{
    fn apply(&self, state: &mut T) -> Result<(), String> {
        (self.apply)(state)
    }

    fn revert(&self, state: &mut T) {
        (self.revert)(state);
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

//! # Capability Registry
//!
//! Binds an abstract capability ("the inventory system") to exactly one
//! concrete provider.
//!
//! The key is the `TypeId` of the capability type, normally a trait object:
//!
//! ```rust,ignore
//! registry.register::<dyn InventoryCapability>(Arc::new(my_inventory));
//! let inventory = registry.resolve::<dyn InventoryCapability>()?;
//! ```
//!
//! ## Rules
//!
//! - Last registration wins; the replaced provider is handed back.
//! - Unregistered lookups fail with `CapabilityNotRegistered`, never a default.
//! - No lease is held across calls: two successive `resolve` calls may return
//!   different providers if someone re-registered in between.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::diagnostics::{Diagnostics, LogLevel};
use crate::error::{IntegrationError, IntegrationResult};

/// A stored binding.
struct Binding {
    /// `Box<Arc<C>>` erased.
    provider: Box<dyn Any + Send + Sync>,
    /// Capability type name, for logs and listings.
    name: &'static str,
    /// When the binding was made.
    registered_at: SystemTime,
}

/// Description of a live binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingInfo {
    /// Capability type name.
    pub capability: &'static str,
    /// When the current provider was registered.
    pub registered_at: SystemTime,
}

/// Process-local capability table.
///
/// Constructed explicitly and passed around inside the
/// [`crate::IntegrationContext`]; there is no global instance.
pub struct CapabilityRegistry {
    bindings: RwLock<HashMap<TypeId, Binding>>,
    diagnostics: Diagnostics,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            diagnostics,
        }
    }

    /// Binds `provider` to capability `C`, replacing any existing binding.
    ///
    /// Returns the provider that was replaced, if any.
    pub fn register<C>(&self, provider: Arc<C>) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let name = type_name::<C>();
        let binding = Binding {
            provider: Box::new(provider),
            name,
            registered_at: SystemTime::now(),
        };

        let previous = self.bindings.write().insert(TypeId::of::<C>(), binding);
        let replaced = previous.and_then(|b| b.provider.downcast::<Arc<C>>().ok().map(|p| *p));

        let message = if replaced.is_some() {
            "capability provider replaced"
        } else {
            "capability registered"
        };
        self.diagnostics
            .emit(LogLevel::Info, message, "registry", name, "register", None);

        replaced
    }

    /// Looks up the provider for capability `C`.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::CapabilityNotRegistered` if nothing is bound.
    pub fn resolve<C>(&self) -> IntegrationResult<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.bindings
            .read()
            .get(&TypeId::of::<C>())
            .and_then(|b| b.provider.downcast_ref::<Arc<C>>())
            .cloned()
            .ok_or(IntegrationError::CapabilityNotRegistered {
                capability: type_name::<C>(),
            })
    }

    /// Removes the binding for `C`. Returns `false` if there was none.
    pub fn unregister<C>(&self) -> bool
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let removed = self.bindings.write().remove(&TypeId::of::<C>()).is_some();
        if removed {
            self.diagnostics.emit(
                LogLevel::Info,
                "capability unregistered",
                "registry",
                type_name::<C>(),
                "unregister",
                None,
            );
        }
        removed
    }

    /// Whether `C` currently has a provider.
    #[must_use]
    pub fn is_registered<C>(&self) -> bool
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.bindings.read().contains_key(&TypeId::of::<C>())
    }

    /// Number of bound capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// Whether nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Lists live bindings, sorted by capability name.
    #[must_use]
    pub fn capabilities(&self) -> Vec<BindingInfo> {
        let mut infos: Vec<BindingInfo> = self
            .bindings
            .read()
            .values()
            .map(|b| BindingInfo {
                capability: b.name,
                registered_at: b.registered_at,
            })
            .collect();
        infos.sort_by_key(|i| i.capability);
        infos
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(Diagnostics::default())
    }
}

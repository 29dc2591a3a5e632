//! [`SecurityProvider`] – security contexts for driver sandboxes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use devframe_types::{DriverError, Permissions};
use tracing::debug;

/// Opaque identifier of a security context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecurityContextId(pub u64);

impl fmt::Display for SecurityContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Security / MAC engine as seen by the sandbox manager.
pub trait SecurityProvider: Send + Sync {
    /// Create a fresh context labelled with the owning driver's name.
    fn create_context(&self, label: &str) -> Result<SecurityContextId, DriverError>;

    /// Release a context. Unknown ids are ignored.
    fn destroy_context(&self, context: SecurityContextId);

    /// Restrict `context` to `permissions`.
    fn apply_permissions(
        &self,
        context: SecurityContextId,
        permissions: Permissions,
    ) -> Result<(), DriverError>;
}

/// Provider that grants every request and only keeps bookkeeping.
///
/// Used when the platform has no policy engine.
#[derive(Debug, Default)]
pub struct PermissiveSecurity {
    next_id: AtomicU64,
    contexts: Mutex<HashMap<SecurityContextId, (String, Permissions)>>,
}

impl PermissiveSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contexts created and not yet destroyed.
    pub fn live_contexts(&self) -> usize {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl SecurityProvider for PermissiveSecurity {
    fn create_context(&self, label: &str) -> Result<SecurityContextId, DriverError> {
        let id = SecurityContextId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (label.to_string(), Permissions::empty()));
        debug!(context = %id, label, "security context created");
        Ok(id)
    }

    fn destroy_context(&self, context: SecurityContextId) {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&context);
    }

    fn apply_permissions(
        &self,
        context: SecurityContextId,
        permissions: Permissions,
    ) -> Result<(), DriverError> {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = contexts.get_mut(&context).ok_or(DriverError::NoDevice)?;
        entry.1 = permissions;
        Ok(())
    }
}

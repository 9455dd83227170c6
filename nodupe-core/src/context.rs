//! Explicit dependency bundle passed to every component.
//!
//! There are no process-wide singletons; configuration, the backend
//! registry and the root cancellation token all travel on this context.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::cancel::CancelToken;
use crate::config::CoreConfig;
use crate::error::Result;
use crate::registry::BackendRegistry;

/// Shared core state. Cheap to clone; components receive it by reference
/// or clone at spawn points.
#[derive(Clone)]
pub struct CoreContext {
    config: Arc<CoreConfig>,
    registry: Arc<BackendRegistry>,
    cancel: CancelToken,
    /// Coarse lock serializing filesystem mutation: apply and rollback
    /// must not run concurrently against overlapping file sets.
    apply_lock: Arc<Mutex<()>>,
}

impl CoreContext {
    /// Validate the configuration and assemble a context with the built-in
    /// backend registry.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(BackendRegistry::builtin()),
            cancel: CancelToken::new(),
            apply_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn with_registry(config: CoreConfig, registry: BackendRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            cancel: CancelToken::new(),
            apply_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// The root cancellation token; cancelling it stops every operation
    /// running under this context.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Child token for a single operation.
    pub fn child_token(&self) -> CancelToken {
        self.cancel.child()
    }

    /// Hold for the whole duration of an apply or rollback transaction.
    pub fn mutation_guard(&self) -> MutexGuard<'_, ()> {
        self.apply_lock.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_config() {
        let mut config = CoreConfig::default();
        config.scan.batch_size = 0;
        assert!(CoreContext::new(config).is_err());
    }

    #[test]
    fn cancel_propagates_to_children() {
        let ctx = CoreContext::new(CoreConfig::default()).unwrap();
        let child = ctx.child_token();
        ctx.cancel_token().cancel();
        assert!(child.is_cancelled());
    }
}

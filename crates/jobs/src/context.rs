//! Deployment context resolution.
//!
//! Jobs run inside the deployment they belong to. The embedding application
//! supplies a [`DeploymentContextProvider`]; the dispatcher enters it before a
//! batch touches any job payload.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::RwLock;

use stepflow_core::{DeploymentId, EngineError, EngineResult};

/// Capability to enter the context of a deployment.
pub trait DeploymentContextProvider: Send + Sync {
    /// Run `work` inside the context of `deployment_id` (`None` = engine context).
    ///
    /// Returns `Infrastructure` without running `work` when the deployment
    /// cannot be resolved.
    fn run_in_context(
        &self,
        deployment_id: Option<DeploymentId>,
        work: &mut dyn FnMut(),
    ) -> EngineResult<()>;
}

/// Provider that runs every batch directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAvailable;

impl DeploymentContextProvider for AlwaysAvailable {
    fn run_in_context(
        &self,
        _deployment_id: Option<DeploymentId>,
        work: &mut dyn FnMut(),
    ) -> EngineResult<()> {
        work();
        Ok(())
    }
}

thread_local! {
    static CURRENT_DEPLOYMENT: Cell<Option<DeploymentId>> = const { Cell::new(None) };
}

/// Tracks installed deployments and exposes the one a thread is running in.
#[derive(Debug, Default)]
pub struct DeploymentRegistry {
    installed: RwLock<HashSet<DeploymentId>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, deployment_id: DeploymentId) {
        let mut installed = self.installed.write().unwrap_or_else(|p| p.into_inner());
        installed.insert(deployment_id);
    }

    pub fn uninstall(&self, deployment_id: DeploymentId) -> bool {
        let mut installed = self.installed.write().unwrap_or_else(|p| p.into_inner());
        installed.remove(&deployment_id)
    }

    pub fn is_installed(&self, deployment_id: DeploymentId) -> bool {
        let installed = self.installed.read().unwrap_or_else(|p| p.into_inner());
        installed.contains(&deployment_id)
    }

    /// Deployment whose context the calling thread is in.
    pub fn current() -> Option<DeploymentId> {
        CURRENT_DEPLOYMENT.with(|c| c.get())
    }
}

/// Restores the previous thread context on drop, also when `work` panics.
struct ContextGuard {
    previous: Option<DeploymentId>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_DEPLOYMENT.with(|c| c.set(self.previous));
    }
}

impl DeploymentContextProvider for DeploymentRegistry {
    fn run_in_context(
        &self,
        deployment_id: Option<DeploymentId>,
        work: &mut dyn FnMut(),
    ) -> EngineResult<()> {
        if let Some(id) = deployment_id {
            if !self.is_installed(id) {
                return Err(EngineError::infrastructure(format!(
                    "deployment {id} is not installed"
                )));
            }
        }
        let _guard = ContextGuard {
            previous: CURRENT_DEPLOYMENT.with(|c| c.replace(deployment_id)),
        };
        work();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_deployment_is_not_entered() {
        let registry = DeploymentRegistry::new();
        let mut ran = false;
        let err = registry
            .run_in_context(Some(DeploymentId::new()), &mut || ran = true)
            .unwrap_err();
        assert!(matches!(err, EngineError::Infrastructure(_)));
        assert!(!ran);
    }

    #[test]
    fn context_is_visible_inside_and_restored_after() {
        let registry = DeploymentRegistry::new();
        let deployment = DeploymentId::new();
        registry.install(deployment);

        let mut seen = None;
        registry
            .run_in_context(Some(deployment), &mut || seen = DeploymentRegistry::current())
            .unwrap();
        assert_eq!(seen, Some(deployment));
        assert_eq!(DeploymentRegistry::current(), None);
    }

    #[test]
    fn engine_context_needs_no_deployment() {
        let registry = DeploymentRegistry::new();
        let mut ran = false;
        registry.run_in_context(None, &mut || ran = true).unwrap();
        assert!(ran);
    }

    #[test]
    fn uninstall_makes_deployment_unavailable() {
        let registry = DeploymentRegistry::new();
        let deployment = DeploymentId::new();
        registry.install(deployment);
        assert!(registry.uninstall(deployment));
        assert!(registry
            .run_in_context(Some(deployment), &mut || {})
            .is_err());
    }
}

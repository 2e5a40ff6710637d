use std::fmt;
use std::sync::Arc;

use unitscope_core::{ContextRef, RepositoryType, ScopeResult};

use crate::config::ScopeConfig;
use crate::engine::{self, ScopeEngine};
use crate::factory::RepositoryFactory;
use crate::provider::ContextProvider;
use crate::scope::{Scope1, Scope2, Scope3, ScopeFactory};

/// Entry point: owns the collaborators and configuration and hands out scopes.
///
/// Cloning is cheap; clones share one engine.
#[derive(Clone)]
pub struct ScopeService {
    engine: Arc<ScopeEngine>,
}

impl ScopeService {
    /// Build a service over a facade factory and a context provider.
    pub fn new<F, P>(factory: F, provider: P, config: ScopeConfig) -> Self
    where
        F: RepositoryFactory + 'static,
        P: ContextProvider + 'static,
    {
        Self {
            engine: Arc::new(ScopeEngine::new(
                Box::new(factory),
                Box::new(provider),
                config,
            )),
        }
    }

    /// Configuration shared by every scope of this service.
    pub fn config(&self) -> &ScopeConfig {
        self.engine.config()
    }

    /// Scope over one facade.
    pub fn create_scope<R1: 'static>(&self) -> Scope1<R1> {
        Scope1::new(self.engine.clone())
    }

    /// Scope over two facades that must share one context type.
    pub fn create_scope2<R1: 'static, R2: 'static>(&self) -> Scope2<R1, R2> {
        Scope2::new(self.engine.clone())
    }

    /// Scope over three facades that must share one context type.
    pub fn create_scope3<R1: 'static, R2: 'static, R3: 'static>(&self) -> Scope3<R1, R2, R3> {
        Scope3::new(self.engine.clone())
    }

    /// Factory for one-facade scopes; clones can move to other threads.
    pub fn scope_factory<R1: 'static>(&self) -> ScopeFactory<Scope1<R1>> {
        ScopeFactory::new(self.engine.clone(), Scope1::new)
    }

    /// Factory for two-facade scopes.
    pub fn scope_factory2<R1: 'static, R2: 'static>(&self) -> ScopeFactory<Scope2<R1, R2>> {
        ScopeFactory::new(self.engine.clone(), Scope2::new)
    }

    /// Factory for three-facade scopes.
    pub fn scope_factory3<R1: 'static, R2: 'static, R3: 'static>(
        &self,
    ) -> ScopeFactory<Scope3<R1, R2, R3>> {
        ScopeFactory::new(self.engine.clone(), Scope3::new)
    }

    /// Seed the store behind facade `R` through a fresh context, then dispose it.
    pub fn seed<R: 'static>(&self) -> ScopeResult<()> {
        self.engine.seed(RepositoryType::of::<R>())
    }

    /// The context published on the calling thread, if a scope call is running.
    pub fn current_context() -> Option<ContextRef> {
        engine::current_context()
    }
}

impl fmt::Debug for ScopeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeService")
            .field("config", self.engine.config())
            .finish()
    }
}

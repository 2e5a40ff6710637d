//! Repository factories: binding a facade instance to a context.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use unitscope_core::{Context, ContextRef, RepositoryType, ScopeError, ScopeResult};

/// Creates the facade for `repository`, bound to `context`.
///
/// The returned box must hold a value of exactly the facade type; the engine
/// reports [`ScopeError::FactoryMismatch`] otherwise.
pub trait RepositoryFactory: Send + Sync {
    fn create(&self, repository: RepositoryType, context: &ContextRef) -> ScopeResult<Box<dyn Any>>;
}

impl<F> RepositoryFactory for F
where
    F: Fn(RepositoryType, &ContextRef) -> ScopeResult<Box<dyn Any>> + Send + Sync,
{
    fn create(&self, repository: RepositoryType, context: &ContextRef) -> ScopeResult<Box<dyn Any>> {
        self(repository, context)
    }
}

type Maker = Box<dyn Fn(&ContextRef) -> ScopeResult<Box<dyn Any>> + Send + Sync>;

/// Typed registry of facade constructors keyed by facade type.
#[derive(Default)]
pub struct RepositoryRegistry {
    makers: HashMap<TypeId, (RepositoryType, Maker)>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for facade `R` that accepts any context.
    /// A later registration for the same `R` replaces the earlier one.
    pub fn register<R, F>(mut self, make: F) -> Self
    where
        R: 'static,
        F: Fn(&ContextRef) -> ScopeResult<R> + Send + Sync + 'static,
    {
        let repository = RepositoryType::of::<R>();
        let maker: Maker = Box::new(move |ctx| make(ctx).map(|r| Box::new(r) as Box<dyn Any>));
        self.makers.insert(repository.id(), (repository, maker));
        self
    }

    /// Register a constructor for facade `R` that needs the concrete context `C`.
    pub fn register_for_context<R, C, F>(self, make: F) -> Self
    where
        R: 'static,
        C: Context,
        F: Fn(Rc<C>) -> ScopeResult<R> + Send + Sync + 'static,
    {
        self.register::<R, _>(move |ctx: &ContextRef| match ctx.downcast::<C>() {
            Some(typed) => make(typed),
            None => Err(ScopeError::IncompatibleRepositories {
                repository: RepositoryType::of::<R>(),
                context: ctx.context_type(),
            }),
        })
    }

    pub fn contains<R: 'static>(&self) -> bool {
        self.makers.contains_key(&TypeId::of::<R>())
    }

    pub fn len(&self) -> usize {
        self.makers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.makers.is_empty()
    }
}

impl RepositoryFactory for RepositoryRegistry {
    fn create(&self, repository: RepositoryType, context: &ContextRef) -> ScopeResult<Box<dyn Any>> {
        match self.makers.get(&repository.id()) {
            Some((_, make)) => make(context),
            None => Err(ScopeError::UnknownRepository { repository }),
        }
    }
}

impl fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.makers.values().map(|(repository, _)| repository))
            .finish()
    }
}

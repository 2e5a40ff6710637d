//! Context providers: where a scope gets a fresh context for a facade type.

use std::fmt;

use unitscope_core::{ContextRef, RepositoryType};

/// Yields a context able to serve the given repository facade type, if any.
pub trait ContextProvider: Send + Sync {
    fn context_for(&self, repository: RepositoryType) -> Option<ContextRef>;
}

impl<F> ContextProvider for F
where
    F: Fn(RepositoryType) -> Option<ContextRef> + Send + Sync,
{
    fn context_for(&self, repository: RepositoryType) -> Option<ContextRef> {
        self(repository)
    }
}

type ProviderFn = Box<dyn Fn(RepositoryType) -> Option<ContextRef> + Send + Sync>;

/// Ordered composite of provider functions; the first `Some` wins.
///
/// ```
/// use unitscope::{MultiSourceContextProvider, ContextProvider, RepositoryType};
///
/// let provider = MultiSourceContextProvider::new()
///     .with_source(|_| None)
///     .with_source(|_| None);
/// assert_eq!(provider.len(), 2);
/// assert!(provider.context_for(RepositoryType::of::<String>()).is_none());
/// ```
#[derive(Default)]
pub struct MultiSourceContextProvider {
    sources: Vec<ProviderFn>,
}

impl MultiSourceContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source<F>(mut self, source: F) -> Self
    where
        F: Fn(RepositoryType) -> Option<ContextRef> + Send + Sync + 'static,
    {
        self.push_source(source);
        self
    }

    pub fn push_source<F>(&mut self, source: F)
    where
        F: Fn(RepositoryType) -> Option<ContextRef> + Send + Sync + 'static,
    {
        self.sources.push(Box::new(source));
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ContextProvider for MultiSourceContextProvider {
    fn context_for(&self, repository: RepositoryType) -> Option<ContextRef> {
        self.sources.iter().find_map(|source| source(repository))
    }
}

impl fmt::Debug for MultiSourceContextProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiSourceContextProvider")
            .field("sources", &self.sources.len())
            .finish()
    }
}

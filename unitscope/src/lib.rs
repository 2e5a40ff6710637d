#![forbid(unsafe_code)]
//! Unit-of-work scopes over one, two or three repository facades.
//!
//! A [`ScopeService`] is built from a [`RepositoryFactory`], a
//! [`ContextProvider`] and a [`ScopeConfig`]. Every scope it hands out binds
//! all of its facades to a single context, runs work inside a transaction
//! boundary, commits, and releases the context when the outermost call on the
//! thread returns. Nested calls on the same thread reuse the context in
//! effect, provided their facades resolve to the same context type.
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use unitscope::{
//!     Context, ContextRef, RepositoryRegistry, RepositoryType, ScopeConfig, ScopeResult,
//!     ScopeService,
//! };
//!
//! struct Counter {
//!     commits: Cell<u32>,
//! }
//!
//! impl Context for Counter {
//!     fn commit(&self) -> ScopeResult<()> {
//!         self.commits.set(self.commits.get() + 1);
//!         Ok(())
//!     }
//! }
//!
//! struct Tally {
//!     counter: Rc<Counter>,
//! }
//!
//! let registry = RepositoryRegistry::new()
//!     .register_for_context(|counter: Rc<Counter>| Ok(Tally { counter }));
//! let provider = |_: RepositoryType| {
//!     Some(ContextRef::new(Counter { commits: Cell::new(0) }))
//! };
//! let service = ScopeService::new(registry, provider, ScopeConfig::default());
//!
//! let scope = service.create_scope::<Tally>();
//! let commits = scope
//!     .commit_with(|_tally| Ok(0))
//!     .non_committing(|tally| Ok(tally.counter.commits.get()))
//!     .run()
//!     .unwrap();
//! assert_eq!(commits, 1);
//! assert!(scope.current_context().is_none());
//! ```

mod config;
mod engine;
mod factory;
mod obs;
mod provider;
mod scope;
mod service;

pub use config::ScopeConfig;
#[cfg(feature = "serde")]
pub use config::{RetrySettings, ScopeSettings};
pub use engine::{RepositorySet, RepositoryTypes};
pub use factory::{RepositoryFactory, RepositoryRegistry};
pub use provider::{ContextProvider, MultiSourceContextProvider};
pub use scope::{Commit, Scope1, Scope2, Scope3, ScopeFactory};
pub use service::ScopeService;

// Re-export the core building blocks so users need only this crate.
pub use unitscope_core::{
    BoxError, ConcurrencyError, ConflictClassifier, ConflictKind, Context, ContextRef, ContextType,
    ErrorCodeClassifier, RepositoryType, ScopeError, ScopeResult, StoreError,
};
pub use unitscope_core::{conflict, execution, transactions};

//! Strongly typed scope handles for one, two and three repository facades.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use unitscope_core::{ContextRef, RepositoryType, ScopeResult};

use crate::engine::{self, RepositorySet, RepositoryTypes, ScopeEngine};

type Callback<'s, Rs, T> = Box<dyn FnOnce(&<Rs as RepositorySet>::Facades) -> ScopeResult<T> + 's>;
type Work<'s, Rs, T> = Box<dyn FnMut(&<Rs as RepositorySet>::Facades) -> ScopeResult<T> + 's>;

/// Arity-independent half of every scope: the shared engine plus the cached
/// facade types.
struct ScopeCore<Rs> {
    engine: Arc<ScopeEngine>,
    types: RepositoryTypes,
    _facades: PhantomData<fn() -> Rs>,
}

impl<Rs: RepositorySet> ScopeCore<Rs> {
    fn new(engine: Arc<ScopeEngine>) -> Self {
        Self {
            engine,
            types: Rs::repository_types(),
            _facades: PhantomData,
        }
    }
}

impl<Rs> Clone for ScopeCore<Rs> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            types: self.types.clone(),
            _facades: PhantomData,
        }
    }
}

/// A pending `commit`, configured with optional follow-up callbacks.
///
/// Obtained from `commit_with`; nothing runs until [`Commit::run`].
#[must_use = "a Commit does nothing until run() is called"]
pub struct Commit<'s, Rs: RepositorySet, T> {
    core: &'s ScopeCore<Rs>,
    work: Work<'s, Rs, T>,
    non_committing: Option<Callback<'s, Rs, T>>,
    on_conflict: Option<Callback<'s, Rs, T>>,
}

impl<'s, Rs: RepositorySet, T> Commit<'s, Rs, T> {
    /// Acquire, run the work and commit inside one transaction boundary, then
    /// run whichever follow-up callback applies.
    pub fn run(self) -> ScopeResult<T> {
        self.core.engine.commit::<Rs, T, _, _, _>(
            &self.core.types,
            self.work,
            self.non_committing,
            self.on_conflict,
        )
    }
}

impl<'s, Rs: RepositorySet, T> fmt::Debug for Commit<'s, Rs, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("repositories", &self.core.types)
            .field("non_committing", &self.non_committing.is_some())
            .field("on_concurrency_error", &self.on_conflict.is_some())
            .finish()
    }
}

macro_rules! scope_arity {
    ($(#[$doc:meta])* $scope:ident { $($R:ident . $idx:tt),+ }) => {
        $(#[$doc])*
        pub struct $scope<$($R: 'static),+> {
            core: ScopeCore<($($R,)+)>,
        }

        impl<$($R: 'static),+> $scope<$($R),+> {
            pub(crate) fn new(engine: Arc<ScopeEngine>) -> Self {
                Self {
                    core: ScopeCore::new(engine),
                }
            }

            /// Run `work` without committing the context.
            pub fn read_only<T, W>(&self, mut work: W) -> ScopeResult<T>
            where
                W: FnMut($(&$R),+) -> ScopeResult<T>,
            {
                self.core
                    .engine
                    .read_only::<($($R,)+), T, _>(&self.core.types, |f| work($(&f.$idx),+))
            }

            /// Run `work`, then commit the context. Concurrency conflicts
            /// propagate as [`crate::ScopeError::Concurrency`].
            pub fn commit<T, W>(&self, work: W) -> ScopeResult<T>
            where
                W: FnMut($(&$R),+) -> ScopeResult<T>,
            {
                self.commit_with(work).run()
            }

            /// Like [`Self::commit`], with follow-up callbacks configurable on
            /// the returned [`Commit`].
            pub fn commit_with<'s, T, W>(&'s self, mut work: W) -> Commit<'s, ($($R,)+), T>
            where
                W: FnMut($(&$R),+) -> ScopeResult<T> + 's,
            {
                Commit {
                    core: &self.core,
                    work: Box::new(move |f: &($($R,)+)| work($(&f.$idx),+)),
                    non_committing: None,
                    on_conflict: None,
                }
            }

            /// Build a lazy sequence over a context that is neither published
            /// nor disposed by the scope.
            pub fn query<I, Q>(&self, query: Q) -> ScopeResult<I>
            where
                I: Iterator,
                Q: FnOnce($(&$R),+) -> ScopeResult<I>,
            {
                self.core
                    .engine
                    .query::<($($R,)+), I, _>(&self.core.types, |f| query($(&f.$idx),+))
            }

            /// The context published on the calling thread, if any.
            pub fn current_context(&self) -> Option<ContextRef> {
                engine::current_context()
            }

            /// Facade types of this scope in declaration order.
            pub fn repository_types(&self) -> &[RepositoryType] {
                self.core.types.as_slice()
            }
        }

        impl<$($R: 'static),+> Clone for $scope<$($R),+> {
            fn clone(&self) -> Self {
                Self {
                    core: self.core.clone(),
                }
            }
        }

        impl<$($R: 'static),+> fmt::Debug for $scope<$($R),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($scope))
                    .field("repositories", &self.core.types)
                    .finish()
            }
        }

        impl<'s, $($R: 'static,)+ T> Commit<'s, ($($R,)+), T> {
            /// Run after a successful commit against the same facades; its
            /// result replaces the work's result.
            pub fn non_committing<N>(mut self, after_commit: N) -> Self
            where
                N: FnOnce($(&$R),+) -> ScopeResult<T> + 's,
            {
                self.non_committing = Some(Box::new(move |f: &($($R,)+)| after_commit($(&f.$idx),+)));
                self
            }

            /// Absorb a concurrency conflict; the handler's result becomes the
            /// call's result.
            pub fn on_concurrency_error<H>(mut self, handler: H) -> Self
            where
                H: FnOnce($(&$R),+) -> ScopeResult<T> + 's,
            {
                self.on_conflict = Some(Box::new(move |f: &($($R,)+)| handler($(&f.$idx),+)));
                self
            }
        }
    };
}

scope_arity!(
    /// Scope over a single repository facade.
    Scope1 { R1.0 }
);
scope_arity!(
    /// Scope over two repository facades sharing one context.
    Scope2 { R1.0, R2.1 }
);
scope_arity!(
    /// Scope over three repository facades sharing one context.
    Scope3 { R1.0, R2.1, R3.2 }
);

/// Zero-argument factory producing fresh scopes of one shape.
pub struct ScopeFactory<S> {
    engine: Arc<ScopeEngine>,
    make: fn(Arc<ScopeEngine>) -> S,
}

impl<S> ScopeFactory<S> {
    pub(crate) fn new(engine: Arc<ScopeEngine>, make: fn(Arc<ScopeEngine>) -> S) -> Self {
        Self { engine, make }
    }

    pub fn create(&self) -> S {
        (self.make)(self.engine.clone())
    }
}

impl<S> Clone for ScopeFactory<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            make: self.make,
        }
    }
}

impl<S> fmt::Debug for ScopeFactory<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeFactory")
            .field("scope", &std::any::type_name::<S>())
            .finish()
    }
}

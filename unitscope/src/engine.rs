//! The scope engine: context acquisition, publication, transaction boundaries
//! and conflict translation shared by every scope arity.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::time::Instant;

#[cfg(feature = "tracing")]
use tracing::debug;

use unitscope_core::execution::execute_with;
use unitscope_core::transactions::{ambient_transaction_exists, ScopeOption, TransactionScope};
use unitscope_core::{ConcurrencyError, ContextRef, RepositoryType, ScopeError, ScopeResult};

use crate::config::ScopeConfig;
use crate::factory::RepositoryFactory;
use crate::obs;
use crate::provider::ContextProvider;

thread_local! {
    // The context published by the outermost scope call running on this thread.
    static CURRENT_CONTEXT: RefCell<Option<ContextRef>> = const { RefCell::new(None) };
}

/// The context published on the calling thread, if a scope call is running.
pub(crate) fn current_context() -> Option<ContextRef> {
    CURRENT_CONTEXT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Declaration-ordered facade types of one scope. Never empty.
#[derive(Clone, PartialEq, Eq)]
pub struct RepositoryTypes {
    types: Vec<RepositoryType>,
}

impl RepositoryTypes {
    /// `first` followed by `rest`, in declaration order.
    pub fn new(first: RepositoryType, rest: Vec<RepositoryType>) -> Self {
        let mut types = rest;
        types.insert(0, first);
        Self { types }
    }

    /// The type whose provider answer picks a fresh context.
    pub fn first(&self) -> RepositoryType {
        self.types[0]
    }

    /// All types, in declaration order.
    pub fn as_slice(&self) -> &[RepositoryType] {
        &self.types
    }

    /// Scope arity, between 1 and 3.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = RepositoryType> + '_ {
        self.types.iter().copied()
    }
}

impl fmt::Debug for RepositoryTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types.iter()).finish()
    }
}

impl fmt::Display for RepositoryTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, repository) in self.types.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            f.write_str(repository.name())?;
        }
        Ok(())
    }
}

/// A tuple of facade types a scope is bound to.
pub trait RepositorySet: 'static {
    /// The facade instances handed to callbacks, in declaration order.
    type Facades;

    fn repository_types() -> RepositoryTypes;

    /// Downcast factory output, in declaration order, into the typed tuple.
    fn unpack(facades: Vec<Box<dyn Any>>) -> ScopeResult<Self::Facades>;
}

fn take<R: 'static>(facades: &mut impl Iterator<Item = Box<dyn Any>>) -> ScopeResult<R> {
    let mismatch = || ScopeError::FactoryMismatch {
        repository: RepositoryType::of::<R>(),
    };
    let facade = facades.next().ok_or_else(mismatch)?;
    facade.downcast::<R>().map(|r| *r).map_err(|_| mismatch())
}

macro_rules! repository_set {
    ($first:ident $(, $rest:ident)*) => {
        impl<$first: 'static $(, $rest: 'static)*> RepositorySet for ($first, $($rest,)*) {
            type Facades = ($first, $($rest,)*);

            fn repository_types() -> RepositoryTypes {
                RepositoryTypes::new(
                    RepositoryType::of::<$first>(),
                    vec![$(RepositoryType::of::<$rest>()),*],
                )
            }

            fn unpack(facades: Vec<Box<dyn Any>>) -> ScopeResult<Self::Facades> {
                let mut facades = facades.into_iter();
                Ok((take::<$first>(&mut facades)?, $(take::<$rest>(&mut facades)?,)*))
            }
        }
    };
}

repository_set!(R1);
repository_set!(R1, R2);
repository_set!(R1, R2, R3);

struct Acquired {
    context: ContextRef,
    created: bool,
    facades: Vec<Box<dyn Any>>,
}

/// Publishes a context as current for the extent of the outermost call.
/// Dropping clears the slot, then disposes the context.
struct Published {
    context: ContextRef,
}

impl Published {
    fn publish(context: ContextRef) -> Self {
        CURRENT_CONTEXT.with(|current| *current.borrow_mut() = Some(context.clone()));
        Self { context }
    }
}

impl Drop for Published {
    fn drop(&mut self) {
        let _ = CURRENT_CONTEXT.try_with(|current| current.borrow_mut().take());
        self.context.dispose();
    }
}

// Field order matters: facades drop before the context is released.
struct Invocation<F> {
    facades: F,
    context: ContextRef,
    _published: Option<Published>,
}

pub(crate) struct ScopeEngine {
    factory: Box<dyn RepositoryFactory>,
    provider: Box<dyn ContextProvider>,
    config: ScopeConfig,
}

impl ScopeEngine {
    pub(crate) fn new(
        factory: Box<dyn RepositoryFactory>,
        provider: Box<dyn ContextProvider>,
        config: ScopeConfig,
    ) -> Self {
        Self {
            factory,
            provider,
            config,
        }
    }

    pub(crate) fn config(&self) -> &ScopeConfig {
        &self.config
    }

    fn fresh_context(&self, repository: RepositoryType) -> ScopeResult<ContextRef> {
        self.provider
            .context_for(repository)
            .ok_or(ScopeError::NoContext { repository })
    }

    /// Ask the provider again for `repository` and compare the context type
    /// with the one already chosen. The probe is disposed unless the provider
    /// handed back the chosen context itself.
    fn ensure_compatible(&self, repository: RepositoryType, chosen: &ContextRef) -> ScopeResult<()> {
        let probe = self.fresh_context(repository)?;
        let probe_type = probe.context_type();
        if !probe.ptr_eq(chosen) {
            probe.dispose();
        }
        if probe_type != chosen.context_type() {
            return Err(ScopeError::IncompatibleRepositories {
                repository,
                context: chosen.context_type(),
            });
        }
        Ok(())
    }

    fn bind(
        &self,
        types: &RepositoryTypes,
        context: &ContextRef,
        created: bool,
    ) -> ScopeResult<Vec<Box<dyn Any>>> {
        let mut facades = Vec::with_capacity(types.len());
        for (index, repository) in types.iter().enumerate() {
            // The first facade of a fresh call picked the context itself.
            if index > 0 || !created {
                self.ensure_compatible(repository, context)?;
            }
            facades.push(self.factory.create(repository, context)?);
        }
        Ok(facades)
    }

    /// Resolve one context and every facade bound to it, or fail without
    /// leaking a context created here.
    fn acquire(&self, types: &RepositoryTypes, inherited: Option<ContextRef>) -> ScopeResult<Acquired> {
        let (context, created) = match inherited {
            Some(context) => (context, false),
            None => match self.fresh_context(types.first()) {
                Ok(context) => (context, true),
                Err(err) => {
                    obs::acquisition_failed(types, &err);
                    return Err(err);
                }
            },
        };
        match self.bind(types, &context, created) {
            Ok(facades) => {
                obs::context_acquired(types, context.context_type(), !created);
                Ok(Acquired {
                    context,
                    created,
                    facades,
                })
            }
            Err(err) => {
                if created {
                    context.dispose();
                }
                obs::acquisition_failed(types, &err);
                Err(err)
            }
        }
    }

    /// Acquire for a `read_only`/`commit` call, inheriting the current context
    /// and publishing a fresh one.
    fn enter<Rs: RepositorySet>(&self, types: &RepositoryTypes) -> ScopeResult<Invocation<Rs::Facades>> {
        let acquired = self.acquire(types, current_context())?;
        let published = acquired
            .created
            .then(|| Published::publish(acquired.context.clone()));
        let facades = Rs::unpack(acquired.facades)?;
        Ok(Invocation {
            facades,
            context: acquired.context,
            _published: published,
        })
    }

    /// Run `work` inside the ambient transaction, or start one per attempt
    /// through the configured execution strategy.
    fn in_transaction<T, W>(&self, mut work: W) -> ScopeResult<T>
    where
        W: FnMut() -> ScopeResult<T>,
    {
        if ambient_transaction_exists() {
            #[cfg(feature = "tracing")]
            debug!("joining ambient transaction");
            return work();
        }
        let options = self.config.transaction_options();
        let mut attempt = || TransactionScope::run(ScopeOption::Required, options, &mut work);
        match self.config.execution_strategy() {
            Some(strategy) => execute_with(strategy.as_ref(), attempt),
            None => attempt(),
        }
    }

    fn classify(&self, err: ScopeError) -> ScopeError {
        if err.is_concurrency() {
            return err;
        }
        match self.config.conflict_classifier().classify(&err) {
            Some(kind) => {
                obs::conflict_classified(kind);
                ConcurrencyError::from_kind(kind, err).into()
            }
            None => err,
        }
    }

    pub(crate) fn read_only<Rs, T, W>(&self, types: &RepositoryTypes, mut work: W) -> ScopeResult<T>
    where
        Rs: RepositorySet,
        W: FnMut(&Rs::Facades) -> ScopeResult<T>,
    {
        let start = Instant::now();
        let result = self
            .enter::<Rs>(types)
            .and_then(|invocation| self.in_transaction(|| work(&invocation.facades)));
        obs::obs_record("read_only", types, start, result.is_ok());
        result
    }

    pub(crate) fn commit<Rs, T, W, N, H>(
        &self,
        types: &RepositoryTypes,
        work: W,
        non_committing: Option<N>,
        on_conflict: Option<H>,
    ) -> ScopeResult<T>
    where
        Rs: RepositorySet,
        W: FnMut(&Rs::Facades) -> ScopeResult<T>,
        N: FnOnce(&Rs::Facades) -> ScopeResult<T>,
        H: FnOnce(&Rs::Facades) -> ScopeResult<T>,
    {
        let start = Instant::now();
        let result = self.commit_in_scope::<Rs, T, W, N, H>(types, work, non_committing, on_conflict);
        obs::obs_record("commit", types, start, result.is_ok());
        result
    }

    fn commit_in_scope<Rs, T, W, N, H>(
        &self,
        types: &RepositoryTypes,
        mut work: W,
        non_committing: Option<N>,
        on_conflict: Option<H>,
    ) -> ScopeResult<T>
    where
        Rs: RepositorySet,
        W: FnMut(&Rs::Facades) -> ScopeResult<T>,
        N: FnOnce(&Rs::Facades) -> ScopeResult<T>,
        H: FnOnce(&Rs::Facades) -> ScopeResult<T>,
    {
        let invocation = self.enter::<Rs>(types)?;
        let facades = &invocation.facades;
        let context = &invocation.context;
        // Each attempt is classified before any execution strategy sees its failure.
        let committed = self
            .in_transaction(|| {
                work(facades)
                    .and_then(|out| context.commit().map(|()| out))
                    .map_err(|err| self.classify(err))
            })
            .map_err(|err| self.classify(err));
        match committed {
            Ok(out) => match non_committing {
                Some(after_commit) => after_commit(facades),
                None => Ok(out),
            },
            Err(err @ ScopeError::Concurrency(_)) => match on_conflict {
                Some(handler) => {
                    obs::conflict_handled(types, &err);
                    handler(facades)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Acquire without inheriting or publishing; the context is left to the
    /// returned iterator.
    pub(crate) fn query<Rs, I, Q>(&self, types: &RepositoryTypes, query: Q) -> ScopeResult<I>
    where
        Rs: RepositorySet,
        I: Iterator,
        Q: FnOnce(&Rs::Facades) -> ScopeResult<I>,
    {
        let start = Instant::now();
        let result = self.acquire(types, None).and_then(|acquired| {
            let context = acquired.context;
            let sequence = Rs::unpack(acquired.facades).and_then(|facades| query(&facades));
            if sequence.is_err() {
                context.dispose();
            }
            sequence
        });
        obs::obs_record("query", types, start, result.is_ok());
        result
    }

    pub(crate) fn seed(&self, repository: RepositoryType) -> ScopeResult<()> {
        let start = Instant::now();
        let types = RepositoryTypes::new(repository, Vec::new());
        let result = self.fresh_context(repository).and_then(|context| {
            let seeded = context.seed();
            context.dispose();
            seeded
        });
        obs::obs_record("seed", &types, start, result.is_ok());
        result
    }
}

impl fmt::Debug for ScopeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

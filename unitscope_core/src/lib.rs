#![forbid(unsafe_code)]
//! Core traits for the unitscope unit-of-work engine.
//! This crate is persistence-agnostic and should not contain any driver-specific logic.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

// Ambient transactions, conflict classification and retry wrappers.
pub mod conflict;
pub mod execution;
pub mod transactions;

pub use conflict::{ConflictClassifier, ConflictKind, ErrorCodeClassifier, StoreError};

/// Boxed, thread-safe error used as the source of wrapped failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One connected, stateful unit of work against the persistence layer.
///
/// Contexts are owned by a single thread's call stack; implementations are free
/// to use interior mutability and need not be `Send`.
pub trait Context: 'static {
    /// Persist every change tracked by this context.
    fn commit(&self) -> ScopeResult<()>;

    /// Seed the store with its initial data set.
    fn seed(&self) -> ScopeResult<()> {
        Ok(())
    }

    /// Release connections and other resources. Called at most once per context.
    fn dispose(&self) {}
}

/// Run-time identity of a repository facade type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepositoryType {
    id: TypeId,
    name: &'static str,
}

impl RepositoryType {
    /// Identity of facade type `R`.
    pub fn of<R: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<R>(),
            name: std::any::type_name::<R>(),
        }
    }

    /// The underlying `TypeId`; equality goes through it.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Type name for logs and error messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True if this identity denotes facade type `R`.
    pub fn is<R: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<R>()
    }
}

impl fmt::Debug for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryType({})", self.name)
    }
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Run-time identity of a concrete [`Context`] implementation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextType {
    id: TypeId,
    name: &'static str,
}

impl ContextType {
    pub fn of<C: Context>() -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: std::any::type_name::<C>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextType({})", self.name)
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

struct ContextSlot {
    context: Rc<dyn Context>,
    any: Rc<dyn Any>,
    context_type: ContextType,
    disposed: Cell<bool>,
}

/// Shared handle to one context instance.
///
/// Clones refer to the same instance; disposal state is shared between them.
/// The handle is deliberately `!Send`: a context never leaves the thread that
/// acquired it.
#[derive(Clone)]
pub struct ContextRef {
    slot: Rc<ContextSlot>,
}

impl ContextRef {
    /// Take ownership of a freshly created context.
    pub fn new<C: Context>(context: C) -> Self {
        Self::from_rc(Rc::new(context))
    }

    /// Wrap an already shared context. The caller may keep its own `Rc<C>`.
    pub fn from_rc<C: Context>(context: Rc<C>) -> Self {
        Self {
            slot: Rc::new(ContextSlot {
                any: context.clone(),
                context,
                context_type: ContextType::of::<C>(),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Concrete type of the wrapped context.
    pub fn context_type(&self) -> ContextType {
        self.slot.context_type
    }

    /// Persist pending changes. Fails with `ContextDisposed` after disposal.
    pub fn commit(&self) -> ScopeResult<()> {
        self.ensure_live()?;
        self.slot.context.commit()
    }

    /// Populate the backing store with initial data.
    pub fn seed(&self) -> ScopeResult<()> {
        self.ensure_live()?;
        self.slot.context.seed()
    }

    /// Dispose the context. Repeated calls are no-ops.
    pub fn dispose(&self) {
        if !self.slot.disposed.replace(true) {
            self.slot.context.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.disposed.get()
    }

    /// Typed access to the concrete context, if it is a `C`.
    pub fn downcast<C: Context>(&self) -> Option<Rc<C>> {
        self.slot.any.clone().downcast::<C>().ok()
    }

    /// Reference equality: both handles point at the same context instance.
    pub fn ptr_eq(&self, other: &ContextRef) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }

    fn ensure_live(&self) -> ScopeResult<()> {
        if self.is_disposed() {
            return Err(ScopeError::ContextDisposed {
                context: self.context_type(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef")
            .field("type", &self.slot.context_type)
            .field("disposed", &self.slot.disposed.get())
            .finish()
    }
}

/// Signals a detected write conflict.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ConcurrencyError {
    kind: Option<ConflictKind>,
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxError>,
}

impl ConcurrencyError {
    pub fn new() -> Self {
        Self {
            kind: None,
            message: Cow::Borrowed("concurrency conflict detected"),
            source: None,
        }
    }

    /// A conflict of a known kind, preserving the low-level failure as the source.
    pub fn from_kind<E>(kind: ConflictKind, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = match kind {
            ConflictKind::OptimisticConcurrency => {
                "optimistic concurrency conflict: the record changed or vanished since it was read"
            }
            ConflictKind::DuplicateKey => {
                "duplicate key on insert: a concurrent insert claimed the same identity"
            }
        };
        Self {
            kind: Some(kind),
            message: Cow::Borrowed(message),
            source: Some(Box::new(cause)),
        }
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> Option<ConflictKind> {
        self.kind
    }
}

impl Default for ConcurrencyError {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for scope operations.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// A write race; recoverable through an `on_concurrency_error` handler.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    /// Two facade types used together resolve to different context types.
    #[error("repository type '{repository}' is not compatible with context '{context}'")]
    IncompatibleRepositories {
        repository: RepositoryType,
        context: ContextType,
    },
    /// No context provider serves the facade type.
    #[error("no context is available for repository type '{repository}'")]
    NoContext { repository: RepositoryType },
    /// The repository factory does not know the facade type.
    #[error("no repository factory is registered for '{repository}'")]
    UnknownRepository { repository: RepositoryType },
    /// The repository factory returned a value of the wrong type.
    #[error("repository factory returned a value that is not a '{repository}'")]
    FactoryMismatch { repository: RepositoryType },
    /// The context was used after disposal.
    #[error("context '{context}' has already been disposed")]
    ContextDisposed { context: ContextType },
    /// The ambient transaction was rolled back instead of committed.
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: Cow<'static, str> },
    /// Opaque, unclassified failure from the persistence layer or the work function.
    #[error("backend error")]
    Backend {
        #[source]
        source: BoxError,
    },
}

impl ScopeError {
    /// Wrap a backend/driver/application error.
    pub fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ScopeError::Backend {
            source: Box::new(e),
        }
    }

    pub fn aborted(reason: impl Into<Cow<'static, str>>) -> Self {
        ScopeError::TransactionAborted {
            reason: reason.into(),
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, ScopeError::Concurrency(_))
    }
}

/// Convenience alias for results returned by scope operations.
pub type ScopeResult<T> = Result<T, ScopeError>;

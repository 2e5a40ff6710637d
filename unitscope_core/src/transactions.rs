//! Backend-agnostic ambient transactions.
//!
//! A [`TransactionScope`] guard creates, joins or suppresses the ambient
//! transaction of the calling thread. Resources that want commit/rollback
//! notifications enlist in [`Transaction::current`]. Nested scopes with
//! [`ScopeOption::Required`] join the outer transaction and inherit its
//! isolation level.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::{ScopeError, ScopeResult};

/// Default transaction timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

/// How a new [`TransactionScope`] relates to the ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeOption {
    /// Join the ambient transaction, or start one if none exists.
    #[default]
    Required,
    /// Always start a new transaction for the extent of the scope.
    RequiresNew,
    /// Hide the ambient transaction for the extent of the scope.
    Suppress,
}

/// Options applied when a scope starts a new transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    pub timeout: Option<Duration>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl TransactionOptions {
    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Lifecycle state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// A resource notified when the transaction it enlisted in finishes.
pub trait Enlistment {
    fn commit(&self) -> ScopeResult<()>;
    fn rollback(&self);
}

/// Snapshot of a scope's relation to its transaction, taken by
/// [`TransactionScope::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatus {
    transaction: Option<u64>,
    owner: bool,
    doomed: bool,
}

impl TransactionStatus {
    /// Id of the created or joined transaction; `None` when suppressed.
    pub fn transaction_id(&self) -> Option<u64> {
        self.transaction
    }

    /// True if the scope started the transaction and will commit it.
    pub fn is_new_transaction(&self) -> bool {
        self.owner
    }

    pub fn is_suppressed(&self) -> bool {
        self.transaction.is_none()
    }

    /// True once a joined scope was dropped without completing.
    pub fn is_rollback_only(&self) -> bool {
        self.doomed
    }
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // One frame per live TransactionScope; `None` marks a suppressed frame.
    static AMBIENT: RefCell<Vec<Option<Rc<Transaction>>>> = const { RefCell::new(Vec::new()) };
}

/// True if the calling thread runs inside an ambient transaction.
pub fn ambient_transaction_exists() -> bool {
    Transaction::current().is_some()
}

/// An ambient transaction shared by every scope that joined it.
pub struct Transaction {
    id: u64,
    isolation_level: IsolationLevel,
    started: Instant,
    timeout: Option<Duration>,
    state: Cell<TransactionState>,
    rollback_only: Cell<bool>,
    enlistments: RefCell<Vec<Box<dyn Enlistment>>>,
}

impl Transaction {
    fn begin(options: TransactionOptions) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            isolation_level: options.isolation_level,
            started: Instant::now(),
            timeout: options.timeout,
            state: Cell::new(TransactionState::Active),
            rollback_only: Cell::new(false),
            enlistments: RefCell::new(Vec::new()),
        })
    }

    /// The ambient transaction of the calling thread, if any.
    pub fn current() -> Option<Rc<Transaction>> {
        AMBIENT
            .try_with(|frames| frames.borrow().last().cloned().flatten())
            .ok()
            .flatten()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.get()
    }

    /// Doom the transaction: its root scope will roll back instead of committing.
    pub fn set_rollback_only(&self) {
        self.rollback_only.set(true);
    }

    pub fn enlist(&self, enlistment: Box<dyn Enlistment>) -> ScopeResult<()> {
        if self.state() != TransactionState::Active {
            return Err(ScopeError::aborted("cannot enlist in a finished transaction"));
        }
        self.enlistments.borrow_mut().push(enlistment);
        Ok(())
    }

    pub fn enlistment_count(&self) -> usize {
        self.enlistments.borrow().len()
    }

    fn is_expired(&self) -> bool {
        self.timeout
            .map(|timeout| self.started.elapsed() >= timeout)
            .unwrap_or(false)
    }

    fn commit(&self) -> ScopeResult<()> {
        let enlistments = self.enlistments.take();
        for (index, enlistment) in enlistments.iter().enumerate() {
            if let Err(err) = enlistment.commit() {
                for rest in &enlistments[index + 1..] {
                    rest.rollback();
                }
                self.state.set(TransactionState::Aborted);
                return Err(err);
            }
        }
        self.state.set(TransactionState::Committed);
        Ok(())
    }

    fn rollback(&self) {
        for enlistment in self.enlistments.take() {
            enlistment.rollback();
        }
        self.state.set(TransactionState::Aborted);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("state", &self.state.get())
            .field("rollback_only", &self.rollback_only.get())
            .field("enlistments", &self.enlistment_count())
            .finish()
    }
}

/// RAII guard over the ambient transaction.
///
/// Call [`TransactionScope::complete`] to vote for commit. Dropping an
/// uncompleted scope rolls back a transaction it started, or dooms a
/// transaction it joined.
#[must_use = "dropping a TransactionScope without complete() rolls the transaction back"]
pub struct TransactionScope {
    transaction: Option<Rc<Transaction>>,
    owner: bool,
    depth: usize,
    completed: bool,
}

impl TransactionScope {
    pub fn new(option: ScopeOption, options: TransactionOptions) -> Self {
        let (transaction, is_new) = match option {
            ScopeOption::Required => match Transaction::current() {
                Some(ambient) => (Some(ambient), false),
                None => (Some(Transaction::begin(options)), true),
            },
            ScopeOption::RequiresNew => (Some(Transaction::begin(options)), true),
            ScopeOption::Suppress => (None, false),
        };
        let depth = AMBIENT.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(transaction.clone());
            frames.len()
        });
        #[cfg(feature = "tracing")]
        debug!(
            option = ?option,
            transaction = transaction.as_ref().map(|t| t.id()),
            isolation = ?transaction.as_ref().map(|t| t.isolation_level()),
            new = is_new,
            depth = depth,
            "transaction scope entered"
        );
        Self {
            transaction,
            owner: is_new,
            depth,
            completed: false,
        }
    }

    pub fn required() -> Self {
        Self::new(ScopeOption::Required, TransactionOptions::default())
    }

    pub fn requires_new() -> Self {
        Self::new(ScopeOption::RequiresNew, TransactionOptions::default())
    }

    pub fn suppress() -> Self {
        Self::new(ScopeOption::Suppress, TransactionOptions::default())
    }

    /// Run `f` inside a new scope and complete it if `f` succeeds.
    pub fn run<T, F>(option: ScopeOption, options: TransactionOptions, f: F) -> ScopeResult<T>
    where
        F: FnOnce() -> ScopeResult<T>,
    {
        let scope = Self::new(option, options);
        let out = f()?;
        scope.complete()?;
        Ok(out)
    }

    /// The transaction this scope created or joined; `None` when suppressed.
    pub fn transaction(&self) -> Option<&Rc<Transaction>> {
        self.transaction.as_ref()
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus {
            transaction: self.transaction.as_ref().map(|t| t.id()),
            owner: self.owner,
            doomed: self
                .transaction
                .as_ref()
                .map_or(false, |t| t.is_rollback_only()),
        }
    }

    /// Vote for commit. The scope that started the transaction commits it here.
    pub fn complete(mut self) -> ScopeResult<()> {
        self.completed = true;
        let transaction = match (&self.transaction, self.owner) {
            (Some(transaction), true) => transaction.clone(),
            _ => return Ok(()),
        };
        if transaction.is_rollback_only() {
            transaction.rollback();
            return Err(ScopeError::aborted(
                "a joined scope was dropped without completing",
            ));
        }
        if transaction.is_expired() {
            transaction.rollback();
            return Err(ScopeError::aborted("transaction timeout elapsed"));
        }
        let result = transaction.commit();
        #[cfg(feature = "tracing")]
        debug!(
            transaction = transaction.id(),
            success = result.is_ok(),
            "transaction committed"
        );
        result
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        let depth = self.depth;
        let _ = AMBIENT.try_with(|frames| {
            let mut frames = frames.borrow_mut();
            if frames.len() >= depth {
                frames.truncate(depth - 1);
            }
        });
        if self.completed {
            return;
        }
        if let Some(transaction) = &self.transaction {
            if self.owner {
                if transaction.state() == TransactionState::Active {
                    transaction.rollback();
                    #[cfg(feature = "tracing")]
                    debug!(transaction = transaction.id(), "transaction rolled back");
                }
            } else {
                transaction.set_rollback_only();
            }
        }
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .field("owner", &self.owner)
            .field("depth", &self.depth)
            .finish()
    }
}

//! Execution strategies: pluggable wrappers that may re-run a whole transaction attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::warn;

use crate::{ScopeError, ScopeResult, StoreError};

/// Runs an operation, possibly more than once, on the calling thread.
pub trait ExecutionStrategy {
    fn execute(&self, operation: &mut dyn FnMut() -> ScopeResult<()>) -> ScopeResult<()>;
}

/// Produces a strategy per top-level call; `None` means "run directly".
pub type ExecutionStrategyFactory =
    Arc<dyn Fn() -> Option<Box<dyn ExecutionStrategy>> + Send + Sync>;

/// Run a typed operation through an object-safe strategy.
pub fn execute_with<T, F>(strategy: &dyn ExecutionStrategy, mut operation: F) -> ScopeResult<T>
where
    F: FnMut() -> ScopeResult<T>,
{
    let mut output = None;
    strategy.execute(&mut || -> ScopeResult<()> {
        output = Some(operation()?);
        Ok(())
    })?;
    output.ok_or_else(|| ScopeError::aborted("execution strategy did not run the operation"))
}

/// Runs the operation exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecution;

impl ExecutionStrategy for DirectExecution {
    fn execute(&self, operation: &mut dyn FnMut() -> ScopeResult<()>) -> ScopeResult<()> {
        operation()
    }
}

type TransientPredicate = Arc<dyn Fn(&ScopeError) -> bool + Send + Sync>;

/// Retries failed attempts that the configured predicate deems transient,
/// sleeping with exponential backoff between attempts. Concurrency conflicts
/// are returned at once, whatever the predicate says.
#[derive(Clone)]
pub struct RetryStrategy {
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
    is_transient: TransientPredicate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            is_transient: Arc::new(|_| false),
        }
    }
}

impl RetryStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Retry failures for which `predicate` returns true.
    pub fn retry_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ScopeError) -> bool + Send + Sync + 'static,
    {
        self.is_transient = Arc::new(predicate);
        self
    }

    /// Retry failures carrying a [`StoreError`] with one of `codes`.
    pub fn retry_on_codes(self, codes: impl IntoIterator<Item = i64>) -> Self {
        let codes: Vec<i64> = codes.into_iter().collect();
        self.retry_when(move |err| {
            StoreError::find_in(err)
                .map(|store| codes.contains(&store.code()))
                .unwrap_or(false)
        })
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Backoff before retry number `attempt` (0-based), capped at the max delay.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let shift = attempt.min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// A factory handing out clones of this strategy.
    pub fn factory(self) -> ExecutionStrategyFactory {
        Arc::new(move || Some(Box::new(self.clone()) as Box<dyn ExecutionStrategy>))
    }
}

impl ExecutionStrategy for RetryStrategy {
    fn execute(&self, operation: &mut dyn FnMut() -> ScopeResult<()>) -> ScopeResult<()> {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(()) => return Ok(()),
                Err(err) if err.is_concurrency() => return Err(err),
                Err(err) if attempt < self.max_retries && (self.is_transient)(&err) => {
                    let delay = self.delay_for(attempt);
                    #[cfg(feature = "tracing")]
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying transaction"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryStrategy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

//! Engine configuration, fixed when a [`crate::ScopeService`] is built.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use unitscope_core::execution::{ExecutionStrategy, ExecutionStrategyFactory};
use unitscope_core::transactions::{IsolationLevel, TransactionOptions, DEFAULT_TIMEOUT};
use unitscope_core::{ConflictClassifier, ErrorCodeClassifier};

/// Immutable settings shared by every scope a service creates.
#[derive(Clone)]
pub struct ScopeConfig {
    isolation_level: IsolationLevel,
    transaction_timeout: Option<Duration>,
    execution_strategy: Option<ExecutionStrategyFactory>,
    conflict_classifier: Arc<dyn ConflictClassifier>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            transaction_timeout: Some(DEFAULT_TIMEOUT),
            execution_strategy: None,
            conflict_classifier: Arc::new(ErrorCodeClassifier::default()),
        }
    }
}

impl ScopeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    /// `None` disables the timeout check on commit.
    pub fn with_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_execution_strategy(mut self, factory: ExecutionStrategyFactory) -> Self {
        self.execution_strategy = Some(factory);
        self
    }

    pub fn with_conflict_classifier<C>(mut self, classifier: C) -> Self
    where
        C: ConflictClassifier + 'static,
    {
        self.conflict_classifier = Arc::new(classifier);
        self
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout
    }

    pub fn conflict_classifier(&self) -> &dyn ConflictClassifier {
        self.conflict_classifier.as_ref()
    }

    /// Options for a transaction started by a top-level scope call.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions::default()
            .with_isolation_level(self.isolation_level)
            .with_timeout(self.transaction_timeout)
    }

    /// A fresh strategy instance, or `None` to run transactions directly.
    pub fn execution_strategy(&self) -> Option<Box<dyn ExecutionStrategy>> {
        self.execution_strategy.as_ref().and_then(|factory| factory())
    }
}

impl fmt::Debug for ScopeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeConfig")
            .field("isolation_level", &self.isolation_level)
            .field("transaction_timeout", &self.transaction_timeout)
            .field("execution_strategy", &self.execution_strategy.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "serde")]
pub use settings::{RetrySettings, ScopeSettings};

#[cfg(feature = "serde")]
mod settings {
    use super::*;
    use serde::{Deserialize, Serialize};
    use unitscope_core::execution::RetryStrategy;

    /// Plain-data retry settings.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RetrySettings {
        pub max_retries: usize,
        pub base_delay_ms: u64,
        pub max_delay_ms: u64,
        /// Store error codes treated as transient.
        pub transient_codes: Vec<i64>,
    }

    impl Default for RetrySettings {
        fn default() -> Self {
            Self {
                max_retries: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
                transient_codes: Vec::new(),
            }
        }
    }

    /// Plain-data form of [`ScopeConfig`], suitable for config files.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ScopeSettings {
        pub isolation_level: IsolationLevel,
        /// `None` disables the timeout.
        pub transaction_timeout_ms: Option<u64>,
        pub retry: Option<RetrySettings>,
        pub optimistic_codes: Vec<i64>,
        pub duplicate_key_codes: Vec<i64>,
    }

    impl Default for ScopeSettings {
        fn default() -> Self {
            Self {
                isolation_level: IsolationLevel::default(),
                transaction_timeout_ms: Some(DEFAULT_TIMEOUT.as_millis() as u64),
                retry: None,
                optimistic_codes: Vec::new(),
                duplicate_key_codes: Vec::new(),
            }
        }
    }

    impl ScopeConfig {
        pub fn from_settings(settings: &ScopeSettings) -> Self {
            let mut config = ScopeConfig::new()
                .with_isolation_level(settings.isolation_level)
                .with_transaction_timeout(settings.transaction_timeout_ms.map(Duration::from_millis))
                .with_conflict_classifier(
                    ErrorCodeClassifier::new()
                        .with_optimistic_codes(settings.optimistic_codes.iter().copied())
                        .with_duplicate_key_codes(settings.duplicate_key_codes.iter().copied()),
                );
            if let Some(retry) = &settings.retry {
                let strategy = RetryStrategy::new()
                    .with_max_retries(retry.max_retries)
                    .with_base_delay(Duration::from_millis(retry.base_delay_ms))
                    .with_max_delay(Duration::from_millis(retry.max_delay_ms))
                    .retry_on_codes(retry.transient_codes.iter().copied());
                config = config.with_execution_strategy(strategy.factory());
            }
            config
        }
    }

    impl From<ScopeSettings> for ScopeConfig {
        fn from(settings: ScopeSettings) -> Self {
            ScopeConfig::from_settings(&settings)
        }
    }
}

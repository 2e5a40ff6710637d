//! Conflict classification: deciding whether a low-level failure is a write race.
//!
//! Persistence adapters wrap driver failures in [`StoreError`] (or any error type
//! a custom [`ConflictClassifier`] understands). The scope engine consults the
//! configured classifier for every failure raised while committing and rethrows
//! recognized conflicts as [`crate::ConcurrencyError`].

use std::error::Error;

use crate::BoxError;

/// The two shapes of write race the engine surfaces uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// The record changed or vanished since it was read.
    OptimisticConcurrency,
    /// A uniqueness violation on insert, consistent with two inserts racing for one identity.
    DuplicateKey,
}

/// Policy deciding whether a failure represents a concurrency conflict.
pub trait ConflictClassifier: Send + Sync {
    fn classify(&self, failure: &(dyn Error + 'static)) -> Option<ConflictKind>;
}

impl<F> ConflictClassifier for F
where
    F: Fn(&(dyn Error + 'static)) -> Option<ConflictKind> + Send + Sync,
{
    fn classify(&self, failure: &(dyn Error + 'static)) -> Option<ConflictKind> {
        self(failure)
    }
}

/// A code-carrying failure reported by a persistence adapter.
#[derive(Debug, thiserror::Error)]
#[error("store error {code}: {message}")]
pub struct StoreError {
    code: i64,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl StoreError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(mut self, e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(e));
        self
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// First `StoreError` found walking `failure` and its `source()` chain.
    pub fn find_in<'a>(failure: &'a (dyn Error + 'static)) -> Option<&'a StoreError> {
        let mut current = Some(failure);
        while let Some(e) = current {
            if let Some(store) = e.downcast_ref::<StoreError>() {
                return Some(store);
            }
            current = e.source();
        }
        None
    }
}

/// Classifies [`StoreError`] codes found anywhere in a failure's source chain.
///
/// No codes are configured by default; register the codes your store reports
/// for stale writes and for duplicate keys.
#[derive(Debug, Clone, Default)]
pub struct ErrorCodeClassifier {
    optimistic: Vec<i64>,
    duplicate_key: Vec<i64>,
}

impl ErrorCodeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimistic_codes(mut self, codes: impl IntoIterator<Item = i64>) -> Self {
        self.optimistic.extend(codes);
        self
    }

    pub fn with_duplicate_key_codes(mut self, codes: impl IntoIterator<Item = i64>) -> Self {
        self.duplicate_key.extend(codes);
        self
    }
}

impl ConflictClassifier for ErrorCodeClassifier {
    fn classify(&self, failure: &(dyn Error + 'static)) -> Option<ConflictKind> {
        let mut current = Some(failure);
        while let Some(e) = current {
            if let Some(store) = e.downcast_ref::<StoreError>() {
                if self.optimistic.contains(&store.code) {
                    return Some(ConflictKind::OptimisticConcurrency);
                }
                if self.duplicate_key.contains(&store.code) {
                    return Some(ConflictKind::DuplicateKey);
                }
            }
            current = e.source();
        }
        None
    }
}

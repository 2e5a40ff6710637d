// Observability helpers; compiled down to nothing without the tracing/metrics features.

use std::time::Instant;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use unitscope_core::{ConflictKind, ContextType, ScopeError};

use crate::engine::RepositoryTypes;

pub(crate) fn obs_record(op: &str, repositories: &RepositoryTypes, start: Instant, success: bool) {
    let elapsed = start.elapsed().as_millis() as u64;
    #[cfg(feature = "tracing")]
    {
        info!(
            op = op,
            repositories = %repositories,
            elapsed_ms = elapsed,
            success = success,
            "scope op"
        );
    }
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("scope_ops_total", 1, "op" => op.to_string(), "success" => success.to_string());
        metrics::histogram!("scope_op_duration_ms", elapsed as f64, "op" => op.to_string());
    }
    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    let _ = (op, repositories, elapsed, success);
}

pub(crate) fn context_acquired(repositories: &RepositoryTypes, context: ContextType, inherited: bool) {
    #[cfg(feature = "tracing")]
    debug!(
        repositories = %repositories,
        context = %context,
        inherited = inherited,
        "scope context acquired"
    );
    #[cfg(not(feature = "tracing"))]
    let _ = (repositories, context, inherited);
}

pub(crate) fn acquisition_failed(repositories: &RepositoryTypes, err: &ScopeError) {
    #[cfg(feature = "tracing")]
    {
        if let ScopeError::IncompatibleRepositories { .. } = err {
            warn!(repositories = %repositories, error = %err, "incompatible repositories");
        } else {
            debug!(repositories = %repositories, error = %err, "scope acquisition failed");
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = (repositories, err);
}

pub(crate) fn conflict_classified(kind: ConflictKind) {
    #[cfg(feature = "tracing")]
    debug!(kind = ?kind, "commit failure classified as concurrency conflict");
    #[cfg(feature = "metrics")]
    metrics::counter!("scope_conflicts_total", 1, "kind" => format!("{:?}", kind));
    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    let _ = kind;
}

pub(crate) fn conflict_handled(repositories: &RepositoryTypes, err: &ScopeError) {
    #[cfg(feature = "tracing")]
    warn!(repositories = %repositories, error = %err, "concurrency conflict handled by callback");
    #[cfg(not(feature = "tracing"))]
    let _ = (repositories, err);
}

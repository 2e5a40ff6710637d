use std::cell::Cell;
use std::sync::{Arc, Barrier};
use std::thread;

use tests_common::{Harness, Roles, Users, DUPLICATE_KEY, STALE_ROW};
use unitscope::{ConcurrencyError, ConflictKind, ScopeConfig, ScopeError, StoreError};

fn conflict_kind(err: &ScopeError) -> Option<ConflictKind> {
    match err {
        ScopeError::Concurrency(conflict) => conflict.kind(),
        _ => None,
    }
}

#[test]
fn stale_update_surfaces_as_concurrency_error() {
    let h = Harness::new();
    h.store.put("user:erin", "Erin");
    let scope = h.service().create_scope::<Users>();

    let err = scope
        .commit(|users| {
            assert_eq!(users.get("erin").as_deref(), Some("Erin"));
            h.store.put("user:erin", "Changed elsewhere");
            users.rename("erin", "Erin B")
        })
        .unwrap_err();

    assert_eq!(
        conflict_kind(&err),
        Some(ConflictKind::OptimisticConcurrency)
    );
    let cause = StoreError::find_in(&err).expect("store failure kept as source");
    assert_eq!(cause.code(), STALE_ROW);
    assert_eq!(h.store.get("user:erin").as_deref(), Some("Changed elsewhere"));
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn handler_result_replaces_the_conflict() {
    let h = Harness::new();
    h.store.put("user:finn", "Finn");
    let scope = h.service().create_scope::<Users>();
    let work_context = Cell::new(0);

    let outcome = scope
        .commit_with(|users| {
            work_context.set(users.context_id());
            users.get("finn");
            h.store.put("user:finn", "Finnegan");
            users.rename("finn", "Finn F")?;
            Ok("renamed".to_string())
        })
        .on_concurrency_error(|users| {
            assert_eq!(users.context_id(), work_context.get());
            Ok(format!("kept {}", h.store.get("user:finn").unwrap_or_default()))
        })
        .run()
        .unwrap();

    assert_eq!(outcome, "kept Finnegan");
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn racing_inserts_of_one_key_yield_one_duplicate_key_conflict() {
    let h = Harness::new();
    let factory = h.service().scope_factory::<Users>();
    let barrier = Arc::new(Barrier::new(2));

    let racers: Vec<_> = ["Gail", "Gale"]
        .into_iter()
        .map(|name| {
            let factory = factory.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                factory.create().commit(|users| {
                    users.insert("gail", name)?;
                    barrier.wait();
                    Ok(())
                })
            })
        })
        .collect();
    let results: Vec<_> = racers
        .into_iter()
        .map(|racer| racer.join().expect("racer thread"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let conflict = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one racer loses");
    assert_eq!(conflict_kind(conflict), Some(ConflictKind::DuplicateKey));
    assert_eq!(StoreError::find_in(conflict).map(StoreError::code), Some(DUPLICATE_KEY));
    assert_eq!(h.memory_stats.committed(), 1);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn unclassified_failures_skip_the_handler() {
    let h = Harness::new();
    h.store.fail_next_commit(42);
    let scope = h.service().create_scope::<Users>();
    let handled = Cell::new(false);

    let err = scope
        .commit_with(|users| users.insert("hank", "Hank"))
        .on_concurrency_error(|_| {
            handled.set(true);
            Ok(())
        })
        .run()
        .unwrap_err();

    assert!(matches!(err, ScopeError::Backend { .. }));
    assert_eq!(StoreError::find_in(&err).map(StoreError::code), Some(42));
    assert!(!handled.get());
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn without_configured_codes_conflicts_stay_unclassified() {
    let h = Harness::new();
    h.store.fail_next_commit(STALE_ROW);
    let scope = h.service_with(ScopeConfig::default()).create_scope::<Users>();

    let err = scope.commit(|users| users.insert("ivy", "Ivy")).unwrap_err();

    assert!(!err.is_concurrency());
    assert!(matches!(err, ScopeError::Backend { .. }));
}

#[test]
fn conflicts_raised_by_work_are_handled_as_is() {
    let h = Harness::new();
    let scope = h.service().create_scope2::<Users, Roles>();

    let outcome = scope
        .commit_with(|_, _| {
            Err(ConcurrencyError::new()
                .with_message("version column mismatch")
                .into())
        })
        .on_concurrency_error(|_, _| Ok("handled"))
        .run()
        .unwrap();

    assert_eq!(outcome, "handled");
    assert_eq!(h.memory_stats.committed(), 0);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn non_committing_failures_are_not_classified() {
    let h = Harness::new();
    let scope = h.service().create_scope::<Users>();
    let handled = Cell::new(false);

    let err = scope
        .commit_with(|users| users.insert("jo", "Jo"))
        .non_committing(|_| {
            Err(ScopeError::backend(StoreError::new(
                STALE_ROW,
                "re-read raced a delete",
            )))
        })
        .on_concurrency_error(|_| {
            handled.set(true);
            Ok(())
        })
        .run()
        .unwrap_err();

    assert!(matches!(err, ScopeError::Backend { .. }));
    assert!(!handled.get());
    assert_eq!(h.store.get("user:jo").as_deref(), Some("Jo"));
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn unhandled_conflict_message_names_the_kind() {
    let h = Harness::new();
    h.store.put("user:kim", "Kim");
    let scope = h.service().create_scope::<Users>();

    let err = scope
        .commit(|users| {
            users.get("kim");
            h.store.remove("user:kim");
            users.delete("kim")
        })
        .unwrap_err();

    assert!(err.is_concurrency());
    assert!(err.to_string().contains("changed or vanished"));
}

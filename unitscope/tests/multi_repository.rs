use std::cell::Cell;

use tests_common::{AuditLog, Harness, MemoryContext, Profiles, Roles, Users};
use unitscope::{ContextType, RepositoryType, ScopeError};

#[test]
fn two_facades_share_one_context() {
    let h = Harness::new();
    let scope = h.service().create_scope2::<Users, Roles>();

    scope
        .commit(|users, roles| {
            assert_eq!(users.context_id(), roles.context_id());
            users.insert("dave", "Dave")?;
            roles.grant("dave", "admin")
        })
        .unwrap();

    assert_eq!(h.store.get("user:dave").as_deref(), Some("Dave"));
    assert_eq!(h.store.get("role:dave").as_deref(), Some("admin"));
    assert_eq!(h.memory_stats.committed(), 1);
    // One working context plus one compatibility probe, both released.
    assert_eq!(h.memory_stats.created(), 2);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn factory_runs_once_per_facade_with_one_context_type() {
    let h = Harness::new();
    let scope = h.service().create_scope3::<Users, Roles, Profiles>();

    scope
        .read_only(|users, roles, profiles| {
            assert_eq!(users.context_id(), roles.context_id());
            assert_eq!(roles.context_id(), profiles.context_id());
            Ok(())
        })
        .unwrap();

    let calls = h.factory_calls();
    let repositories: Vec<RepositoryType> = calls.iter().map(|c| c.repository).collect();
    assert_eq!(
        repositories,
        vec![
            RepositoryType::of::<Users>(),
            RepositoryType::of::<Roles>(),
            RepositoryType::of::<Profiles>()
        ]
    );
    assert!(calls
        .iter()
        .all(|c| c.context == ContextType::of::<MemoryContext>()));
}

#[test]
fn three_facades_commit_together() {
    let h = Harness::new();
    let scope = h.service().create_scope3::<Users, Roles, Profiles>();

    let bio = scope
        .commit_with(|users, roles, profiles| {
            users.insert("fay", "Fay")?;
            roles.grant("fay", "editor")?;
            profiles.create("fay", "writes things")?;
            Ok(None)
        })
        .non_committing(|_, _, profiles| Ok(profiles.get("fay")))
        .run()
        .unwrap();

    assert_eq!(bio.as_deref(), Some("writes things"));
    assert_eq!(h.memory_stats.committed(), 1);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn incompatible_pair_fails_before_any_work() {
    let h = Harness::new();
    let scope = h.service().create_scope2::<Users, AuditLog>();
    let ran = Cell::new(false);

    let err = scope
        .commit(|_, _| {
            ran.set(true);
            Ok(())
        })
        .unwrap_err();

    match err {
        ScopeError::IncompatibleRepositories {
            repository,
            context,
        } => {
            assert!(repository.is::<AuditLog>());
            assert_eq!(context, ContextType::of::<MemoryContext>());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!ran.get());
    assert_eq!(h.audit_stats.created(), 1);
    assert_eq!(h.live_contexts(), 0);
    assert!(format!("{}", ScopeError::IncompatibleRepositories {
        repository: RepositoryType::of::<AuditLog>(),
        context: ContextType::of::<MemoryContext>(),
    })
    .contains("is not compatible with context"));
}

#[test]
fn incompatible_third_facade_stops_resolution() {
    let h = Harness::new();
    let scope = h.service().create_scope3::<Users, Roles, AuditLog>();

    let err = scope.read_only(|_, _, _| Ok(())).unwrap_err();

    assert!(matches!(
        err,
        ScopeError::IncompatibleRepositories { repository, .. } if repository.is::<AuditLog>()
    ));
    assert_eq!(h.factory_calls().len(), 2);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn repository_types_are_cached_in_declaration_order() {
    let h = Harness::new();
    let scope = h.service().create_scope3::<Profiles, Users, Roles>();
    assert_eq!(
        scope.repository_types(),
        &[
            RepositoryType::of::<Profiles>(),
            RepositoryType::of::<Users>(),
            RepositoryType::of::<Roles>()
        ]
    );
}

use std::sync::{Arc, Barrier};
use std::thread;

use tests_common::{AuditLog, Harness, MemoryContext, Roles, Users};
use unitscope::{ContextType, ScopeError, ScopeService};

#[test]
fn compatible_nested_scopes_share_the_context_instance() {
    let h = Harness::new();
    let service = h.service();
    let outer = service.create_scope::<Users>();
    let inner = service.create_scope::<Roles>();

    outer
        .commit(|users| {
            let outer_ctx = ScopeService::current_context().expect("published");
            inner.commit(|roles| {
                assert_eq!(roles.context_id(), users.context_id());
                let inner_ctx = ScopeService::current_context().expect("still published");
                assert!(inner_ctx.ptr_eq(&outer_ctx));
                roles.grant("gus", "viewer")
            })?;
            assert!(!outer_ctx.is_disposed());
            users.insert("gus", "Gus")
        })
        .unwrap();

    assert_eq!(h.store.get("role:gus").as_deref(), Some("viewer"));
    assert_eq!(h.store.get("user:gus").as_deref(), Some("Gus"));
    // The inner call commits the shared context too.
    assert_eq!(h.memory_stats.committed(), 2);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn nested_read_only_does_not_release_the_outer_context() {
    let h = Harness::new();
    let service = h.service();
    let outer = service.create_scope::<Users>();
    let inner = service.create_scope2::<Roles, Users>();

    outer
        .read_only(|users| {
            let id = inner.read_only(|roles, nested_users| {
                assert_eq!(roles.context_id(), nested_users.context_id());
                Ok(roles.context_id())
            })?;
            assert_eq!(id, users.context_id());
            let current = ScopeService::current_context().expect("published");
            assert!(!current.is_disposed());
            Ok(())
        })
        .unwrap();

    assert_eq!(h.live_contexts(), 0);
    assert!(ScopeService::current_context().is_none());
}

#[test]
fn incompatible_nested_scope_is_rejected() {
    let h = Harness::new();
    let service = h.service();
    let outer = service.create_scope::<Users>();
    let audit = service.create_scope::<AuditLog>();

    let err = outer
        .commit(|users| {
            users.insert("hal", "Hal")?;
            audit.commit(|log| log.record("hal created"))
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
    assert!(h.store.get("user:hal").is_none());
    assert!(h.journal().is_empty());
    assert_eq!(h.memory_stats.committed(), 0);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn outer_work_may_recover_from_a_rejected_nested_scope() {
    let h = Harness::new();
    let service = h.service();
    let outer = service.create_scope::<Users>();
    let audit = service.create_scope::<AuditLog>();

    outer
        .commit(|users| {
            let nested = audit.read_only(|_| Ok(()));
            assert!(matches!(
                nested,
                Err(ScopeError::IncompatibleRepositories { .. })
            ));
            users.insert("ida", "Ida")
        })
        .unwrap();

    assert_eq!(h.store.get("user:ida").as_deref(), Some("Ida"));
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn query_inside_a_scope_uses_its_own_context() {
    let h = Harness::new();
    h.store.put("user:jan", "Jan");
    let service = h.service();
    let outer = service.create_scope::<Users>();
    let listing = service.create_scope::<Users>();

    outer
        .read_only(|users| {
            let outer_ctx = ScopeService::current_context().expect("published");
            let names: Vec<String> = listing
                .query(|listed| {
                    assert_ne!(listed.context_id(), users.context_id());
                    Ok(listed.names())
                })?
                .collect();
            assert_eq!(names, vec!["Jan".to_string()]);
            let still = ScopeService::current_context().expect("still published");
            assert!(still.ptr_eq(&outer_ctx));
            Ok(())
        })
        .unwrap();
}

#[test]
fn threads_never_see_each_others_context() {
    let h = Harness::new();
    let service = h.service();
    let barrier = Arc::new(Barrier::new(2));

    let worker = {
        let factory = service.scope_factory2::<Users, Roles>();
        let barrier = barrier.clone();
        thread::spawn(move || {
            assert!(ScopeService::current_context().is_none());
            factory.create().read_only(|users, _| {
                barrier.wait();
                let id = users.context_id();
                barrier.wait();
                Ok(id)
            })
        })
    };

    let scope = service.create_scope::<Users>();
    let mine = scope
        .read_only(|users| {
            barrier.wait();
            let id = users.context_id();
            barrier.wait();
            Ok(id)
        })
        .unwrap();
    let theirs = worker.join().expect("worker thread").unwrap();

    assert_ne!(mine, theirs);
    assert_eq!(h.live_contexts(), 0);
}

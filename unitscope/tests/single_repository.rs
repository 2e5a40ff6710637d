use tests_common::{ContextEvent, Harness, MemoryContext, Users};
use unitscope::{
    RepositoryRegistry, RepositoryType, ScopeConfig, ScopeError, ScopeResult, ScopeService,
};

#[test]
fn read_only_never_commits() {
    let h = Harness::new();
    h.store.put("user:alice", "Alice");
    let scope = h.service().create_scope::<Users>();

    let name = scope.read_only(|users| Ok(users.get("alice"))).unwrap();

    assert_eq!(name.as_deref(), Some("Alice"));
    assert_eq!(h.memory_stats.committed(), 0);
    assert_eq!(h.memory_stats.created(), 1);
    assert_eq!(h.memory_stats.disposed(), 1);
}

#[test]
fn commit_persists_once_and_releases_the_context() {
    let h = Harness::new();
    let scope = h.service().create_scope::<Users>();

    scope.commit(|users| users.insert("bob", "Bob")).unwrap();

    assert_eq!(h.store.get("user:bob").as_deref(), Some("Bob"));
    assert_eq!(h.memory_stats.committed(), 1);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn non_committing_work_runs_after_commit_and_wins() {
    let h = Harness::new();
    let scope = h.service().create_scope::<Users>();
    let stats = h.memory_stats.clone();

    let reread = scope
        .commit_with(|users| {
            users.insert("carol", "Carol")?;
            Ok(None)
        })
        .non_committing(move |users| {
            assert_eq!(stats.committed(), 1);
            Ok(users.get("carol"))
        })
        .run()
        .unwrap();

    assert_eq!(reread.as_deref(), Some("Carol"));
    assert_eq!(
        h.memory_stats.events(),
        vec![
            ContextEvent::Created(1),
            ContextEvent::Committed(1),
            ContextEvent::Disposed(1)
        ]
    );
}

#[test]
fn work_failure_propagates_unchanged_and_releases() {
    let h = Harness::new();
    let scope = h.service().create_scope::<Users>();

    let err = scope
        .commit(|users| -> ScopeResult<()> {
            users.insert("dan", "Dan")?;
            Err(ScopeError::backend(std::io::Error::new(
                std::io::ErrorKind::Other,
                "validation failed",
            )))
        })
        .unwrap_err();

    assert!(matches!(err, ScopeError::Backend { .. }));
    assert_eq!(h.memory_stats.committed(), 0);
    assert!(h.store.get("user:dan").is_none());
    assert_eq!(h.live_contexts(), 0);
    assert!(scope.current_context().is_none());
}

#[test]
fn current_context_is_visible_only_inside_a_call() {
    let h = Harness::new();
    let scope = h.service().create_scope::<Users>();
    assert!(scope.current_context().is_none());

    let (published, bound) = scope
        .read_only(|users| {
            let current = scope.current_context().expect("published");
            assert!(ScopeService::current_context()
                .map(|c| c.ptr_eq(&current))
                .unwrap_or(false));
            let db = current.downcast::<MemoryContext>().expect("memory context");
            Ok((db.id(), users.context_id()))
        })
        .unwrap();

    assert_eq!(published, bound);
    assert!(scope.current_context().is_none());
}

#[test]
fn sequential_calls_acquire_independent_contexts() {
    let h = Harness::new();
    let scope = h.service().create_scope::<Users>();

    let first = scope.read_only(|users| Ok(users.context_id())).unwrap();
    let second = scope.read_only(|users| Ok(users.context_id())).unwrap();

    assert_ne!(first, second);
    assert_eq!(h.memory_stats.created(), 2);
    assert_eq!(h.memory_stats.disposed(), 2);
}

#[test]
fn facade_without_a_context_reports_no_context() {
    let h = Harness::new();
    let scope = h.service().create_scope::<String>();

    let err = scope.read_only(|_| Ok(())).unwrap_err();

    assert!(matches!(err, ScopeError::NoContext { repository } if repository.is::<String>()));
}

#[test]
fn unknown_facade_releases_the_fresh_context() {
    let h = Harness::new();
    let service = ScopeService::new(RepositoryRegistry::new(), h.provider(), ScopeConfig::new());

    let err = service
        .create_scope::<Users>()
        .commit(|users| users.insert("eve", "Eve"))
        .unwrap_err();

    assert!(matches!(err, ScopeError::UnknownRepository { repository } if repository.is::<Users>()));
    assert_eq!(h.memory_stats.created(), 1);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn seed_runs_against_a_fresh_context() {
    let h = Harness::new();

    h.service().seed::<Users>().unwrap();

    assert_eq!(h.store.get("user:admin").as_deref(), Some("Administrator"));
    assert_eq!(h.memory_stats.seeded(), 1);
    assert_eq!(h.live_contexts(), 0);
    assert!(matches!(
        h.service().seed::<String>(),
        Err(ScopeError::NoContext { .. })
    ));
}

#[test]
fn scope_factories_hand_out_scopes_across_threads() {
    let h = Harness::new();
    let factory = h.service().scope_factory::<Users>();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let factory = factory.clone();
            std::thread::spawn(move || {
                factory
                    .create()
                    .commit(|users| users.insert(&format!("worker{i}"), "Worker"))
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread").unwrap();
    }

    assert_eq!(h.store.keys_with_prefix("user:worker").len(), 4);
    assert_eq!(h.memory_stats.committed(), 4);
    assert_eq!(h.live_contexts(), 0);
}

#[test]
fn scope_reports_its_repository_type() {
    let h = Harness::new();
    let scope = h.service().create_scope::<Users>();
    assert_eq!(scope.repository_types(), &[RepositoryType::of::<Users>()]);
    let copy = scope.clone();
    assert_eq!(copy.repository_types(), scope.repository_types());
}

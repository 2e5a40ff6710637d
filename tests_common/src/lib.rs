//! Common integration testing utilities: in-memory contexts, facades and
//! recording collaborators shared by the unitscope tests and benches.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use unitscope::{
    Context, ContextRef, ContextType, ErrorCodeClassifier, MultiSourceContextProvider,
    RepositoryFactory, RepositoryRegistry, RepositoryType, ScopeConfig, ScopeError, ScopeResult,
    ScopeService, StoreError,
};

/// Code reported when a row changed or vanished since it was read.
pub const STALE_ROW: i64 = 3960;
/// Code reported when an insert hits an existing key.
pub const DUPLICATE_KEY: i64 = 2601;
/// Code for failures worth retrying (deadlock victim and the like).
pub const TRANSIENT: i64 = 1205;

/// Users written by `MemoryContext::seed`.
pub const SEED_USERS: &[(&str, &str)] = &[("admin", "Administrator"), ("guest", "Guest")];

/// Lifecycle events recorded by the in-memory contexts, tagged with the context id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    Created(usize),
    Committed(usize),
    Seeded(usize),
    Disposed(usize),
}

/// Thread-safe counters shared by every context of one kind.
#[derive(Debug, Default)]
pub struct ContextStats {
    created: AtomicUsize,
    committed: AtomicUsize,
    seeded: AtomicUsize,
    disposed: AtomicUsize,
    events: Mutex<Vec<ContextEvent>>,
}

impl ContextStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn seeded(&self) -> usize {
        self.seeded.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Contexts created but not yet disposed.
    pub fn live(&self) -> usize {
        self.created() - self.disposed()
    }

    pub fn events(&self) -> Vec<ContextEvent> {
        lock(&self.events).clone()
    }

    fn register(&self) -> usize {
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.events).push(ContextEvent::Created(id));
        id
    }

    fn record(&self, event: ContextEvent) {
        let counter = match event {
            ContextEvent::Created(_) => &self.created,
            ContextEvent::Committed(_) => &self.committed,
            ContextEvent::Seeded(_) => &self.seeded,
            ContextEvent::Disposed(_) => &self.disposed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        lock(&self.events).push(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Row {
    value: String,
    version: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    rows: BTreeMap<String, Row>,
    failures: VecDeque<i64>,
}

/// Versioned key/value rows shared by all contexts of a harness.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.state).rows.get(key).map(|row| row.value.clone())
    }

    pub fn version(&self, key: &str) -> Option<u64> {
        lock(&self.state).rows.get(key).map(|row| row.version)
    }

    /// Write directly, bypassing any context; bumps the row version.
    pub fn put(&self, key: &str, value: &str) {
        let mut state = lock(&self.state);
        let version = state.rows.get(key).map(|row| row.version + 1).unwrap_or(1);
        state.rows.insert(
            key.to_string(),
            Row {
                value: value.to_string(),
                version,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        lock(&self.state).rows.remove(key);
    }

    pub fn len(&self) -> usize {
        lock(&self.state).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        lock(&self.state)
            .rows
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Make the next commit (of any context) fail with `code` before applying anything.
    pub fn fail_next_commit(&self, code: i64) {
        lock(&self.state).failures.push_back(code);
    }

    pub fn pending_failures(&self) -> usize {
        lock(&self.state).failures.len()
    }

    fn apply(&self, changes: &[Change]) -> ScopeResult<()> {
        let mut state = lock(&self.state);
        if let Some(code) = state.failures.pop_front() {
            return Err(store_error(code, "injected commit failure"));
        }
        for change in changes {
            match change {
                Change::Insert { key, .. } => {
                    if state.rows.contains_key(key) {
                        return Err(store_error(
                            DUPLICATE_KEY,
                            format!("cannot insert duplicate key '{key}'"),
                        ));
                    }
                }
                Change::Update { key, expected, .. } | Change::Delete { key, expected } => {
                    let current = state.rows.get(key).map(|row| row.version);
                    if current != Some(*expected) {
                        return Err(store_error(
                            STALE_ROW,
                            format!("row '{key}' changed or vanished since it was read"),
                        ));
                    }
                }
            }
        }
        for change in changes {
            match change {
                Change::Insert { key, value } => {
                    state.rows.insert(
                        key.clone(),
                        Row {
                            value: value.clone(),
                            version: 1,
                        },
                    );
                }
                Change::Update {
                    key,
                    value,
                    expected,
                } => {
                    state.rows.insert(
                        key.clone(),
                        Row {
                            value: value.clone(),
                            version: expected + 1,
                        },
                    );
                }
                Change::Delete { key, .. } => {
                    state.rows.remove(key);
                }
            }
        }
        Ok(())
    }
}

fn store_error(code: i64, message: impl Into<String>) -> ScopeError {
    ScopeError::backend(StoreError::new(code, message))
}

#[derive(Debug, Clone)]
enum Change {
    Insert {
        key: String,
        value: String,
    },
    Update {
        key: String,
        value: String,
        expected: u64,
    },
    Delete {
        key: String,
        expected: u64,
    },
}

/// Change-tracking context over a [`MemoryStore`] with optimistic versions.
#[derive(Debug)]
pub struct MemoryContext {
    id: usize,
    store: MemoryStore,
    stats: Arc<ContextStats>,
    pending: RefCell<Vec<Change>>,
    read_versions: RefCell<HashMap<String, u64>>,
}

impl MemoryContext {
    pub fn new(store: MemoryStore, stats: Arc<ContextStats>) -> Self {
        let id = stats.register();
        Self {
            id,
            store,
            stats,
            pending: RefCell::new(Vec::new()),
            read_versions: RefCell::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn pending_changes(&self) -> usize {
        self.pending.borrow().len()
    }

    fn read(&self, key: &str) -> Option<String> {
        let state = lock(&self.store.state);
        let row = state.rows.get(key)?;
        self.read_versions
            .borrow_mut()
            .insert(key.to_string(), row.version);
        Some(row.value.clone())
    }

    fn expected_version(&self, key: &str) -> Option<u64> {
        let seen = self.read_versions.borrow().get(key).copied();
        seen.or_else(|| self.store.version(key))
    }

    fn stage(&self, change: Change) {
        self.pending.borrow_mut().push(change);
    }
}

impl Context for MemoryContext {
    fn commit(&self) -> ScopeResult<()> {
        let changes = self.pending.take();
        self.read_versions.borrow_mut().clear();
        self.store.apply(&changes)?;
        self.stats.record(ContextEvent::Committed(self.id));
        Ok(())
    }

    fn seed(&self) -> ScopeResult<()> {
        for (key, name) in SEED_USERS {
            let key = user_key(key);
            if self.store.get(&key).is_none() {
                self.store.put(&key, name);
            }
        }
        self.stats.record(ContextEvent::Seeded(self.id));
        Ok(())
    }

    fn dispose(&self) {
        self.pending.borrow_mut().clear();
        self.stats.record(ContextEvent::Disposed(self.id));
    }
}

/// Append-only context of a different type, used to provoke incompatibilities.
#[derive(Debug)]
pub struct AuditContext {
    id: usize,
    stats: Arc<ContextStats>,
    entries: RefCell<Vec<String>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl AuditContext {
    pub fn new(stats: Arc<ContextStats>, journal: Arc<Mutex<Vec<String>>>) -> Self {
        let id = stats.register();
        Self {
            id,
            stats,
            entries: RefCell::new(Vec::new()),
            journal,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl Context for AuditContext {
    fn commit(&self) -> ScopeResult<()> {
        lock(&self.journal).extend(self.entries.take());
        self.stats.record(ContextEvent::Committed(self.id));
        Ok(())
    }

    fn dispose(&self) {
        self.stats.record(ContextEvent::Disposed(self.id));
    }
}

fn user_key(key: &str) -> String {
    format!("user:{key}")
}

fn role_key(key: &str) -> String {
    format!("role:{key}")
}

fn profile_key(key: &str) -> String {
    format!("profile:{key}")
}

/// User rows, bound to a [`MemoryContext`].
#[derive(Debug, Clone)]
pub struct Users {
    db: Rc<MemoryContext>,
}

impl Users {
    pub fn context_id(&self) -> usize {
        self.db.id()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.db.read(&user_key(key))
    }

    pub fn insert(&self, key: &str, name: &str) -> ScopeResult<()> {
        self.db.stage(Change::Insert {
            key: user_key(key),
            value: name.to_string(),
        });
        Ok(())
    }

    /// Stage an update guarded by the version last read (or the current one).
    pub fn rename(&self, key: &str, name: &str) -> ScopeResult<()> {
        let key = user_key(key);
        let expected = self.db.expected_version(&key).unwrap_or(0);
        self.db.stage(Change::Update {
            key,
            value: name.to_string(),
            expected,
        });
        Ok(())
    }

    pub fn delete(&self, key: &str) -> ScopeResult<()> {
        let key = user_key(key);
        let expected = self.db.expected_version(&key).unwrap_or(0);
        self.db.stage(Change::Delete { key, expected });
        Ok(())
    }

    /// Lazy scan over user names; reads the store on each step and does not
    /// need the context.
    pub fn names(&self) -> NameCursor {
        NameCursor {
            store: self.db.store().clone(),
            keys: self.db.store().keys_with_prefix("user:").into(),
        }
    }
}

/// Role rows; shares the [`MemoryContext`] type with [`Users`].
#[derive(Debug, Clone)]
pub struct Roles {
    db: Rc<MemoryContext>,
}

impl Roles {
    pub fn context_id(&self) -> usize {
        self.db.id()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.db.read(&role_key(key))
    }

    pub fn grant(&self, user: &str, role: &str) -> ScopeResult<()> {
        self.db.stage(Change::Insert {
            key: role_key(user),
            value: role.to_string(),
        });
        Ok(())
    }
}

/// Free-text profile rows; a third facade over [`MemoryContext`].
#[derive(Debug, Clone)]
pub struct Profiles {
    db: Rc<MemoryContext>,
}

impl Profiles {
    pub fn context_id(&self) -> usize {
        self.db.id()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.db.read(&profile_key(key))
    }

    pub fn create(&self, key: &str, bio: &str) -> ScopeResult<()> {
        self.db.stage(Change::Insert {
            key: profile_key(key),
            value: bio.to_string(),
        });
        Ok(())
    }
}

/// Audit trail, bound to an [`AuditContext`].
#[derive(Debug, Clone)]
pub struct AuditLog {
    db: Rc<AuditContext>,
}

impl AuditLog {
    pub fn context_id(&self) -> usize {
        self.db.id()
    }

    pub fn record(&self, entry: &str) -> ScopeResult<()> {
        self.db.entries.borrow_mut().push(entry.to_string());
        Ok(())
    }
}

/// Lazily reads user names from the store.
#[derive(Debug)]
pub struct NameCursor {
    store: MemoryStore,
    keys: VecDeque<String>,
}

impl Iterator for NameCursor {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while let Some(key) = self.keys.pop_front() {
            if let Some(value) = self.store.get(&key) {
                return Some(value);
            }
        }
        None
    }
}

/// One recorded call into the repository factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryCall {
    pub repository: RepositoryType,
    pub context: ContextType,
}

/// Factory wrapper that records every call before delegating.
pub struct RecordingFactory<F> {
    inner: F,
    calls: Arc<Mutex<Vec<FactoryCall>>>,
}

impl<F: RepositoryFactory> RecordingFactory<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            calls: Arc::default(),
        }
    }

    /// Handle onto the shared call log.
    pub fn calls(&self) -> Arc<Mutex<Vec<FactoryCall>>> {
        self.calls.clone()
    }
}

impl<F: RepositoryFactory> RepositoryFactory for RecordingFactory<F> {
    fn create(
        &self,
        repository: RepositoryType,
        context: &ContextRef,
    ) -> ScopeResult<Box<dyn std::any::Any>> {
        lock(&self.calls).push(FactoryCall {
            repository,
            context: context.context_type(),
        });
        self.inner.create(repository, context)
    }
}

/// Conflict classifier matching the codes the in-memory store reports.
pub fn classifier() -> ErrorCodeClassifier {
    ErrorCodeClassifier::new()
        .with_optimistic_codes([STALE_ROW])
        .with_duplicate_key_codes([DUPLICATE_KEY])
}

/// A store plus the stats, provider and registry wiring around it.
#[derive(Debug, Clone, Default)]
pub struct Harness {
    pub store: MemoryStore,
    pub memory_stats: Arc<ContextStats>,
    pub audit_stats: Arc<ContextStats>,
    pub journal: Arc<Mutex<Vec<String>>>,
    pub factory_calls: Arc<Mutex<Vec<FactoryCall>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Users, Roles and Profiles resolve to a [`MemoryContext`], AuditLog to an
    /// [`AuditContext`]; anything else has no context.
    pub fn provider(&self) -> MultiSourceContextProvider {
        let (store, stats) = (self.store.clone(), self.memory_stats.clone());
        let (audit_stats, journal) = (self.audit_stats.clone(), self.journal.clone());
        MultiSourceContextProvider::new()
            .with_source(move |repository: RepositoryType| {
                (repository.is::<Users>()
                    || repository.is::<Roles>()
                    || repository.is::<Profiles>())
                    .then(|| ContextRef::new(MemoryContext::new(store.clone(), stats.clone())))
            })
            .with_source(move |repository: RepositoryType| {
                repository.is::<AuditLog>().then(|| {
                    ContextRef::new(AuditContext::new(audit_stats.clone(), journal.clone()))
                })
            })
    }

    pub fn registry(&self) -> RepositoryRegistry {
        RepositoryRegistry::new()
            .register_for_context(|db: Rc<MemoryContext>| Ok(Users { db }))
            .register_for_context(|db: Rc<MemoryContext>| Ok(Roles { db }))
            .register_for_context(|db: Rc<MemoryContext>| Ok(Profiles { db }))
            .register_for_context(|db: Rc<AuditContext>| Ok(AuditLog { db }))
    }

    /// Service with the store's conflict codes configured.
    pub fn service(&self) -> ScopeService {
        self.service_with(ScopeConfig::new().with_conflict_classifier(classifier()))
    }

    pub fn service_with(&self, config: ScopeConfig) -> ScopeService {
        let factory = RecordingFactory {
            inner: self.registry(),
            calls: self.factory_calls.clone(),
        };
        ScopeService::new(factory, self.provider(), config)
    }

    pub fn factory_calls(&self) -> Vec<FactoryCall> {
        lock(&self.factory_calls).clone()
    }

    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }

    /// Contexts of either kind created but not yet disposed.
    pub fn live_contexts(&self) -> usize {
        self.memory_stats.live() + self.audit_stats.live()
    }
}

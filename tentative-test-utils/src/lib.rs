//! Tentative Test Utilities
//!
//! Shared test infrastructure for the tentative workspace:
//! - A scriptable mock of the remote procedure client
//! - Proptest generators for keys, values and mutation outcomes
//! - Todo-list fixtures for end-to-end scenarios
//! - Assertions over cache entries

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::sync::oneshot;

// Re-export the types most tests need
pub use tentative_cache::{
    CacheSession, CacheStore, MutationDispatcher, MutationPlan, ReconciliationCoordinator,
    RefetchOutcome, RemoteProcedureClient,
};
pub use tentative_core::{
    CacheEntry, CacheKey, EntryStatus, MutationError, ReconcileConfig, RemoteFailure,
    RemoteFailureKind,
};

// ============================================================================
// TRACING
// ============================================================================

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a test-friendly tracing subscriber once per process. Honors
/// `RUST_LOG`, defaults to warnings only.
pub fn init_test_tracing() {
    TRACING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// MOCK REMOTE CLIENT
// ============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Handler<V> =
    Arc<dyn Fn(&Value, &mut HashMap<CacheKey, V>) -> Result<Value, RemoteFailure> + Send + Sync>;

#[derive(Debug)]
enum Gate {
    Proceed,
    Fail(RemoteFailure),
}

/// Holds back one remote reply until released. Dropping it unresolved fails
/// the call as unavailable.
#[derive(Debug)]
pub struct DeferredReply {
    tx: oneshot::Sender<Gate>,
}

impl DeferredReply {
    /// Let the call proceed as if it had never been deferred.
    pub fn release(self) {
        let _ = self.tx.send(Gate::Proceed);
    }

    pub fn fail(self, failure: RemoteFailure) {
        let _ = self.tx.send(Gate::Fail(failure));
    }
}

/// A recorded call to [`RemoteProcedureClient::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub procedure: String,
    pub args: Value,
}

/// In-memory stand-in for a server.
///
/// Server state is a map from cache key to value, read by `fetch`. Mutation
/// procedures resolve in this order: a pending [`DeferredReply`] gate, then
/// a scripted reply, then a registered handler, then `Ok(Value::Null)`.
pub struct MockRemoteClient<V> {
    server: Mutex<HashMap<CacheKey, V>>,
    handlers: Mutex<HashMap<String, Handler<V>>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<Value, RemoteFailure>>>>,
    gates: Mutex<HashMap<String, VecDeque<oneshot::Receiver<Gate>>>>,
    invocations: Mutex<Vec<Invocation>>,
    fetches: Mutex<HashMap<CacheKey, usize>>,
    fetch_failure: Mutex<Option<RemoteFailureKind>>,
}

impl<V> Default for MockRemoteClient<V> {
    fn default() -> Self {
        Self {
            server: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            fetches: Mutex::new(HashMap::new()),
            fetch_failure: Mutex::new(None),
        }
    }
}

impl<V: Clone> MockRemoteClient<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_value(self, key: CacheKey, value: V) -> Self {
        self.set_server_value(key, value);
        self
    }

    pub fn set_server_value(&self, key: CacheKey, value: V) {
        lock(&self.server).insert(key, value);
    }

    pub fn remove_server_value(&self, key: &CacheKey) {
        lock(&self.server).remove(key);
    }

    pub fn server_value(&self, key: &CacheKey) -> Option<V> {
        lock(&self.server).get(key).cloned()
    }

    /// Run `handler` against server state whenever `procedure` is invoked.
    pub fn on_invoke<F>(&self, procedure: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &mut HashMap<CacheKey, V>) -> Result<Value, RemoteFailure>
            + Send
            + Sync
            + 'static,
    {
        lock(&self.handlers).insert(procedure.into(), Arc::new(handler));
    }

    /// Queue a canned reply for the next call to `procedure`. Server state is
    /// not touched.
    pub fn reply(&self, procedure: impl Into<String>, reply: Result<Value, RemoteFailure>) {
        lock(&self.scripted)
            .entry(procedure.into())
            .or_default()
            .push_back(reply);
    }

    /// Fail the next call to `procedure` with `kind`.
    pub fn fail_next(&self, procedure: &str, kind: RemoteFailureKind) {
        self.reply(
            procedure,
            Err(RemoteFailure::new(procedure, kind, "scripted failure")),
        );
    }

    /// Hold the next call to `procedure` until the returned reply resolves.
    pub fn defer(&self, procedure: &str) -> DeferredReply {
        self.add_gate(format!("invoke:{procedure}"))
    }

    /// Hold the next fetch of `key` until the returned reply resolves. The
    /// server value is read when the fetch arrives, so the held reply carries
    /// whatever the server had at that moment.
    pub fn defer_fetch(&self, key: &CacheKey) -> DeferredReply {
        self.add_gate(format!("fetch:{}", key.canonical()))
    }

    fn add_gate(&self, gate: String) -> DeferredReply {
        let (tx, rx) = oneshot::channel();
        lock(&self.gates).entry(gate).or_default().push_back(rx);
        DeferredReply { tx }
    }

    async fn pass_gate(&self, gate: &str, procedure: &str) -> Result<(), RemoteFailure> {
        let rx = lock(&self.gates).get_mut(gate).and_then(VecDeque::pop_front);
        let Some(rx) = rx else {
            return Ok(());
        };
        match rx.await {
            Ok(Gate::Proceed) => Ok(()),
            Ok(Gate::Fail(failure)) => Err(failure),
            Err(_) => Err(RemoteFailure::unavailable(procedure, "deferred reply dropped")),
        }
    }

    /// Fail every fetch with `kind` until cleared with `None`.
    pub fn set_fetch_failure(&self, kind: Option<RemoteFailureKind>) {
        *lock(&self.fetch_failure) = kind;
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    pub fn invocation_count(&self, procedure: &str) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|call| call.procedure == procedure)
            .count()
    }

    pub fn fetch_count(&self, key: &CacheKey) -> usize {
        lock(&self.fetches).get(key).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        lock(&self.fetches).values().sum()
    }
}

#[async_trait]
impl<V> RemoteProcedureClient<V> for MockRemoteClient<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn invoke(&self, procedure: &str, args: &Value) -> Result<Value, RemoteFailure> {
        lock(&self.invocations).push(Invocation {
            procedure: procedure.to_string(),
            args: args.clone(),
        });
        self.pass_gate(&format!("invoke:{procedure}"), procedure)
            .await?;

        let scripted = lock(&self.scripted)
            .get_mut(procedure)
            .and_then(VecDeque::pop_front);
        if let Some(reply) = scripted {
            return reply;
        }

        let handler = lock(&self.handlers).get(procedure).cloned();
        match handler {
            Some(handler) => {
                let mut server = lock(&self.server);
                handler(args, &mut *server)
            }
            None => Ok(Value::Null),
        }
    }

    async fn fetch(&self, key: &CacheKey) -> Result<V, RemoteFailure> {
        *lock(&self.fetches).entry(key.clone()).or_insert(0) += 1;
        let value = self.server_value(key);
        self.pass_gate(&format!("fetch:{}", key.canonical()), key.procedure())
            .await?;

        let failure = *lock(&self.fetch_failure);
        if let Some(kind) = failure {
            return Err(RemoteFailure::new(
                key.procedure(),
                kind,
                "scripted fetch failure",
            ));
        }

        value.ok_or_else(|| {
            RemoteFailure::not_found(key.procedure(), format!("no server value for {key}"))
        })
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, values and mutation outcomes.

    use super::fixtures::TodoItem;
    use super::*;
    use proptest::prelude::*;

    /// Dotted procedure names such as `todo.list`.
    pub fn arb_procedure() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(\\.[a-z]{1,8})?"
    }

    pub fn arb_args() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<u32>().prop_map(|id| serde_json::json!({ "id": id })),
            ("[a-z]{0,6}", any::<bool>())
                .prop_map(|(q, done)| serde_json::json!({ "q": q, "done": done })),
        ]
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_procedure(), arb_args()).prop_map(|(procedure, args)| {
            CacheKey::new(procedure, &args).expect("generated procedure is non-empty")
        })
    }

    /// A small pool of keys, so generated mutations collide.
    pub fn arb_key_pool(max: usize) -> impl Strategy<Value = Vec<CacheKey>> {
        (1..=max.max(1)).prop_map(|n| (0..n as u32).map(fixtures::todo_key).collect())
    }

    pub fn arb_entry_status() -> impl Strategy<Value = EntryStatus> {
        prop_oneof![
            Just(EntryStatus::Fresh),
            Just(EntryStatus::Stale),
            Just(EntryStatus::Pending),
        ]
    }

    pub fn arb_todo_item() -> impl Strategy<Value = TodoItem> {
        (any::<u32>(), "[a-z ]{1,16}", any::<bool>())
            .prop_map(|(id, title, done)| TodoItem { id, title, done })
    }

    /// Remote outcomes for a sequence of mutations: `true` is accepted.
    pub fn arb_outcomes(max: usize) -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 1..=max.max(1))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! A todo list served over two procedures: `todo.get` for one item and
    //! `todo.list` for all of them.

    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoItem {
        pub id: u32,
        pub title: String,
        pub done: bool,
    }

    impl TodoItem {
        pub fn new(id: u32, title: impl Into<String>) -> Self {
            Self {
                id,
                title: title.into(),
                done: false,
            }
        }

        pub fn toggled(&self) -> Self {
            Self {
                done: !self.done,
                ..self.clone()
            }
        }
    }

    pub fn todo_key(id: u32) -> CacheKey {
        CacheKey::new("todo.get", &serde_json::json!({ "id": id }))
            .expect("todo.get is a valid procedure")
    }

    pub fn todo_list_key() -> CacheKey {
        CacheKey::procedure_only("todo.list").expect("todo.list is a valid procedure")
    }

    /// Optimistically flip `done` on one cached item. Fails when the item is
    /// not cached.
    pub fn toggle_plan(id: u32) -> MutationPlan<TodoItem> {
        MutationPlan::new().optimistic(todo_key(id), |current: Option<&TodoItem>| {
            current.map(TodoItem::toggled).ok_or("todo not cached")
        })
    }

    pub fn toggle_args(id: u32) -> Value {
        serde_json::json!({ "id": id })
    }

    /// Server holding `items`, with `todo.toggle` flipping `done` on the
    /// item named by the `id` argument.
    pub fn todo_server(items: &[TodoItem]) -> MockRemoteClient<TodoItem> {
        let client = MockRemoteClient::new();
        for item in items {
            client.set_server_value(todo_key(item.id), item.clone());
        }
        client.on_invoke("todo.toggle", |args, server| {
            let id = args
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| RemoteFailure::rejected("todo.toggle", "missing id"))?
                as u32;
            let item = server
                .get_mut(&todo_key(id))
                .ok_or_else(|| RemoteFailure::not_found("todo.toggle", format!("todo {id}")))?;
            item.done = !item.done;
            Ok(serde_json::json!({ "id": id, "done": item.done }))
        });
        client
    }

    /// Short timeouts for tests that exercise the refetch path.
    pub fn fast_config() -> ReconcileConfig {
        ReconcileConfig::default()
            .with_refetch_timeout(Duration::from_millis(500))
            .with_stale_sweep_interval(Duration::from_millis(20))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over cache entries.

    use super::*;
    use std::fmt::Debug;

    /// Assert the entry under `key` holds exactly `value`, `version` and
    /// `status`.
    #[track_caller]
    pub fn assert_entry<V>(
        store: &CacheStore<V>,
        key: &CacheKey,
        value: &V,
        version: u64,
        status: EntryStatus,
    ) where
        V: Clone + Debug + PartialEq + Send + Sync + 'static,
    {
        let entry = store
            .read(key)
            .expect("store lock poisoned")
            .unwrap_or_else(|| panic!("Expected entry for {key}, found none"));
        assert_eq!(entry.value.as_ref(), Some(value), "value of {key}");
        assert_eq!(entry.version, version, "version of {key}");
        assert_eq!(entry.status, status, "status of {key}");
    }

    #[track_caller]
    pub fn assert_status<V>(store: &CacheStore<V>, key: &CacheKey, status: EntryStatus)
    where
        V: Clone + Send + Sync + 'static,
    {
        let entry = store
            .read(key)
            .expect("store lock poisoned")
            .unwrap_or_else(|| panic!("Expected entry for {key}, found none"));
        assert_eq!(entry.status, status, "status of {key}");
    }

    #[track_caller]
    pub fn assert_absent<V>(store: &CacheStore<V>, key: &CacheKey)
    where
        V: Clone + Debug + Send + Sync + 'static,
    {
        let entry = store.read(key).expect("store lock poisoned");
        assert!(entry.is_none(), "Expected no entry for {key}, got {entry:?}");
    }

    /// Assert a mutation failed remotely with `kind`.
    #[track_caller]
    pub fn assert_remote_failure<T: Debug>(result: &Result<T, MutationError>, kind: RemoteFailureKind) {
        match result {
            Err(MutationError::Remote(failure)) => {
                assert_eq!(failure.kind, kind, "Wrong remote failure kind");
            }
            other => panic!("Expected remote failure {kind:?}, got: {other:?}"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

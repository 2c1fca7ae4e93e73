//! Test fixtures and database helpers.
//!
//! Provides databases wired to an in-memory server, event recorders and
//! latches for waiting on completion callbacks.

use crate::connection::MemoryConnection;
use crate::hasher::HijackableHasher;
use crate::server::MemoryServer;
use parking_lot::{Condvar, Mutex};
use rtdb_core::{
    DataSnapshot, Database, DatabaseConfig, DatabaseError, Event, EventListener, EventType,
    RepoInfo, TransactionConfig,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

/// How long helpers wait before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Installs a `tracing` subscriber for tests, filtered by `RUST_LOG`
/// (default `warn`). Safe to call from every test.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn unique_namespace() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("test-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A database connected to a [`MemoryServer`], shut down on drop.
pub struct TestDatabase {
    /// The database.
    pub db: Database,
    /// Control handle for its connection.
    pub connection: MemoryConnection,
    /// The hasher its transactions use.
    pub hasher: Arc<HijackableHasher>,
}

impl TestDatabase {
    /// A database on a fresh server.
    pub fn new() -> Self {
        Self::with_server(&MemoryServer::new())
    }

    /// A database on `server`; several may share one server.
    pub fn with_server(server: &MemoryServer) -> Self {
        Self::build(MemoryConnection::new(server), TransactionConfig::default())
    }

    /// A database on `server` that starts offline.
    pub fn offline(server: &MemoryServer) -> Self {
        Self::build(MemoryConnection::offline(server), TransactionConfig::default())
    }

    /// A database on `server` with custom transaction settings.
    pub fn with_transactions(server: &MemoryServer, transactions: TransactionConfig) -> Self {
        Self::build(MemoryConnection::new(server), transactions)
    }

    fn build(connection: MemoryConnection, transactions: TransactionConfig) -> Self {
        init_test_logging();
        let hasher = Arc::new(HijackableHasher::new());
        let config = DatabaseConfig::new(RepoInfo::new("localhost:9000", unique_namespace()))
            .with_transactions(transactions)
            .with_hasher(hasher.clone());
        let db = Database::new(config, Box::new(connection.clone()))
            .expect("Failed to start test database");
        Self {
            db,
            connection,
            hasher,
        }
    }

    /// The server behind the connection.
    pub fn server(&self) -> &MemoryServer {
        self.connection.server()
    }

    /// Waits until the run loop has nothing left to do.
    pub fn settle(&self) {
        self.db
            .wait_idle(DEFAULT_TIMEOUT)
            .expect("Database did not settle");
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        self.db.shutdown();
    }
}

/// Runs a test with a database on a fresh server.
pub fn with_test_db<F, R>(f: F) -> R
where
    F: FnOnce(&TestDatabase) -> R,
{
    let test_db = TestDatabase::new();
    f(&test_db)
}

/// Polls `cond` until it holds or the default timeout passes.
pub fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A value set once from a callback and awaited from the test thread.
pub struct Latch<T> {
    slot: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Latch<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Latch<T> {
    /// Creates an unset latch.
    pub fn new() -> Self {
        Self {
            slot: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// Sets the value, waking waiters. Later sets overwrite it.
    pub fn set(&self, value: T) {
        let (slot, ready) = &*self.slot;
        *slot.lock() = Some(value);
        ready.notify_all();
    }

    /// The value, if set.
    pub fn get(&self) -> Option<T> {
        self.slot.0.lock().clone()
    }

    /// Waits for the value.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let (slot, ready) = &*self.slot;
        let deadline = Instant::now() + timeout;
        let mut value = slot.lock();
        while value.is_none() {
            if ready.wait_until(&mut value, deadline).timed_out() {
                break;
            }
        }
        value.clone()
    }
}

impl<T: Clone + Send + 'static> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a transaction completion reported.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// The error, if any.
    pub error: Option<DatabaseError>,
    /// Whether the value was committed.
    pub committed: bool,
    /// The snapshot value passed to the completion.
    pub value: Value,
}

/// A latch plus the completion callback that fills it.
pub fn transaction_latch() -> (
    Latch<TransactionResult>,
    impl FnOnce(Option<DatabaseError>, bool, DataSnapshot) + Send + 'static,
) {
    let latch = Latch::new();
    let setter = latch.clone();
    (latch, move |error: Option<DatabaseError>, committed: bool, snapshot: DataSnapshot| {
        setter.set(TransactionResult {
            error,
            committed,
            value: snapshot.value(),
        })
    })
}

/// A latch plus a write completion callback that fills it.
pub fn write_latch() -> (
    Latch<Option<DatabaseError>>,
    impl FnOnce(Option<DatabaseError>) + Send + 'static,
) {
    let latch = Latch::new();
    let setter = latch.clone();
    (latch, move |error: Option<DatabaseError>| setter.set(error))
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Event kind.
    pub event_type: EventType,
    /// Key of the snapshot, as a string.
    pub key: Option<String>,
    /// Snapshot value.
    pub value: Value,
    /// Preceding sibling key, as a string.
    pub prev: Option<String>,
}

/// A listener that records everything it receives.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    cancelled: Arc<Mutex<Vec<DatabaseError>>>,
}

impl EventRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Values of the `value` events so far.
    pub fn values(&self) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == EventType::Value)
            .map(|e| e.value.clone())
            .collect()
    }

    /// `(type, key)` of the child events so far.
    pub fn child_events(&self) -> Vec<(EventType, String)> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type != EventType::Value)
            .map(|e| (e.event_type, e.key.clone().unwrap_or_default()))
            .collect()
    }

    /// Cancellation errors so far.
    pub fn cancellations(&self) -> Vec<DatabaseError> {
        self.cancelled.lock().clone()
    }

    /// Forgets everything recorded.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventListener for EventRecorder {
    fn on_event(&mut self, event: &Event) {
        self.events.lock().push(RecordedEvent {
            event_type: event.event_type,
            key: event.snapshot.key().map(|k| k.as_str().to_string()),
            value: event.snapshot.value(),
            prev: event.prev_sibling_key.as_ref().map(|k| k.as_str().to_string()),
        });
    }

    fn on_cancel(&mut self, error: &DatabaseError) {
        self.cancelled.lock().push(error.clone());
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use serde_json::json;

    /// A server holding a small chat room with prioritized messages.
    pub fn chat_server() -> MemoryServer {
        MemoryServer::with_data(&json!({
            "rooms": {
                "lobby": {
                    "messages": {
                        "m1": {".value": "hello", ".priority": 3},
                        "m2": {".value": "hi", ".priority": 1},
                        "m3": {".value": "hey", ".priority": 2}
                    },
                    "members": {"alice": true, "bob": true}
                }
            },
            "counters": {"visits": 0}
        }))
        .expect("Failed to build chat server")
    }

    /// `count` databases sharing one server.
    pub fn clients(server: &MemoryServer, count: usize) -> Vec<TestDatabase> {
        (0..count).map(|_| TestDatabase::with_server(server)).collect()
    }
}

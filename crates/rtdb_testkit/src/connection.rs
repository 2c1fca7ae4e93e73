//! A [`Connection`] to a [`MemoryServer`] with fault injection.

use crate::server::{ConnectionId, MemoryServer, ServerWrite};
use parking_lot::Mutex;
use rtdb_core::{
    Connection, ConnectionDelegate, ListenCallback, ServerError, WriteAck, WriteCallback,
};
use rtdb_node::Path;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

type Delivery = Box<dyn FnOnce() + Send + 'static>;

struct ConnectionState {
    id: ConnectionId,
    delegate: Option<Arc<dyn ConnectionDelegate>>,
    online: bool,
    /// Online as soon as the repo initializes.
    auto_connect: bool,
    paused: bool,
    held: VecDeque<Delivery>,
    listens: BTreeSet<Path>,
    /// Next write fails with this code.
    fail_next_write: Option<String>,
    /// Next listen fails with this code.
    fail_next_listen: Option<String>,
    sent_writes: usize,
}

struct Inner {
    server: MemoryServer,
    state: Mutex<ConnectionState>,
}

/// A connection to an in-memory server.
///
/// Clones share state, so a test keeps one clone to control the connection
/// after handing another to the database.
#[derive(Clone)]
pub struct MemoryConnection {
    inner: Arc<Inner>,
}

impl MemoryConnection {
    /// A connection that goes online when the repo starts.
    pub fn new(server: &MemoryServer) -> Self {
        Self::build(server, true)
    }

    /// A connection that stays offline until [`MemoryConnection::connect`].
    pub fn offline(server: &MemoryServer) -> Self {
        Self::build(server, false)
    }

    fn build(server: &MemoryServer, auto_connect: bool) -> Self {
        let id = server.register();
        Self {
            inner: Arc::new(Inner {
                server: server.clone(),
                state: Mutex::new(ConnectionState {
                    id,
                    delegate: None,
                    online: false,
                    auto_connect,
                    paused: false,
                    held: VecDeque::new(),
                    listens: BTreeSet::new(),
                    fail_next_write: None,
                    fail_next_listen: None,
                    sent_writes: 0,
                }),
            }),
        }
    }

    /// The server behind this connection.
    pub fn server(&self) -> &MemoryServer {
        &self.inner.server
    }

    /// Returns true while connected.
    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    /// Number of puts and merges sent through this connection.
    pub fn sent_writes(&self) -> usize {
        self.inner.state.lock().sent_writes
    }

    /// Holds acknowledgements and pushed data until [`MemoryConnection::flush`].
    pub fn pause_delivery(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Delivers everything held, in order, and stops holding.
    pub fn flush(&self) {
        let held: Vec<Delivery> = {
            let mut state = self.inner.state.lock();
            state.paused = false;
            state.held.drain(..).collect()
        };
        for delivery in held {
            delivery();
        }
    }

    /// Number of held deliveries.
    pub fn held(&self) -> usize {
        self.inner.state.lock().held.len()
    }

    /// Makes the next put or merge fail with `code`.
    pub fn fail_next_write(&self, code: &str) {
        self.inner.state.lock().fail_next_write = Some(code.to_string());
    }

    /// Makes the next listen fail with `code`.
    pub fn fail_next_listen(&self, code: &str) {
        self.inner.state.lock().fail_next_listen = Some(code.to_string());
    }

    /// Connects. Held deliveries from the old connection are discarded.
    pub fn connect(&self) {
        let delegate = {
            let mut state = self.inner.state.lock();
            if state.online {
                return;
            }
            state.online = true;
            state.delegate.clone()
        };
        debug!("memory connection online");
        if let Some(delegate) = delegate {
            delegate.on_connection_state(true);
        }
    }

    /// Disconnects, dropping listens and anything not yet delivered.
    pub fn disconnect(&self) {
        let (delegate, id) = {
            let mut state = self.inner.state.lock();
            if !state.online {
                return;
            }
            state.online = false;
            state.held.clear();
            state.listens.clear();
            (state.delegate.clone(), state.id)
        };
        self.inner.server.disconnect(id);
        debug!("memory connection offline");
        if let Some(delegate) = delegate {
            delegate.on_connection_state(false);
        }
    }

    /// Runs `delivery` now, or holds it while paused.
    fn deliver(&self, delivery: Delivery) {
        let mut state = self.inner.state.lock();
        if !state.online {
            return;
        }
        if state.paused {
            state.held.push_back(delivery);
            return;
        }
        drop(state);
        delivery();
    }

    fn push_sink(&self) -> crate::server::PushSink {
        let connection = self.clone();
        Arc::new(move |path: Path, data: Value| {
            let delegate = connection.inner.state.lock().delegate.clone();
            if let Some(delegate) = delegate {
                connection.deliver(Box::new(move || delegate.on_data_update(path, data, false)));
            }
        })
    }

    fn take_write_failure(&self) -> Option<String> {
        let mut state = self.inner.state.lock();
        state.sent_writes += 1;
        state.fail_next_write.take()
    }

    fn answer(&self, result: ServerWrite, on_complete: WriteCallback) {
        let ack = match result {
            ServerWrite::Applied => WriteAck::ok(),
            ServerWrite::Stale => WriteAck::Stale,
            ServerWrite::Rejected(error) => WriteAck::Error(error),
        };
        self.deliver(Box::new(move || on_complete(ack)));
    }
}

impl Connection for MemoryConnection {
    fn initialize(&mut self, delegate: Arc<dyn ConnectionDelegate>) {
        let auto_connect = {
            let mut state = self.inner.state.lock();
            state.delegate = Some(delegate);
            state.auto_connect
        };
        if auto_connect {
            self.connect();
        }
    }

    fn put(&mut self, path: &Path, value: Value, hash: Option<String>, on_complete: WriteCallback) {
        if !self.is_online() {
            return;
        }
        let result = match self.take_write_failure() {
            Some(code) => ServerWrite::Rejected(ServerError::new(code)),
            None => self.inner.server.put(path, &value, hash.as_deref()),
        };
        self.answer(result, on_complete);
    }

    fn merge(&mut self, path: &Path, patch: Value, on_complete: WriteCallback) {
        if !self.is_online() {
            return;
        }
        let result = match self.take_write_failure() {
            Some(code) => ServerWrite::Rejected(ServerError::new(code)),
            None => self.inner.server.merge(path, &patch),
        };
        self.answer(result, on_complete);
    }

    fn listen(&mut self, path: &Path, on_complete: ListenCallback) {
        let (id, failure) = {
            let mut state = self.inner.state.lock();
            if !state.online || !state.listens.insert(path.clone()) {
                return;
            }
            (state.id, state.fail_next_listen.take())
        };
        if let Some(code) = failure {
            self.inner.state.lock().listens.remove(path);
            self.deliver(Box::new(move || on_complete(Err(ServerError::new(code)))));
            return;
        }
        self.inner.server.listen(id, path, self.push_sink());
        self.deliver(Box::new(move || on_complete(Ok(()))));
    }

    fn unlisten(&mut self, path: &Path) {
        let id = {
            let mut state = self.inner.state.lock();
            state.listens.remove(path);
            state.id
        };
        self.inner.server.unlisten(id, path);
    }

    fn interrupt(&mut self) {
        self.disconnect();
    }

    fn resume(&mut self) {
        self.connect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl ConnectionDelegate for Log {
        fn on_data_update(&self, path: Path, data: Value, is_merge: bool) {
            self.0.lock().push(format!("data {path} {data} {is_merge}"));
        }

        fn on_connection_state(&self, online: bool) {
            self.0.lock().push(format!("online {online}"));
        }
    }

    #[test]
    fn listen_pushes_initial_data_then_completes() {
        let server = MemoryServer::with_data(&json!({"a": 1})).unwrap();
        let mut conn = MemoryConnection::new(&server);
        let log = Arc::new(Log::default());
        conn.initialize(log.clone());
        let done = Arc::new(Mutex::new(None));
        let sink = done.clone();
        conn.listen(&Path::from("a"), Box::new(move |r| *sink.lock() = Some(r)));
        assert_eq!(*done.lock(), Some(Ok(())));
        assert_eq!(
            *log.0.lock(),
            vec!["online true".to_string(), "data /a 1 false".to_string()]
        );
    }

    #[test]
    fn paused_deliveries_wait_for_flush() {
        let server = MemoryServer::new();
        let mut conn = MemoryConnection::new(&server);
        conn.initialize(Arc::new(Log::default()));
        conn.pause_delivery();
        let acks = Arc::new(Mutex::new(Vec::new()));
        let sink = acks.clone();
        conn.put(&Path::from("x"), json!(1), None, Box::new(move |a| sink.lock().push(a)));
        assert!(acks.lock().is_empty());
        assert_eq!(conn.held(), 1);
        assert_eq!(server.value("x"), json!(1));
        conn.flush();
        assert_eq!(*acks.lock(), vec![WriteAck::ok()]);
    }

    #[test]
    fn injected_failures_and_disconnects() {
        let server = MemoryServer::new();
        let mut conn = MemoryConnection::new(&server);
        conn.initialize(Arc::new(Log::default()));
        conn.fail_next_write("permission_denied");
        let acks = Arc::new(Mutex::new(Vec::new()));
        let sink = acks.clone();
        conn.put(&Path::from("x"), json!(1), None, Box::new(move |a| sink.lock().push(a)));
        assert_eq!(
            *acks.lock(),
            vec![WriteAck::Error(ServerError::new("permission_denied"))]
        );
        assert_eq!(server.value("x"), Value::Null);

        conn.disconnect();
        let sink = acks.clone();
        conn.put(&Path::from("x"), json!(1), None, Box::new(move |a| sink.lock().push(a)));
        assert_eq!(acks.lock().len(), 1);
        assert!(!conn.is_online());
    }
}

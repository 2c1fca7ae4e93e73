//! The contract between a repo and its network connection.
//!
//! The repo drives a [`Connection`] from its run loop thread. Completions
//! and pushed data may arrive on any thread; the repo marshals them back
//! onto its loop before touching state.

use parking_lot::Mutex;
use rtdb_node::Path;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// A rejection reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Server error code, e.g. `permission_denied`.
    pub code: String,
    /// Optional detail.
    pub message: Option<String>,
}

impl ServerError {
    /// Creates a server error without detail.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
        }
    }

    /// Adds a detail message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Outcome of a put or merge.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAck {
    /// The write was applied. `resolved` carries the stored value when the
    /// server resolved placeholders in it.
    Ok {
        /// Server-resolved value, in the same shape as the request.
        resolved: Option<Value>,
    },
    /// A compare-and-put hash did not match the stored value.
    Stale,
    /// The write was rejected.
    Error(ServerError),
}

impl WriteAck {
    /// A plain success.
    pub fn ok() -> Self {
        WriteAck::Ok { resolved: None }
    }
}

/// Called once with the outcome of a write.
pub type WriteCallback = Box<dyn FnOnce(WriteAck) + Send + 'static>;

/// Called once with the outcome of a listen.
pub type ListenCallback = Box<dyn FnOnce(Result<(), ServerError>) + Send + 'static>;

/// Receives data and state pushed by a connection.
pub trait ConnectionDelegate: Send + Sync {
    /// New server data at `path`. For merges `data` is an object keyed by
    /// slash-separated paths relative to `path`.
    fn on_data_update(&self, path: Path, data: Value, is_merge: bool);

    /// The connection went online or offline.
    fn on_connection_state(&self, online: bool);
}

/// A connection to the backend.
pub trait Connection: Send {
    /// Hands the connection its delegate. Called once, before any request.
    fn initialize(&mut self, delegate: Arc<dyn ConnectionDelegate>);

    /// Writes `value` at `path`. With a hash the write only succeeds if the
    /// stored value still hashes to it.
    fn put(&mut self, path: &Path, value: Value, hash: Option<String>, on_complete: WriteCallback);

    /// Writes each member of `patch` below `path`.
    fn merge(&mut self, path: &Path, patch: Value, on_complete: WriteCallback);

    /// Starts streaming data at `path`.
    fn listen(&mut self, path: &Path, on_complete: ListenCallback);

    /// Stops streaming data at `path`.
    fn unlisten(&mut self, path: &Path);

    /// Drops the connection until [`Connection::resume`].
    fn interrupt(&mut self);

    /// Reconnects after [`Connection::interrupt`].
    fn resume(&mut self);
}

/// A request recorded by [`MockConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockRequest {
    /// A put.
    Put {
        /// Location.
        path: Path,
        /// Payload.
        value: Value,
        /// Compare-and-put token.
        hash: Option<String>,
    },
    /// A merge.
    Merge {
        /// Location.
        path: Path,
        /// Payload.
        patch: Value,
    },
    /// A listen.
    Listen(Path),
    /// An unlisten.
    Unlisten(Path),
}

#[derive(Default)]
struct MockState {
    delegate: Option<Arc<dyn ConnectionDelegate>>,
    requests: Vec<MockRequest>,
    write_callbacks: VecDeque<WriteCallback>,
    listen_callbacks: VecDeque<(Path, ListenCallback)>,
    interrupted: bool,
}

/// A connection that records requests and lets tests answer them by hand.
///
/// Useful for driving the repo deterministically without a server.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Creates a mock connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request made so far.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of writes awaiting an answer.
    pub fn pending_writes(&self) -> usize {
        self.state.lock().write_callbacks.len()
    }

    /// Answers the oldest unanswered write. Returns false if none is pending.
    pub fn ack_next_write(&self, ack: WriteAck) -> bool {
        let callback = self.state.lock().write_callbacks.pop_front();
        match callback {
            Some(callback) => {
                callback(ack);
                true
            }
            None => false,
        }
    }

    /// Answers the oldest unanswered listen. Returns its path.
    pub fn complete_next_listen(&self, result: Result<(), ServerError>) -> Option<Path> {
        let entry = self.state.lock().listen_callbacks.pop_front();
        entry.map(|(path, callback)| {
            callback(result);
            path
        })
    }

    /// Pushes server data to the repo.
    pub fn push_update(&self, path: Path, data: Value, is_merge: bool) {
        let delegate = self.state.lock().delegate.clone();
        if let Some(delegate) = delegate {
            delegate.on_data_update(path, data, is_merge);
        }
    }

    /// Reports a connection state change to the repo.
    pub fn set_online(&self, online: bool) {
        let delegate = self.state.lock().delegate.clone();
        if let Some(delegate) = delegate {
            delegate.on_connection_state(online);
        }
    }

    /// Returns true between `interrupt` and `resume`.
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }
}

impl Connection for MockConnection {
    fn initialize(&mut self, delegate: Arc<dyn ConnectionDelegate>) {
        self.state.lock().delegate = Some(delegate);
    }

    fn put(&mut self, path: &Path, value: Value, hash: Option<String>, on_complete: WriteCallback) {
        let mut state = self.state.lock();
        state.requests.push(MockRequest::Put {
            path: path.clone(),
            value,
            hash,
        });
        state.write_callbacks.push_back(on_complete);
    }

    fn merge(&mut self, path: &Path, patch: Value, on_complete: WriteCallback) {
        let mut state = self.state.lock();
        state.requests.push(MockRequest::Merge {
            path: path.clone(),
            patch,
        });
        state.write_callbacks.push_back(on_complete);
    }

    fn listen(&mut self, path: &Path, on_complete: ListenCallback) {
        let mut state = self.state.lock();
        state.requests.push(MockRequest::Listen(path.clone()));
        state.listen_callbacks.push_back((path.clone(), on_complete));
    }

    fn unlisten(&mut self, path: &Path) {
        self.state.lock().requests.push(MockRequest::Unlisten(path.clone()));
    }

    fn interrupt(&mut self) {
        let delegate = {
            let mut state = self.state.lock();
            state.interrupted = true;
            state.write_callbacks.clear();
            state.listen_callbacks.clear();
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.on_connection_state(false);
        }
    }

    fn resume(&mut self) {
        let delegate = {
            let mut state = self.state.lock();
            state.interrupted = false;
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.on_connection_state(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConnectionDelegate for Recorder {
        fn on_data_update(&self, path: Path, data: Value, is_merge: bool) {
            self.events.lock().push(format!("data {path} {data} {is_merge}"));
        }

        fn on_connection_state(&self, online: bool) {
            self.events.lock().push(format!("online {online}"));
        }
    }

    #[test]
    fn mock_records_and_answers() {
        let mock = MockConnection::new();
        let mut conn = mock.clone();
        let recorder = Arc::new(Recorder::default());
        conn.initialize(recorder.clone());

        let acked = Arc::new(Mutex::new(None));
        let sink = acked.clone();
        conn.put(
            &Path::from("a"),
            json!(1),
            Some("h".into()),
            Box::new(move |ack| *sink.lock() = Some(ack)),
        );
        assert_eq!(mock.pending_writes(), 1);
        assert!(mock.ack_next_write(WriteAck::Stale));
        assert_eq!(*acked.lock(), Some(WriteAck::Stale));
        assert!(!mock.ack_next_write(WriteAck::ok()));

        conn.listen(&Path::from("b"), Box::new(|_| {}));
        assert_eq!(mock.complete_next_listen(Ok(())), Some(Path::from("b")));

        mock.push_update(Path::from("b"), json!({"x": 1}), false);
        conn.interrupt();
        conn.resume();
        assert_eq!(
            *recorder.events.lock(),
            vec![
                "data /b {\"x\":1} false".to_string(),
                "online false".to_string(),
                "online true".to_string(),
            ]
        );
        assert_eq!(
            mock.requests(),
            vec![
                MockRequest::Put {
                    path: Path::from("a"),
                    value: json!(1),
                    hash: Some("h".into()),
                },
                MockRequest::Listen(Path::from("b")),
            ]
        );
    }
}

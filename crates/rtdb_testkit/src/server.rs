//! An in-memory reference server.
//!
//! Holds one tree shared by every connection, applies puts and merges,
//! checks compare-and-put hashes with the content hash, and streams changes
//! to connections listening at overlapping paths.

use parking_lot::Mutex;
use rtdb_core::ServerError;
use rtdb_node::{node_hash, Node, NodeResult, Path};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Receives `(path, data)` overwrites for one listen.
pub type PushSink = Arc<dyn Fn(Path, Value) + Send + Sync + 'static>;

/// Identifies a connection to the server.
pub type ConnectionId = u64;

/// Outcome of a write as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerWrite {
    /// Applied.
    Applied,
    /// The compare-and-put hash did not match.
    Stale,
    /// Rejected.
    Rejected(ServerError),
}

struct Listen {
    connection: ConnectionId,
    path: Path,
    sink: PushSink,
}

#[derive(Default)]
struct ServerState {
    root: Node,
    listens: Vec<Listen>,
    next_connection: ConnectionId,
    /// Writes at or below these paths are rejected with the code.
    rules: BTreeMap<Path, String>,
    puts: usize,
    conditional_puts: usize,
    stale_puts: usize,
}

/// Counters for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Puts received, including conditional ones.
    pub puts: usize,
    /// Puts that carried a hash.
    pub conditional_puts: usize,
    /// Conditional puts rejected as stale.
    pub stale_puts: usize,
}

/// Shared handle to the server.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server holding `data`.
    pub fn with_data(data: &Value) -> NodeResult<Self> {
        let server = Self::new();
        server.state.lock().root = Node::from_json(data)?;
        Ok(server)
    }

    pub(crate) fn register(&self) -> ConnectionId {
        let mut state = self.state.lock();
        state.next_connection += 1;
        state.next_connection
    }

    /// The stored value at `path`.
    pub fn value(&self, path: &str) -> Value {
        self.node(path).to_json_value()
    }

    /// The stored node at `path`, priorities included.
    pub fn node(&self, path: &str) -> Node {
        let path = Path::from(path);
        self.state.lock().root.child(&path)
    }

    /// Write counters so far.
    pub fn stats(&self) -> ServerStats {
        let state = self.state.lock();
        ServerStats {
            puts: state.puts,
            conditional_puts: state.conditional_puts,
            stale_puts: state.stale_puts,
        }
    }

    /// Rejects writes at or below `path` with `code` until cleared.
    pub fn deny_writes(&self, path: &str, code: &str) {
        self.state.lock().rules.insert(Path::from(path), code.to_string());
    }

    /// Removes every write rule.
    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
    }

    /// Writes `data` at `path` as another client would.
    pub fn set(&self, path: &str, data: &Value) -> NodeResult<()> {
        let node = Node::from_json(data)?;
        let path = Path::from(path);
        let mut state = self.state.lock();
        state.root = state.root.update_child(&path, node);
        deliver(collect_pushes(&state, &path));
        Ok(())
    }

    fn denied(state: &ServerState, path: &Path) -> Option<ServerError> {
        state
            .rules
            .iter()
            .find(|(rule, _)| rule.contains(path))
            .map(|(_, code)| ServerError::new(code.clone()))
    }

    pub(crate) fn put(&self, path: &Path, data: &Value, hash: Option<&str>) -> ServerWrite {
        let node = match Node::from_json(data) {
            Ok(node) => node,
            Err(e) => return ServerWrite::Rejected(ServerError::new("invalid").with_message(e.to_string())),
        };
        let mut state = self.state.lock();
        state.puts += 1;
        if let Some(error) = Self::denied(&state, path) {
            return ServerWrite::Rejected(error);
        }
        if let Some(expected) = hash {
            state.conditional_puts += 1;
            let actual = node_hash(&state.root.child(path));
            if actual != expected {
                state.stale_puts += 1;
                trace!(path = %path, "stale compare-and-put");
                return ServerWrite::Stale;
            }
        }
        let node = resolve_server_values(node, &state.root.child(path));
        state.root = state.root.update_child(path, node);
        deliver(collect_pushes(&state, path));
        ServerWrite::Applied
    }

    pub(crate) fn merge(&self, path: &Path, patch: &Value) -> ServerWrite {
        let Value::Object(members) = patch else {
            return ServerWrite::Rejected(ServerError::new("invalid").with_message("merge payload must be an object"));
        };
        let mut children = Vec::with_capacity(members.len());
        for (key, value) in members {
            match (Path::parse(key), Node::from_json(value)) {
                (Ok(rel), Ok(node)) => children.push((path.join(&rel), node)),
                _ => return ServerWrite::Rejected(ServerError::new("invalid")),
            }
        }
        let mut state = self.state.lock();
        state.puts += 1;
        if let Some(error) = children
            .iter()
            .find_map(|(child, _)| Self::denied(&state, child))
        {
            return ServerWrite::Rejected(error);
        }
        for (child, node) in children {
            let node = resolve_server_values(node, &state.root.child(&child));
            state.root = state.root.update_child(&child, node);
        }
        deliver(collect_pushes(&state, path));
        ServerWrite::Applied
    }

    /// Registers a listen and pushes the current value there through `sink`
    /// before any later change can reach it.
    pub(crate) fn listen(&self, connection: ConnectionId, path: &Path, sink: PushSink) {
        let mut state = self.state.lock();
        debug!(connection, path = %path, "server listen");
        sink(path.clone(), state.root.child(path).to_export_json());
        state.listens.push(Listen {
            connection,
            path: path.clone(),
            sink,
        });
    }

    pub(crate) fn unlisten(&self, connection: ConnectionId, path: &Path) {
        self.state
            .lock()
            .listens
            .retain(|l| !(l.connection == connection && &l.path == path));
    }

    pub(crate) fn disconnect(&self, connection: ConnectionId) {
        self.state.lock().listens.retain(|l| l.connection != connection);
    }

    /// Number of active listens across connections.
    pub fn listen_count(&self) -> usize {
        self.state.lock().listens.len()
    }
}

fn collect_pushes(state: &ServerState, changed: &Path) -> Vec<(PushSink, Path, Value)> {
    state
        .listens
        .iter()
        .filter(|l| l.path.overlaps(changed))
        .map(|l| {
            let at = if l.path.contains(changed) {
                changed.clone()
            } else {
                l.path.clone()
            };
            let data = state.root.child(&at).to_export_json();
            (l.sink.clone(), at, data)
        })
        .collect()
}

/// Runs under the server lock so pushes reach each connection in the order
/// the writes were applied. Sinks must not call back into the server.
fn deliver(pushes: Vec<(PushSink, Path, Value)>) {
    for (sink, path, data) in pushes {
        sink(path, data);
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn resolve_server_values(node: Node, existing: &Node) -> Node {
    if rtdb_node::contains_server_values(&node) {
        rtdb_node::resolve_deferred_value(&node, existing, now_ms())
    } else {
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compare_and_put_checks_the_content_hash() {
        let server = MemoryServer::with_data(&json!({"a": 1})).unwrap();
        let path = Path::from("a");
        let hash = node_hash(&Node::integer(1));
        assert_eq!(server.put(&path, &json!(2), Some("nope")), ServerWrite::Stale);
        assert_eq!(server.put(&path, &json!(2), Some(&hash)), ServerWrite::Applied);
        assert_eq!(server.value("a"), json!(2));
        assert_eq!(
            server.stats(),
            ServerStats {
                puts: 2,
                conditional_puts: 2,
                stale_puts: 1
            }
        );
    }

    #[test]
    fn listeners_get_overlapping_changes() {
        let server = MemoryServer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = server.register();
        server.listen(
            id,
            &Path::from("a/b"),
            Arc::new(move |path, data| sink.lock().push((path.to_string(), data))),
        );
        server.put(&Path::from("a"), &json!({"b": {"c": 1}}), None);
        server.merge(&Path::from("a/b"), &json!({"d": 2}));
        server.put(&Path::from("z"), &json!(1), None);
        assert_eq!(
            *seen.lock(),
            vec![
                ("/a/b".to_string(), Value::Null),
                ("/a/b".to_string(), json!({"c": 1})),
                ("/a/b".to_string(), json!({"c": 1, "d": 2})),
            ]
        );
        server.unlisten(id, &Path::from("a/b"));
        assert_eq!(server.listen_count(), 0);
    }

    #[test]
    fn rules_reject_writes_below() {
        let server = MemoryServer::new();
        server.deny_writes("locked", "permission_denied");
        assert_eq!(
            server.put(&Path::from("locked/x"), &json!(1), None),
            ServerWrite::Rejected(ServerError::new("permission_denied"))
        );
        assert_eq!(
            server.merge(&Path::from("open"), &json!({"x": 1})),
            ServerWrite::Applied
        );
        assert_eq!(server.value("open"), json!({"x": 1}));
    }
}

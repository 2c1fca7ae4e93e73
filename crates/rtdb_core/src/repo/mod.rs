//! The per-connection repository.
//!
//! A [`Repo`] owns everything a database handle shares: the sync tree, the
//! listener registry, the transaction queue, the `.info` tree and the
//! connection. It lives on its run loop thread; every method here runs as a
//! run loop task.

mod transactions;

use crate::config::DatabaseConfig;
use crate::connection::{Connection, ConnectionDelegate, WriteAck, WriteCallback};
use crate::error::{DatabaseError, ErrorCode};
use crate::event::{EventListener, EventMask};
use crate::listener::{ListenerHandle, ListenerRegistry};
use crate::query::QuerySpec;
use crate::run_loop::{panic_message, RunLoop};
use crate::sync_tree::{MergeChildren, SyncTree};
use crate::transaction::TransactionQueue;
use rtdb_node::{resolve_deferred_value, ChildKey, Node, NodeResult, Path};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

/// Called once with the outcome of a set, update or remove.
pub type WriteCompletion = Box<dyn FnOnce(Option<DatabaseError>) + Send + 'static>;

const CONNECTED_KEY: &str = "connected";
const SERVER_TIME_OFFSET_KEY: &str = "serverTimeOffset";

#[derive(Debug, Clone)]
enum WriteRequest {
    Put(Value),
    Merge(Value),
}

struct OutstandingWrite {
    path: Path,
    request: WriteRequest,
    on_complete: Option<WriteCompletion>,
}

/// State shared by every handle to one database.
pub struct Repo {
    config: DatabaseConfig,
    run_loop: RunLoop<Repo>,
    connection: Box<dyn Connection>,
    tree: SyncTree,
    info: Node,
    listeners: ListenerRegistry,
    transactions: TransactionQueue,
    outstanding: BTreeMap<u64, OutstandingWrite>,
    next_write_id: u64,
    connected: bool,
    generation: u64,
    server_time_offset_ms: i64,
}

struct RepoDelegate {
    run_loop: RunLoop<Repo>,
}

impl ConnectionDelegate for RepoDelegate {
    fn on_data_update(&self, path: Path, data: Value, is_merge: bool) {
        schedule(&self.run_loop, move |repo| repo.on_data_update(path, data, is_merge));
    }

    fn on_connection_state(&self, online: bool) {
        schedule(&self.run_loop, move |repo| repo.on_connection_state(online));
    }
}

/// Schedules a follow-up task, logging if the loop has stopped.
fn schedule<F>(run_loop: &RunLoop<Repo>, task: F)
where
    F: FnOnce(&mut Repo) + Send + 'static,
{
    if let Err(e) = run_loop.schedule(task) {
        debug!(error = %e, "dropping callback for stopped repo");
    }
}

/// Runs user code, logging instead of unwinding into the run loop.
pub(crate) fn call_user(what: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(callback = what, panic = %panic_message(panic.as_ref()), "user callback panicked");
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn view_at(tree: &SyncTree, info: &Node, path: &Path) -> Option<Node> {
    if path.is_info() {
        Some(info.child(&path.pop_front()))
    } else if tree.is_complete(path) {
        Some(tree.effective_node(path))
    } else {
        None
    }
}

/// Parses a merge payload keyed by relative paths.
pub(crate) fn merge_children_from_json(data: &Value) -> NodeResult<MergeChildren> {
    let mut children = MergeChildren::new();
    if let Value::Object(map) = data {
        for (key, value) in map {
            children.insert(Path::parse(key)?, Node::from_json(value)?);
        }
    }
    Ok(children)
}

fn merge_children_to_json(children: &MergeChildren) -> Value {
    Value::Object(
        children
            .iter()
            .map(|(rel, node)| (rel.to_segments().join("/"), node.to_export_json()))
            .collect(),
    )
}

impl Repo {
    pub(crate) fn new(
        config: DatabaseConfig,
        mut connection: Box<dyn Connection>,
        run_loop: RunLoop<Repo>,
    ) -> Self {
        info!(repo = %config.repo_info, "starting repo");
        connection.initialize(Arc::new(RepoDelegate {
            run_loop: run_loop.clone(),
        }));
        let info = Node::from_children([
            (ChildKey::new(CONNECTED_KEY), Node::boolean(false)),
            (ChildKey::new(SERVER_TIME_OFFSET_KEY), Node::integer(0)),
        ]);
        Self {
            config,
            run_loop,
            connection,
            tree: SyncTree::new(),
            info,
            listeners: ListenerRegistry::new(),
            transactions: TransactionQueue::default(),
            outstanding: BTreeMap::new(),
            next_write_id: 0,
            connected: false,
            generation: 0,
            server_time_offset_ms: 0,
        }
    }

    /// Returns true while the connection is online.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Returns true if any listener, including transaction keep-alives, is
    /// registered.
    pub fn has_listeners(&self) -> bool {
        self.listeners.has_listeners()
    }

    /// Value listeners would currently see at `path`.
    pub fn effective_node(&self, path: &Path) -> Node {
        if path.is_info() {
            return self.info.child(&path.pop_front());
        }
        self.tree.effective_node(path)
    }

    /// Number of writes sent or waiting to be sent.
    pub fn outstanding_writes(&self) -> usize {
        self.outstanding.len()
    }

    /// Number of queued transactions.
    pub fn queued_transactions(&self) -> usize {
        self.transactions.len()
    }

    fn next_write_id(&mut self) -> u64 {
        self.next_write_id += 1;
        self.next_write_id
    }

    fn server_time(&self) -> i64 {
        now_ms() + self.server_time_offset_ms
    }

    fn raise_events(&mut self, changed: &Path) {
        let tree = &self.tree;
        let info = &self.info;
        self.listeners
            .recompute(changed, &|path| view_at(tree, info, path));
    }

    fn update_info(&mut self, key: &str, value: Node) {
        self.info = self
            .info
            .update_immediate_child(&ChildKey::new(key), value);
        let path = Path::from_keys([ChildKey::new(rtdb_node::INFO_KEY), ChildKey::new(key)]);
        self.raise_events(&path);
    }

    // Writes.

    pub(crate) fn set_value(&mut self, path: Path, value: Node, on_complete: Option<WriteCompletion>) {
        let write_id = self.next_write_id();
        let existing = self.tree.effective_node(&path);
        let resolved = resolve_deferred_value(&value, &existing, self.server_time());
        trace!(path = %path, write_id, "set");
        let changed = self.tree.apply_user_overwrite(write_id, &path, resolved, true);
        self.raise_events(&changed);

        self.outstanding.insert(
            write_id,
            OutstandingWrite {
                path: path.clone(),
                request: WriteRequest::Put(value.to_export_json()),
                on_complete,
            },
        );
        self.send_write(write_id);

        let affected = self.abort_transactions(&path, ErrorCode::OverriddenBySet);
        self.rerun_transactions(&affected);
    }

    pub(crate) fn update_children(
        &mut self,
        path: Path,
        children: MergeChildren,
        on_complete: Option<WriteCompletion>,
    ) {
        if children.is_empty() {
            if let Some(on_complete) = on_complete {
                call_user("update completion", || on_complete(None));
            }
            return;
        }
        let write_id = self.next_write_id();
        let time = self.server_time();
        let resolved: MergeChildren = children
            .iter()
            .map(|(rel, node)| {
                let existing = self.tree.effective_node(&path.join(rel));
                (rel.clone(), resolve_deferred_value(node, &existing, time))
            })
            .collect();
        trace!(path = %path, write_id, children = children.len(), "update");
        let changed = self.tree.apply_user_merge(write_id, &path, resolved, true);
        self.raise_events(&changed);

        self.outstanding.insert(
            write_id,
            OutstandingWrite {
                path: path.clone(),
                request: WriteRequest::Merge(merge_children_to_json(&children)),
                on_complete,
            },
        );
        self.send_write(write_id);

        for rel in children.keys() {
            let affected = self.abort_transactions(&path.join(rel), ErrorCode::OverriddenBySet);
            self.rerun_transactions(&affected);
        }
    }

    fn send_write(&mut self, write_id: u64) {
        if !self.connected {
            return;
        }
        let Some(write) = self.outstanding.get(&write_id) else {
            return;
        };
        let path = write.path.clone();
        let request = write.request.clone();
        let run_loop = self.run_loop.clone();
        let generation = self.generation;
        let on_complete: WriteCallback = Box::new(move |ack| {
            schedule(&run_loop, move |repo| repo.on_write_ack(generation, write_id, ack));
        });
        match request {
            WriteRequest::Put(value) => self.connection.put(&path, value, None, on_complete),
            WriteRequest::Merge(patch) => self.connection.merge(&path, patch, on_complete),
        }
    }

    fn on_write_ack(&mut self, generation: u64, write_id: u64, ack: WriteAck) {
        if generation != self.generation {
            trace!(write_id, "ignoring ack from a previous connection");
            return;
        }
        let Some(write) = self.outstanding.remove(&write_id) else {
            trace!(write_id, "ignoring duplicate ack");
            return;
        };
        let (revert, server_value, error) = match ack {
            WriteAck::Ok { resolved } => {
                let server_value = resolved.and_then(|json| resolved_node(&write.request, &json));
                (false, server_value, None)
            }
            WriteAck::Stale => (true, None, Some(DatabaseError::from_code(ErrorCode::DataStale))),
            WriteAck::Error(e) => (
                true,
                None,
                Some(DatabaseError::from_server(&e.code, e.message.as_deref())),
            ),
        };
        if let Some(err) = &error {
            warn!(path = %write.path, error = %err, "write failed");
        }
        let changed = self.tree.ack_user_write(write_id, revert, server_value);
        self.raise_events(&changed);
        if revert {
            self.rerun_transactions(&write.path);
        }
        if let Some(on_complete) = write.on_complete {
            call_user("write completion", || on_complete(error));
        }
    }

    // Listeners.

    pub(crate) fn add_listener(
        &mut self,
        handle: ListenerHandle,
        query: QuerySpec,
        mask: EventMask,
        listener: Box<dyn EventListener>,
    ) {
        let path = query.path.clone();
        if self.listeners.add(handle, query, mask, listener) {
            self.start_listen(&path);
        }
        let tree = &self.tree;
        let info = &self.info;
        self.listeners
            .refresh(handle, &|path| view_at(tree, info, path));
    }

    pub(crate) fn remove_listener(&mut self, handle: ListenerHandle) {
        if let Some((path, last)) = self.listeners.remove(handle) {
            if last {
                self.stop_listen(&path);
            }
        }
    }

    fn start_listen(&mut self, path: &Path) {
        if path.is_info() || !self.connected {
            return;
        }
        debug!(path = %path, "listen");
        let run_loop = self.run_loop.clone();
        let generation = self.generation;
        let listen_path = path.clone();
        self.connection.listen(
            path,
            Box::new(move |result| {
                schedule(&run_loop, move |repo| {
                    repo.on_listen_complete(generation, listen_path, result)
                });
            }),
        );
    }

    fn stop_listen(&mut self, path: &Path) {
        if path.is_info() {
            return;
        }
        debug!(path = %path, "unlisten");
        if self.connected {
            self.connection.unlisten(path);
        }
        self.tree.mark_incomplete(path);
    }

    fn on_listen_complete(
        &mut self,
        generation: u64,
        path: Path,
        result: Result<(), crate::connection::ServerError>,
    ) {
        if generation != self.generation || !self.listeners.locations().any(|p| *p == path) {
            return;
        }
        match result {
            Ok(()) => {
                self.tree.mark_complete(&path);
                self.raise_events(&path);
            }
            Err(e) => {
                let error = DatabaseError::from_server(&e.code, e.message.as_deref());
                warn!(path = %path, error = %error, "listen failed");
                self.tree.mark_incomplete(&path);
                let cancelled = self.listeners.cancel_location(&path, &error);
                debug!(path = %path, cancelled, "cancelled listeners");
            }
        }
    }

    // Connection.

    fn on_data_update(&mut self, path: Path, data: Value, is_merge: bool) {
        if path.is_info() {
            return;
        }
        let changed = if is_merge {
            match merge_children_from_json(&data) {
                Ok(children) => self.tree.apply_server_merge(&path, &children),
                Err(e) => {
                    warn!(path = %path, error = %e, "ignoring malformed server merge");
                    return;
                }
            }
        } else {
            match Node::from_json(&data) {
                Ok(node) => self.tree.apply_server_overwrite(&path, node),
                Err(e) => {
                    warn!(path = %path, error = %e, "ignoring malformed server data");
                    return;
                }
            }
        };
        trace!(path = %path, is_merge, "server update");
        self.raise_events(&changed);
        self.rerun_transactions(&changed);
    }

    fn on_connection_state(&mut self, online: bool) {
        if online == self.connected {
            return;
        }
        self.connected = online;
        self.update_info(CONNECTED_KEY, Node::boolean(online));
        if online {
            info!(repo = %self.config.repo_info, "connected");
            let locations: Vec<Path> = self.listeners.locations().cloned().collect();
            for path in &locations {
                self.start_listen(path);
            }
            let write_ids: Vec<u64> = self.outstanding.keys().copied().collect();
            for write_id in write_ids {
                self.send_write(write_id);
            }
            self.send_ready_transactions();
        } else {
            info!(repo = %self.config.repo_info, "disconnected");
            self.generation += 1;
            self.abort_sent_transactions();
        }
    }

    pub(crate) fn interrupt(&mut self) {
        debug!(repo = %self.config.repo_info, "interrupting connection");
        self.connection.interrupt();
    }

    pub(crate) fn resume(&mut self) {
        debug!(repo = %self.config.repo_info, "resuming connection");
        self.connection.resume();
    }
}

fn resolved_node(request: &WriteRequest, json: &Value) -> Option<Node> {
    match request {
        WriteRequest::Put(_) => Node::from_json(json).ok(),
        WriteRequest::Merge(_) => {
            let children = merge_children_from_json(json).ok()?;
            Some(
                children
                    .into_iter()
                    .fold(Node::Empty, |acc, (rel, node)| acc.update_child(&rel, node)),
            )
        }
    }
}

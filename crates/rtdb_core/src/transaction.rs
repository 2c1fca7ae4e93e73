//! Optimistic transaction records and their queue.
//!
//! A transaction runs a handler against the latest local value at a path,
//! applies the result locally and sends it as a compare-and-put
//! conditioned on the hash of the value the handler saw. The send/retry
//! state machine itself lives on the repo; this module holds the data.

use crate::error::DatabaseError;
use crate::listener::ListenerHandle;
use crate::repo::call_user;
use crate::snapshot::DataSnapshot;
use rtdb_node::{node_hash, Node, Path};
use std::collections::BTreeSet;
use std::fmt;

/// Produces the compare-and-put token for a value.
pub trait TransactionHasher: Send + Sync {
    /// Hashes the value a transaction read.
    fn hash(&self, node: &Node) -> String;
}

/// The content hash: base64 SHA-1 of the canonical representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl TransactionHasher for ContentHasher {
    fn hash(&self, node: &Node) -> String {
        node_hash(node)
    }
}

/// What a transaction handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// Commit this value.
    Success(Node),
    /// Give up without writing.
    Abort,
}

impl TransactionOutcome {
    /// Commit `value`.
    pub fn success(value: impl Into<Node>) -> Self {
        TransactionOutcome::Success(value.into())
    }
}

/// Computes a new value from the current one. May run several times.
pub type TransactionHandler = Box<dyn FnMut(&Node) -> TransactionOutcome + Send + 'static>;

/// Called once with `(error, committed, snapshot)`.
pub type TransactionCompletion =
    Box<dyn FnOnce(Option<DatabaseError>, bool, DataSnapshot) + Send + 'static>;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Waiting to be sent, or to be rerun.
    Run,
    /// Sent; waiting for the server.
    Sent,
    /// Sent, then overridden by a set; completes when the server answers.
    ///
    /// The handler always sees `OverriddenBySet` with `committed = false`,
    /// even when the server accepted the sent value. In that case the value
    /// did reach the server and its write is promoted, so the reported
    /// outcome differs from what the server stored until the overriding set
    /// lands.
    SentNeedsAbort,
    /// Will be aborted by the next rerun.
    NeedsAbort,
    /// Done; about to be removed.
    Completed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Run => "run",
            TransactionStatus::Sent => "sent",
            TransactionStatus::SentNeedsAbort => "sent_needs_abort",
            TransactionStatus::NeedsAbort => "needs_abort",
            TransactionStatus::Completed => "completed",
        };
        f.write_str(name)
    }
}

pub(crate) struct TransactionRecord {
    pub path: Path,
    pub handler: TransactionHandler,
    pub on_complete: Option<TransactionCompletion>,
    pub status: TransactionStatus,
    pub order: u64,
    pub keep_alive: ListenerHandle,
    pub apply_locally: bool,
    pub retry_count: u32,
    pub abort_reason: Option<DatabaseError>,
    pub current_write_id: Option<u64>,
    pub current_input: Node,
    pub current_output_raw: Node,
    pub current_output_resolved: Node,
    /// Set after a stale answer until the handler has run again.
    pub needs_rerun: bool,
}

impl TransactionRecord {
    /// Invokes the completion callback, at most once.
    pub fn complete(&mut self, error: Option<DatabaseError>, committed: bool, node: Node) {
        self.status = TransactionStatus::Completed;
        if let Some(on_complete) = self.on_complete.take() {
            let snapshot = DataSnapshot::new(self.path.clone(), node);
            call_user("transaction completion", || on_complete(error, committed, snapshot));
        }
    }
}

/// Every queued transaction of a repo, in submission order.
#[derive(Default)]
pub(crate) struct TransactionQueue {
    records: Vec<TransactionRecord>,
    next_order: u64,
}

impl TransactionQueue {
    pub fn next_order(&mut self) -> u64 {
        self.next_order += 1;
        self.next_order
    }

    pub fn push(&mut self, record: TransactionRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get_mut(&mut self, index: usize) -> &mut TransactionRecord {
        &mut self.records[index]
    }

    pub fn get(&self, index: usize) -> &TransactionRecord {
        &self.records[index]
    }

    /// Indexes of records at or below `root`, in submission order.
    pub fn indexes_under(&self, root: &Path) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| root.contains(&r.path))
            .map(|(i, _)| i)
            .collect()
    }

    /// Index of the record with this order.
    pub fn position(&self, order: u64) -> Option<usize> {
        self.records.iter().position(|r| r.order == order)
    }

    /// The shortest path with queued transactions that contains `path`,
    /// or `path` itself if there is none.
    pub fn root_most_for(&self, path: &Path) -> Path {
        self.records
            .iter()
            .map(|r| &r.path)
            .filter(|p| p.contains(path))
            .min_by_key(|p| p.len())
            .cloned()
            .unwrap_or_else(|| path.clone())
    }

    /// Distinct paths with queued transactions.
    pub fn queued_paths(&self) -> BTreeSet<Path> {
        self.records.iter().map(|r| r.path.clone()).collect()
    }

    /// Paths with queued transactions that have no queued ancestor.
    pub fn root_paths(&self) -> Vec<Path> {
        let paths = self.queued_paths();
        paths
            .iter()
            .filter(|p| !paths.iter().any(|other| other != *p && other.contains(p)))
            .cloned()
            .collect()
    }

    /// Removes and returns completed records.
    pub fn take_completed(&mut self) -> Vec<TransactionRecord> {
        let (completed, remaining) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| r.status == TransactionStatus::Completed);
        self.records = remaining;
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn record(queue: &mut TransactionQueue, path: &str) -> TransactionRecord {
        TransactionRecord {
            path: Path::from(path),
            handler: Box::new(|_| TransactionOutcome::Abort),
            on_complete: None,
            status: TransactionStatus::Run,
            order: queue.next_order(),
            keep_alive: ListenerHandle(0),
            apply_locally: true,
            retry_count: 0,
            abort_reason: None,
            current_write_id: None,
            current_input: Node::Empty,
            current_output_raw: Node::Empty,
            current_output_resolved: Node::Empty,
            needs_rerun: false,
        }
    }

    #[test]
    fn roots_and_subtrees() {
        let mut queue = TransactionQueue::default();
        for path in ["a/b", "a", "c/d", "a/b/c"] {
            let r = record(&mut queue, path);
            queue.push(r);
        }
        assert_eq!(queue.root_paths(), vec![Path::from("a"), Path::from("c/d")]);
        assert_eq!(queue.indexes_under(&Path::from("a")), vec![0, 1, 3]);
        assert_eq!(queue.root_most_for(&Path::from("a/b/c")), Path::from("a"));
        assert_eq!(queue.root_most_for(&Path::from("c")), Path::from("c"));
        assert_eq!(queue.root_most_for(&Path::from("c/d/e")), Path::from("c/d"));
    }

    #[test]
    fn completion_runs_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TransactionQueue::default();
        let mut r = record(&mut queue, "x");
        let sink = calls.clone();
        r.on_complete = Some(Box::new(move |err, committed, snap| {
            sink.lock().push((err.is_none(), committed, snap.value()));
        }));
        r.complete(None, true, Node::integer(3));
        r.complete(None, false, Node::Empty);
        assert_eq!(*calls.lock(), vec![(true, true, serde_json::json!(3))]);
        assert_eq!(r.status, TransactionStatus::Completed);

        queue.push(r);
        let pending = record(&mut queue, "y");
        queue.push(pending);
        let done = queue.take_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn content_hasher_matches_node_hash() {
        let node = Node::string("hi");
        assert_eq!(ContentHasher.hash(&node), node_hash(&node));
    }
}

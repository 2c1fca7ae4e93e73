//! Public handles: [`Database`], [`Reference`] and [`Query`].
//!
//! Every operation validates its arguments on the calling thread, then
//! enqueues a task on the repo's run loop and returns. Callbacks run later on
//! the loop thread.

use crate::config::{DatabaseConfig, RepoInfo};
use crate::connection::Connection;
use crate::error::{CoreError, CoreResult, DatabaseError};
use crate::event::{EventListener, EventMask};
use crate::listener::ListenerHandle;
use crate::query::{QueryParams, QuerySpec};
use crate::repo::{Repo, WriteCompletion};
use crate::run_loop::RunLoop;
use crate::snapshot::DataSnapshot;
use crate::sync_tree::MergeChildren;
use crate::transaction::TransactionOutcome;
use rtdb_node::{ChildKey, Index, Node, Path, Priority};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A handle to one database. Cheap to clone; all clones share the repo.
///
/// The repo shuts down when the last clone is dropped, including clones held
/// by [`Reference`] and [`Query`]. Handles captured by callbacks keep it
/// alive until those callbacks are released.
#[derive(Clone)]
pub struct Database {
    repo_info: RepoInfo,
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    run_loop: RunLoop<Repo>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        self.run_loop.shutdown();
    }
}

impl Database {
    /// Starts a repo over `connection`.
    pub fn new(config: DatabaseConfig, connection: Box<dyn Connection>) -> CoreResult<Self> {
        let repo_info = config.repo_info.clone();
        let name = config.effective_run_loop_name();
        let run_loop = RunLoop::start(name, move |run_loop| Repo::new(config, connection, run_loop))?;
        Ok(Self {
            repo_info,
            inner: Arc::new(DatabaseInner { run_loop }),
        })
    }

    /// Host and namespace this database talks to.
    pub fn repo_info(&self) -> &RepoInfo {
        &self.repo_info
    }

    /// A reference to the root.
    pub fn root(&self) -> Reference {
        Reference {
            db: self.clone(),
            path: Path::root(),
        }
    }

    /// A reference to `path`, e.g. `"users/alice"`.
    pub fn reference(&self, path: &str) -> CoreResult<Reference> {
        Ok(Reference {
            db: self.clone(),
            path: Path::parse(path)?,
        })
    }

    /// Drops the connection. Local writes keep applying; they are sent once
    /// [`Database::go_online`] is called.
    pub fn go_offline(&self) -> CoreResult<()> {
        self.inner.run_loop.schedule(|repo| repo.interrupt())
    }

    /// Reconnects after [`Database::go_offline`].
    pub fn go_online(&self) -> CoreResult<()> {
        self.inner.run_loop.schedule(|repo| repo.resume())
    }

    /// Cancels a subscription. Unknown handles are ignored.
    pub fn remove_listener(&self, handle: ListenerHandle) -> CoreResult<()> {
        self.inner.run_loop.schedule(move |repo| repo.remove_listener(handle))
    }

    /// Runs `f` on the loop thread against the repo and returns its result.
    ///
    /// Blocks the caller; must not be called from a callback.
    pub fn inspect<R, F>(&self, timeout: Duration, f: F) -> CoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Repo) -> R + Send + 'static,
    {
        if self.inner.run_loop.is_loop_thread() {
            return Err(CoreError::invalid_argument("inspect called from the run loop thread"));
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.run_loop.schedule(move |repo| {
            let _ = tx.send(f(repo));
        })?;
        rx.recv_timeout(timeout).map_err(|_| CoreError::Timeout)
    }

    /// Blocks until every scheduled task has run.
    pub fn wait_idle(&self, timeout: Duration) -> CoreResult<()> {
        self.inner.run_loop.wait_idle(timeout)
    }

    /// Returns true between [`Database::interrupt`] and [`Database::resume`].
    pub fn is_interrupted(&self) -> bool {
        self.inner.run_loop.is_interrupted()
    }

    /// Pauses the run loop; tasks are held until [`Database::resume`].
    pub fn interrupt(&self) {
        self.inner.run_loop.interrupt();
    }

    /// Resumes a paused run loop.
    pub fn resume(&self) {
        self.inner.run_loop.resume();
    }

    /// Stops the run loop. Pending tasks are dropped.
    pub fn shutdown(&self) {
        debug!(repo = %self.repo_info, "shutting down");
        self.inner.run_loop.shutdown();
    }

    /// Returns true once the run loop has stopped.
    pub fn is_shut_down(&self) -> bool {
        self.inner.run_loop.is_stopped()
    }

    pub(crate) fn run_loop(&self) -> &RunLoop<Repo> {
        &self.inner.run_loop
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("repo_info", &self.repo_info)
            .field("run_loop", &self.inner.run_loop.name())
            .finish()
    }
}

fn completion<F>(on_complete: F) -> Option<WriteCompletion>
where
    F: FnOnce(Option<DatabaseError>) + Send + 'static,
{
    Some(Box::new(on_complete))
}

/// A location in a database.
#[derive(Clone)]
pub struct Reference {
    db: Database,
    path: Path,
}

impl Reference {
    /// The location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last path segment; `None` at the root.
    pub fn key(&self) -> Option<&ChildKey> {
        self.path.back()
    }

    /// The parent location; `None` at the root.
    pub fn parent(&self) -> Option<Reference> {
        self.path.parent().map(|path| Reference {
            db: self.db.clone(),
            path,
        })
    }

    /// A location below this one. `rel` may contain slashes.
    pub fn child(&self, rel: &str) -> CoreResult<Reference> {
        Ok(Reference {
            db: self.db.clone(),
            path: self.path.join(&Path::parse(rel)?),
        })
    }

    /// The database this reference belongs to.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Queries the whole location.
    pub fn query(&self) -> Query {
        Query {
            db: self.db.clone(),
            spec: QuerySpec::location(self.path.clone()),
        }
    }

    fn writable_path(&self) -> CoreResult<Path> {
        if self.path.is_info() {
            return Err(CoreError::invalid_argument(format!(
                "cannot write to {}",
                self.path
            )));
        }
        Ok(self.path.clone())
    }

    fn schedule_set(&self, value: Node, on_complete: Option<WriteCompletion>) -> CoreResult<()> {
        let path = self.writable_path()?;
        self.db
            .run_loop()
            .schedule(move |repo| repo.set_value(path, value, on_complete))
    }

    /// Replaces the value here. Priorities in `value` are kept.
    pub fn set_value(&self, value: impl Into<Node>) -> CoreResult<()> {
        self.schedule_set(value.into(), None)
    }

    /// Replaces the value here and reports the server's answer.
    pub fn set_value_with_completion<F>(&self, value: impl Into<Node>, on_complete: F) -> CoreResult<()>
    where
        F: FnOnce(Option<DatabaseError>) + Send + 'static,
    {
        self.schedule_set(value.into(), completion(on_complete))
    }

    /// Replaces the value here with JSON in server patch format.
    pub fn set_json(&self, value: &Value) -> CoreResult<()> {
        self.schedule_set(Node::from_json(value)?, None)
    }

    /// Replaces the value and priority here together.
    pub fn set_value_and_priority(
        &self,
        value: impl Into<Node>,
        priority: impl Into<Priority>,
    ) -> CoreResult<()> {
        self.schedule_set(value.into().with_priority(priority.into()), None)
    }

    /// Sets the priority of the value here.
    pub fn set_priority(&self, priority: impl Into<Priority>) -> CoreResult<()> {
        self.set_priority_with_completion(priority, |_| {})
    }

    /// Sets the priority and reports the server's answer.
    pub fn set_priority_with_completion<F>(
        &self,
        priority: impl Into<Priority>,
        on_complete: F,
    ) -> CoreResult<()>
    where
        F: FnOnce(Option<DatabaseError>) + Send + 'static,
    {
        let path = self.writable_path()?.child(ChildKey::priority());
        let value = priority.into().to_node();
        self.db
            .run_loop()
            .schedule(move |repo| repo.set_value(path, value, completion(on_complete)))
    }

    /// Deletes the value here.
    pub fn remove_value(&self) -> CoreResult<()> {
        self.schedule_set(Node::Empty, None)
    }

    /// Deletes the value here and reports the server's answer.
    pub fn remove_value_with_completion<F>(&self, on_complete: F) -> CoreResult<()>
    where
        F: FnOnce(Option<DatabaseError>) + Send + 'static,
    {
        self.schedule_set(Node::Empty, completion(on_complete))
    }

    /// Writes several descendants at once. Keys are relative paths and must
    /// not overlap each other.
    pub fn update_children<K, V>(&self, children: impl IntoIterator<Item = (K, V)>) -> CoreResult<()>
    where
        K: AsRef<str>,
        V: Into<Node>,
    {
        self.schedule_update(children, None)
    }

    /// Like [`Reference::update_children`], reporting the server's answer.
    pub fn update_children_with_completion<K, V, F>(
        &self,
        children: impl IntoIterator<Item = (K, V)>,
        on_complete: F,
    ) -> CoreResult<()>
    where
        K: AsRef<str>,
        V: Into<Node>,
        F: FnOnce(Option<DatabaseError>) + Send + 'static,
    {
        self.schedule_update(children, completion(on_complete))
    }

    fn schedule_update<K, V>(
        &self,
        children: impl IntoIterator<Item = (K, V)>,
        on_complete: Option<WriteCompletion>,
    ) -> CoreResult<()>
    where
        K: AsRef<str>,
        V: Into<Node>,
    {
        let path = self.writable_path()?;
        let mut parsed = MergeChildren::new();
        for (key, value) in children {
            let rel = Path::parse(key.as_ref())?;
            if rel.is_empty() {
                return Err(CoreError::invalid_argument("update keys must not be empty"));
            }
            parsed.insert(rel, value.into());
        }
        let keys: Vec<&Path> = parsed.keys().collect();
        // Sorted, so an ancestor sits right before its descendants.
        for pair in keys.windows(2) {
            if pair[0].contains(pair[1]) {
                return Err(CoreError::invalid_argument(format!(
                    "update paths overlap: {} and {}",
                    pair[0], pair[1]
                )));
            }
        }
        self.db
            .run_loop()
            .schedule(move |repo| repo.update_children(path, parsed, on_complete))
    }

    /// Runs an optimistic read-modify-write here.
    ///
    /// `handler` may run several times and must not have side effects.
    /// `on_complete` receives `(error, committed, snapshot)` exactly once.
    /// With `apply_locally` false, listeners only see the result once the
    /// server accepts it.
    pub fn run_transaction<H, C>(&self, handler: H, on_complete: C, apply_locally: bool) -> CoreResult<()>
    where
        H: FnMut(&Node) -> TransactionOutcome + Send + 'static,
        C: FnOnce(Option<DatabaseError>, bool, DataSnapshot) + Send + 'static,
    {
        let path = self.writable_path()?;
        self.db.run_loop().schedule(move |repo| {
            repo.start_transaction(path, Box::new(handler), Box::new(on_complete), apply_locally)
        })
    }

    /// Subscribes to the whole location.
    pub fn add_listener(
        &self,
        mask: EventMask,
        listener: impl EventListener,
    ) -> CoreResult<ListenerHandle> {
        self.query().add_listener(mask, listener)
    }

    /// Orders children by key.
    pub fn order_by_key(&self) -> CoreResult<Query> {
        self.query().order_by_key()
    }

    /// Orders children by priority.
    pub fn order_by_priority(&self) -> CoreResult<Query> {
        self.query().order_by_priority()
    }

    /// Orders children by value.
    pub fn order_by_value(&self) -> CoreResult<Query> {
        self.query().order_by_value()
    }

    /// Orders children by the value at `child` below each of them.
    pub fn order_by_child(&self, child: &str) -> CoreResult<Query> {
        self.query().order_by_child(child)
    }

    /// Limits the view to the first `n` children.
    pub fn limit_to_first(&self, n: usize) -> CoreResult<Query> {
        self.query().limit_to_first(n)
    }

    /// Limits the view to the last `n` children.
    pub fn limit_to_last(&self, n: usize) -> CoreResult<Query> {
        self.query().limit_to_last(n)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({}{})", self.db.repo_info, self.path)
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.db.repo_info == other.db.repo_info && self.path == other.path
    }
}

/// A filtered, ordered view of a location.
#[derive(Clone)]
pub struct Query {
    db: Database,
    spec: QuerySpec,
}

impl Query {
    /// The location and parameters.
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// The queried location.
    pub fn reference(&self) -> Reference {
        Reference {
            db: self.db.clone(),
            path: self.spec.path.clone(),
        }
    }

    fn with_params(
        &self,
        update: impl FnOnce(QueryParams) -> CoreResult<QueryParams>,
    ) -> CoreResult<Query> {
        Ok(Query {
            db: self.db.clone(),
            spec: QuerySpec {
                path: self.spec.path.clone(),
                params: update(self.spec.params.clone())?,
            },
        })
    }

    fn bound_key(key: Option<&str>) -> CoreResult<Option<ChildKey>> {
        Ok(key.map(ChildKey::parse).transpose()?)
    }

    /// Orders children by key.
    pub fn order_by_key(&self) -> CoreResult<Query> {
        self.with_params(|p| p.order_by(Index::Key))
    }

    /// Orders children by priority.
    pub fn order_by_priority(&self) -> CoreResult<Query> {
        self.with_params(|p| p.order_by(Index::Priority))
    }

    /// Orders children by value.
    pub fn order_by_value(&self) -> CoreResult<Query> {
        self.with_params(|p| p.order_by(Index::Value))
    }

    /// Orders children by the value at `child` below each of them.
    pub fn order_by_child(&self, child: &str) -> CoreResult<Query> {
        let path = Path::parse(child)?;
        self.with_params(|p| p.order_by(Index::Child(path)))
    }

    /// Starts the view at `value`, optionally tie-broken by `key`.
    pub fn start_at(&self, value: impl Into<Node>, key: Option<&str>) -> CoreResult<Query> {
        let key = Self::bound_key(key)?;
        let value = value.into();
        self.with_params(|p| p.start_at(value, key))
    }

    /// Ends the view at `value`, optionally tie-broken by `key`.
    pub fn end_at(&self, value: impl Into<Node>, key: Option<&str>) -> CoreResult<Query> {
        let key = Self::bound_key(key)?;
        let value = value.into();
        self.with_params(|p| p.end_at(value, key))
    }

    /// Restricts the view to children equal to `value`.
    pub fn equal_to(&self, value: impl Into<Node>, key: Option<&str>) -> CoreResult<Query> {
        let key = Self::bound_key(key)?;
        let value = value.into();
        self.with_params(|p| p.equal_to(value, key))
    }

    /// Limits the view to the first `n` children.
    pub fn limit_to_first(&self, n: usize) -> CoreResult<Query> {
        self.with_params(|p| p.limit_to_first(n))
    }

    /// Limits the view to the last `n` children.
    pub fn limit_to_last(&self, n: usize) -> CoreResult<Query> {
        self.with_params(|p| p.limit_to_last(n))
    }

    /// Subscribes to the view. The listener first receives the current
    /// view once it is known, then every change.
    pub fn add_listener(
        &self,
        mask: EventMask,
        listener: impl EventListener,
    ) -> CoreResult<ListenerHandle> {
        let handle = ListenerHandle::allocate();
        let spec = self.spec.clone();
        let listener: Box<dyn EventListener> = Box::new(listener);
        self.db
            .run_loop()
            .schedule(move |repo| repo.add_listener(handle, spec, mask, listener))?;
        Ok(handle)
    }

    /// Cancels a subscription made through any query of this database.
    pub fn remove_listener(&self, handle: ListenerHandle) -> CoreResult<()> {
        self.db.remove_listener(handle)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({}{})", self.db.repo_info, self.spec)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionDelegate, ListenCallback, WriteCallback};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A connection that ignores requests and records when it is dropped.
    struct DropWatch(Arc<AtomicBool>);

    impl Drop for DropWatch {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Connection for DropWatch {
        fn initialize(&mut self, _delegate: Arc<dyn ConnectionDelegate>) {}
        fn put(&mut self, _path: &Path, _value: Value, _hash: Option<String>, _on_complete: WriteCallback) {}
        fn merge(&mut self, _path: &Path, _patch: Value, _on_complete: WriteCallback) {}
        fn listen(&mut self, _path: &Path, _on_complete: ListenCallback) {}
        fn unlisten(&mut self, _path: &Path) {}
        fn interrupt(&mut self) {}
        fn resume(&mut self) {}
    }

    #[test]
    fn dropping_the_last_handle_stops_the_repo() {
        let dropped = Arc::new(AtomicBool::new(false));
        let db = Database::new(DatabaseConfig::default(), Box::new(DropWatch(dropped.clone()))).unwrap();
        let run_loop = db.run_loop().clone();
        let reference = db.reference("a/b").unwrap();
        reference.set_value(1).unwrap();

        drop(db);
        assert!(!run_loop.is_stopped());
        assert!(!dropped.load(Ordering::SeqCst));

        drop(reference);
        assert!(run_loop.is_stopped());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn explicit_shutdown_then_drop_is_harmless() {
        let dropped = Arc::new(AtomicBool::new(false));
        let db = Database::new(DatabaseConfig::default(), Box::new(DropWatch(dropped.clone()))).unwrap();
        db.shutdown();
        assert!(db.is_shut_down());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(db.reference("x").unwrap().set_value(1).is_err());
        drop(db);
    }
}

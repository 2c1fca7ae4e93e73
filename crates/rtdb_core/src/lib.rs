//! # RTDB Core
//!
//! Local synchronization core of the realtime tree database client.
//!
//! This crate provides:
//! - A single-threaded run loop that serializes every state change
//! - The sync tree: server data with pending local writes overlaid
//! - Optimistic transactions with hash-conditioned commits and retries
//! - Listener registry and event computation, with ordered queries
//! - The `Connection` contract consumed from the transport layer
//! - `Database`, `Reference` and `Query` handles, and `RepoManager`
//!
//! ## Architecture
//!
//! Each database is served by one `Repo` living on its own run loop
//! thread. Public calls enqueue tasks; acknowledgements and server pushes
//! from the connection are marshaled back onto the same loop, so no lock
//! guards repo state.
//!
//! ## Key Invariants
//!
//! - The effective value is server data plus visible writes in write id order
//! - Listeners see changes in the order they were applied
//! - Every completion callback runs exactly once, on the run loop
//! - Completions from an older connection are ignored
//!
//! ## Example
//!
//! ```
//! use rtdb_core::{Database, DatabaseConfig, EventMask, MockConnection, TransactionOutcome};
//! use std::time::Duration;
//!
//! let db = Database::new(DatabaseConfig::default(), Box::new(MockConnection::new())).unwrap();
//! let counter = db.reference("counter").unwrap();
//! counter
//!     .run_transaction(
//!         |current| {
//!             let n = current.to_json_value().as_i64().unwrap_or(0);
//!             TransactionOutcome::success(n + 1)
//!         },
//!         |_error, _committed, _snapshot| {},
//!         true,
//!     )
//!     .unwrap();
//! counter
//!     .add_listener(EventMask::VALUE, |event: &rtdb_core::Event| {
//!         assert_eq!(event.snapshot.value(), 1);
//!     })
//!     .unwrap();
//! db.wait_idle(Duration::from_secs(5)).unwrap();
//! db.shutdown();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod database;
mod error;
mod event;
mod listener;
mod query;
mod repo;
mod repo_manager;
mod run_loop;
mod snapshot;
mod sync_tree;
mod transaction;

pub use config::{DatabaseConfig, RepoInfo, RetryConfig, TransactionConfig};
pub use connection::{
    Connection, ConnectionDelegate, ListenCallback, MockConnection, MockRequest, ServerError,
    WriteAck, WriteCallback,
};
pub use database::{Database, Query, Reference};
pub use error::{CoreError, CoreResult, DatabaseError, ErrorCode};
pub use event::{Event, EventListener, EventMask, EventType};
pub use listener::{ListenerHandle, ListenerRegistry};
pub use query::{Limit, QueryParams, QuerySpec};
pub use repo::{Repo, WriteCompletion};
pub use repo_manager::RepoManager;
pub use run_loop::{RunLoop, Task};
pub use snapshot::DataSnapshot;
pub use sync_tree::{MergeChildren, PendingWrite, SyncTree, WriteKind};
pub use transaction::{
    ContentHasher, TransactionCompletion, TransactionHandler, TransactionHasher,
    TransactionOutcome, TransactionStatus,
};

pub use rtdb_node::{ChildKey, Index, Node, Path, Priority};

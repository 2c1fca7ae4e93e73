//! # RTDB Testkit
//!
//! Test utilities for the realtime database client.
//!
//! This crate provides:
//! - An in-memory server with compare-and-put and change streaming
//! - A connection to it with delivery pausing and failure injection
//! - A transaction hasher that can be forced to mismatch
//! - Test fixtures, latches and event recorders
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rtdb_testkit::prelude::*;
//!
//! #[test]
//! fn counter_commits() {
//!     with_test_db(|db| {
//!         let (latch, on_complete) = transaction_latch();
//!         db.reference("counter").unwrap().run_transaction(
//!             |current| TransactionOutcome::success(current.to_json_value().as_i64().unwrap_or(0) + 1),
//!             on_complete,
//!             true,
//!         ).unwrap();
//!         assert!(latch.wait(DEFAULT_TIMEOUT).unwrap().committed);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod fixtures;
pub mod generators;
pub mod hasher;
pub mod server;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::hasher::*;
    pub use crate::server::*;
    pub use crate::stress::*;
}

pub use connection::MemoryConnection;
pub use fixtures::*;
pub use hasher::{HijackableHasher, HIJACKED_HASH};
pub use server::{MemoryServer, ServerStats, ServerWrite};
pub use stress::{StressConfig, StressTestResult};

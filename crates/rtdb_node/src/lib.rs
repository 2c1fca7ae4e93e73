//! # rtdb_node
//!
//! Immutable tree values for the realtime database client.
//!
//! Everything the synchronization core stores or exchanges is a [`Node`]:
//! null, a scalar leaf, or an ordered map of children, each optionally
//! carrying a [`Priority`]. Nodes are never mutated; updates return a new
//! node that shares untouched subtrees with the old one.
//!
//! ## Ordering
//!
//! - Child keys that are canonical 32-bit integers sort numerically and
//!   before all other keys, which sort by bytes ([`ChildKey`]).
//! - Queries order children by key, priority, value or a nested child
//!   ([`Index`]).
//!
//! ## Usage
//!
//! ```
//! use rtdb_node::{Node, Path};
//! use serde_json::json;
//!
//! let node = Node::from_json(&json!({"users": {"alice": {"age": 30}}})).unwrap();
//! let age = node.child(&Path::parse("users/alice/age").unwrap());
//! assert_eq!(age, Node::integer(30));
//!
//! let older = node.update_child(&Path::parse("users/alice/age").unwrap(), Node::integer(31));
//! assert_eq!(older.to_json_value(), json!({"users": {"alice": {"age": 31}}}));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod hash;
mod index;
mod json;
mod key;
mod node;
mod path;
mod server_values;

pub use error::{NodeError, NodeResult};
pub use hash::node_hash;
pub use index::{Index, NamedNode};
pub use json::{priority_from_json, priority_to_json};
pub use key::{ChildKey, INFO_KEY, PRIORITY_KEY, SERVER_VALUE_KEY, VALUE_KEY};
pub use node::{LeafValue, Node, Priority};
pub use path::Path;
pub use server_values::{contains_server_values, is_server_value, resolve_deferred_value};

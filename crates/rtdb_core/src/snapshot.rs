//! Immutable views of data handed to callbacks.

use crate::error::CoreResult;
use rtdb_node::{ChildKey, Index, Node, Path, Priority};
use serde_json::Value;

/// The value at a location at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSnapshot {
    path: Path,
    node: Node,
    index: Index,
}

impl DataSnapshot {
    /// Creates a snapshot ordered by priority.
    pub fn new(path: Path, node: Node) -> Self {
        Self::with_index(path, node, Index::default())
    }

    /// Creates a snapshot whose children iterate in `index` order.
    pub fn with_index(path: Path, node: Node, index: Index) -> Self {
        Self { path, node, index }
    }

    /// Location of the data.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last segment of the location, or `None` at the root.
    pub fn key(&self) -> Option<&ChildKey> {
        self.path.back()
    }

    /// The raw node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Returns true if there is data at this location.
    pub fn exists(&self) -> bool {
        !self.node.is_empty()
    }

    /// Plain JSON value, without priorities.
    pub fn value(&self) -> Value {
        self.node.to_json_value()
    }

    /// JSON value including priorities.
    pub fn export_value(&self) -> Value {
        self.node.to_export_json()
    }

    /// Priority of the data.
    pub fn priority(&self) -> &Priority {
        self.node.priority()
    }

    /// Number of children.
    pub fn children_count(&self) -> usize {
        self.node.child_count()
    }

    /// Returns true if a child exists at the relative path.
    pub fn has_child(&self, path: &str) -> CoreResult<bool> {
        Ok(!self.node.child(&Path::parse(path)?).is_empty())
    }

    /// Snapshot of a descendant given a relative path string.
    pub fn child(&self, path: &str) -> CoreResult<DataSnapshot> {
        Ok(self.child_at(&Path::parse(path)?))
    }

    /// Snapshot of a descendant.
    pub fn child_at(&self, rel: &Path) -> DataSnapshot {
        DataSnapshot {
            path: self.path.join(rel),
            node: self.node.child(rel),
            index: self.index.clone(),
        }
    }

    /// Direct children in index order.
    pub fn children(&self) -> Vec<DataSnapshot> {
        self.index
            .sorted_children(&self.node)
            .into_iter()
            .map(|child| DataSnapshot {
                path: self.path.child(child.key),
                node: child.node,
                index: self.index.clone(),
            })
            .collect()
    }
}

//! Server cache plus the log of unacknowledged local writes.
//!
//! Reads never patch a cached result: the value at a path is always computed
//! from the server cache with the relevant writes replayed in write id order.

use rtdb_node::{Node, Path};
use std::collections::{BTreeMap, BTreeSet};

/// Children of a merge, keyed by path relative to the merge location.
pub type MergeChildren = BTreeMap<Path, Node>;

/// What a pending write does.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    /// Replace the value at the write path.
    Overwrite(Node),
    /// Replace each listed descendant of the write path.
    Merge(MergeChildren),
}

/// A local write the server has not acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// Monotonic id assigned by the repo.
    pub write_id: u64,
    /// Location of the write.
    pub path: Path,
    /// The change itself.
    pub kind: WriteKind,
    /// Whether listeners see the write before it is acknowledged.
    pub visible: bool,
}

impl PendingWrite {
    /// Replays this write onto `node`, the current value at `at`.
    fn apply(&self, at: &Path, node: Node) -> Node {
        match &self.kind {
            WriteKind::Overwrite(value) => apply_overwrite(at, node, &self.path, value),
            WriteKind::Merge(children) => children.iter().fold(node, |acc, (rel, value)| {
                apply_overwrite(at, acc, &self.path.join(rel), value)
            }),
        }
    }

    /// Returns true if this write replaces `path` or one of its ancestors.
    fn covers(&self, path: &Path) -> bool {
        match &self.kind {
            WriteKind::Overwrite(_) => self.path.contains(path),
            WriteKind::Merge(children) => children
                .keys()
                .any(|rel| self.path.join(rel).contains(path)),
        }
    }

    /// Returns true if this write touches anything at or below `path`, or
    /// an ancestor of it.
    pub fn overlaps(&self, path: &Path) -> bool {
        match &self.kind {
            WriteKind::Overwrite(_) => self.path.overlaps(path),
            WriteKind::Merge(children) => children
                .keys()
                .any(|rel| self.path.join(rel).overlaps(path)),
        }
    }
}

fn apply_overwrite(at: &Path, node: Node, write_path: &Path, value: &Node) -> Node {
    if let Some(rel) = write_path.relative(at) {
        value.child(&rel)
    } else if let Some(rel) = at.relative(write_path) {
        node.update_child(&rel, value.clone())
    } else {
        node
    }
}

/// The overlay of local writes on server-confirmed data.
#[derive(Debug, Default)]
pub struct SyncTree {
    server_cache: Node,
    complete: BTreeSet<Path>,
    writes: Vec<PendingWrite>,
    last_write_id: Option<u64>,
}

impl SyncTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes server data at `path`.
    pub fn apply_server_overwrite(&mut self, path: &Path, node: Node) -> Path {
        self.server_cache = self.server_cache.update_child(path, node);
        path.clone()
    }

    /// Writes several server children below `path`.
    pub fn apply_server_merge(&mut self, path: &Path, children: &MergeChildren) -> Path {
        for (rel, node) in children {
            self.server_cache = self.server_cache.update_child(&path.join(rel), node.clone());
        }
        path.clone()
    }

    /// Records a local overwrite.
    ///
    /// # Panics
    ///
    /// Panics if `write_id` is not greater than every id seen before.
    pub fn apply_user_overwrite(&mut self, write_id: u64, path: &Path, node: Node, visible: bool) -> Path {
        self.push_write(PendingWrite {
            write_id,
            path: path.clone(),
            kind: WriteKind::Overwrite(node),
            visible,
        })
    }

    /// Records a local merge.
    ///
    /// # Panics
    ///
    /// Panics if `write_id` is not greater than every id seen before.
    pub fn apply_user_merge(
        &mut self,
        write_id: u64,
        path: &Path,
        children: MergeChildren,
        visible: bool,
    ) -> Path {
        self.push_write(PendingWrite {
            write_id,
            path: path.clone(),
            kind: WriteKind::Merge(children),
            visible,
        })
    }

    fn push_write(&mut self, write: PendingWrite) -> Path {
        assert!(
            self.last_write_id.map_or(true, |last| write.write_id > last),
            "write id {} is not greater than {:?}",
            write.write_id,
            self.last_write_id
        );
        self.last_write_id = Some(write.write_id);
        let path = write.path.clone();
        self.writes.push(write);
        path
    }

    /// Removes a write from the log.
    ///
    /// When `revert` is false the write is promoted into the server cache
    /// first. `server_value` is the server's resolved value at the write
    /// path, used instead of the local value when present.
    ///
    /// # Panics
    ///
    /// Panics if no write with this id is pending.
    pub fn ack_user_write(&mut self, write_id: u64, revert: bool, server_value: Option<Node>) -> Path {
        let index = self
            .writes
            .iter()
            .position(|w| w.write_id == write_id)
            .unwrap_or_else(|| panic!("ack for unknown write id {write_id}"));
        let write = self.writes.remove(index);
        if !revert {
            match &write.kind {
                WriteKind::Overwrite(node) => {
                    let value = server_value.unwrap_or_else(|| node.clone());
                    self.server_cache = self.server_cache.update_child(&write.path, value);
                }
                WriteKind::Merge(children) => {
                    for (rel, node) in children {
                        let value = match &server_value {
                            Some(resolved) => resolved.child(rel),
                            None => node.clone(),
                        };
                        self.server_cache =
                            self.server_cache.update_child(&write.path.join(rel), value);
                    }
                }
            }
        }
        write.path
    }

    /// Returns the pending write with this id.
    pub fn write(&self, write_id: u64) -> Option<&PendingWrite> {
        self.writes.iter().find(|w| w.write_id == write_id)
    }

    /// Pending writes in write id order.
    pub fn pending_writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    /// Server-confirmed value at `path`.
    pub fn server_node(&self, path: &Path) -> Node {
        self.server_cache.child(path)
    }

    /// Value listeners see: server data plus visible writes.
    pub fn effective_node(&self, path: &Path) -> Node {
        self.replay(path, |w| w.visible)
    }

    /// Value transactions run against: server data plus every write,
    /// visible or not, except those in `exclude`.
    pub fn latest_state(&self, path: &Path, exclude: &[u64]) -> Node {
        self.replay(path, |w| !exclude.contains(&w.write_id))
    }

    fn replay(&self, path: &Path, include: impl Fn(&PendingWrite) -> bool) -> Node {
        self.writes
            .iter()
            .filter(|w| include(w))
            .fold(self.server_cache.child(path), |node, w| w.apply(path, node))
    }

    /// Marks data at `path` as fully known.
    pub fn mark_complete(&mut self, path: &Path) {
        self.complete.insert(path.clone());
    }

    /// Drops the complete mark at `path`.
    pub fn mark_incomplete(&mut self, path: &Path) {
        self.complete.remove(path);
    }

    /// Returns true if the server cache is complete at `path` or a visible
    /// write replaces `path` or an ancestor.
    pub fn is_complete(&self, path: &Path) -> bool {
        self.complete.iter().any(|p| p.contains(path))
            || self.writes.iter().any(|w| w.visible && w.covers(path))
    }

    /// Returns true if the server cache alone is complete at `path`.
    pub fn is_server_complete(&self, path: &Path) -> bool {
        self.complete.iter().any(|p| p.contains(path))
    }
}

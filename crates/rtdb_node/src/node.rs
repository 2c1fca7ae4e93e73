//! Immutable tree values.

use crate::key::ChildKey;
use crate::path::Path;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A scalar stored at a leaf.
#[derive(Debug, Clone)]
pub enum LeafValue {
    /// Boolean.
    Bool(bool),
    /// Integral number.
    Integer(i64),
    /// Floating point number.
    Double(f64),
    /// UTF-8 string.
    String(String),
}

impl LeafValue {
    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            LeafValue::Integer(n) => Some(*n as f64),
            LeafValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            LeafValue::Bool(_) => 0,
            LeafValue::Integer(_) | LeafValue::Double(_) => 1,
            LeafValue::String(_) => 2,
        }
    }

    /// Ordering used by value indexes: booleans, then numbers, then strings.
    pub fn compare(&self, other: &LeafValue) -> Ordering {
        match (self, other) {
            (LeafValue::Bool(a), LeafValue::Bool(b)) => a.cmp(b),
            (LeafValue::String(a), LeafValue::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (a, b) if a.type_rank() == 1 && b.type_rank() == 1 => {
                compare_numbers(a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0))
            }
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialEq for LeafValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LeafValue::Bool(a), LeafValue::Bool(b)) => a == b,
            (LeafValue::String(a), LeafValue::String(b)) => a == b,
            (LeafValue::Integer(a), LeafValue::Integer(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

fn compare_numbers(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// The priority attached to a node.
///
/// Priorities order as: none, then numbers ascending, then strings
/// lexicographically.
#[derive(Debug, Clone, Default)]
pub enum Priority {
    /// No priority.
    #[default]
    None,
    /// Numeric priority.
    Number(f64),
    /// String priority.
    String(String),
}

impl Priority {
    /// Returns true if no priority is set.
    pub fn is_none(&self) -> bool {
        matches!(self, Priority::None)
    }

    /// Total order over priorities.
    pub fn compare(&self, other: &Priority) -> Ordering {
        match (self, other) {
            (Priority::None, Priority::None) => Ordering::Equal,
            (Priority::None, _) => Ordering::Less,
            (_, Priority::None) => Ordering::Greater,
            (Priority::Number(a), Priority::Number(b)) => compare_numbers(*a, *b),
            (Priority::Number(_), Priority::String(_)) => Ordering::Less,
            (Priority::String(_), Priority::Number(_)) => Ordering::Greater,
            (Priority::String(a), Priority::String(b)) => a.as_bytes().cmp(b.as_bytes()),
        }
    }

    /// The priority as a node (a leaf without priority, or empty).
    pub fn to_node(&self) -> Node {
        match self {
            Priority::None => Node::Empty,
            Priority::Number(n) => Node::leaf(LeafValue::Double(*n)),
            Priority::String(s) => Node::leaf(LeafValue::String(s.clone())),
        }
    }

    /// Reads a priority back from a node written to `.priority`.
    ///
    /// Anything that is not a numeric or string leaf clears the priority.
    pub fn from_node(node: &Node) -> Priority {
        match node {
            Node::Leaf { value, .. } => match value {
                LeafValue::String(s) => Priority::String(s.clone()),
                other => other.as_f64().map(Priority::Number).unwrap_or_default(),
            },
            _ => Priority::None,
        }
    }
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl From<f64> for Priority {
    fn from(n: f64) -> Self {
        Priority::Number(n)
    }
}

impl From<i64> for Priority {
    fn from(n: i64) -> Self {
        Priority::Number(n as f64)
    }
}

impl From<&str> for Priority {
    fn from(s: &str) -> Self {
        Priority::String(s.to_string())
    }
}

/// An immutable value in the tree.
///
/// Nodes never change after construction. Every update returns a new node
/// that shares all untouched subtrees with the original through reference
/// counted child maps. A children node never holds empty children, and a
/// children node without children is represented as [`Node::Empty`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Node {
    /// Null / absent.
    #[default]
    Empty,
    /// A scalar with an optional priority.
    Leaf {
        /// The scalar.
        value: LeafValue,
        /// Its priority.
        priority: Priority,
    },
    /// An object with at least one child.
    Children {
        /// Children in key order.
        children: Arc<BTreeMap<ChildKey, Node>>,
        /// Priority of the object itself.
        priority: Priority,
    },
}

impl Node {
    /// Creates a leaf without priority.
    pub fn leaf(value: LeafValue) -> Node {
        Node::Leaf {
            value,
            priority: Priority::None,
        }
    }

    /// Builds a children node, dropping empty children.
    pub fn from_children(children: impl IntoIterator<Item = (ChildKey, Node)>) -> Node {
        let map: BTreeMap<ChildKey, Node> = children
            .into_iter()
            .filter(|(_, node)| !node.is_empty())
            .collect();
        if map.is_empty() {
            Node::Empty
        } else {
            Node::Children {
                children: Arc::new(map),
                priority: Priority::None,
            }
        }
    }

    /// Returns true for the empty node.
    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    /// Returns true for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    /// The leaf value, if this is a leaf.
    pub fn leaf_value(&self) -> Option<&LeafValue> {
        match self {
            Node::Leaf { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The node's priority.
    pub fn priority(&self) -> &Priority {
        static NONE: Priority = Priority::None;
        match self {
            Node::Empty => &NONE,
            Node::Leaf { priority, .. } | Node::Children { priority, .. } => priority,
        }
    }

    /// Returns a copy of this node with a new priority.
    ///
    /// Empty nodes cannot carry a priority and stay empty.
    pub fn with_priority(&self, priority: Priority) -> Node {
        match self {
            Node::Empty => Node::Empty,
            Node::Leaf { value, .. } => Node::Leaf {
                value: value.clone(),
                priority,
            },
            Node::Children { children, .. } => Node::Children {
                children: Arc::clone(children),
                priority,
            },
        }
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        match self {
            Node::Children { children, .. } => children.len(),
            _ => 0,
        }
    }

    /// Iterates over the children in key order.
    pub fn children(&self) -> impl Iterator<Item = (&ChildKey, &Node)> {
        let map = match self {
            Node::Children { children, .. } => Some(children.as_ref()),
            _ => None,
        };
        map.into_iter().flat_map(|m| m.iter())
    }

    /// Returns true if a non-empty child with this key exists.
    pub fn has_child(&self, key: &ChildKey) -> bool {
        !self.immediate_child(key).is_empty()
    }

    /// The direct child with the given key, or the empty node.
    ///
    /// The `.priority` key yields the priority as a node.
    pub fn immediate_child(&self, key: &ChildKey) -> Node {
        if key.is_priority() {
            return self.priority().to_node();
        }
        match self {
            Node::Children { children, .. } => children.get(key).cloned().unwrap_or_default(),
            _ => Node::Empty,
        }
    }

    /// The descendant at `path`, or the empty node.
    pub fn child(&self, path: &Path) -> Node {
        let mut current = self.clone();
        for key in path.iter() {
            if current.is_empty() {
                break;
            }
            current = current.immediate_child(key);
        }
        current
    }

    /// Replaces the direct child `key`.
    pub fn update_immediate_child(&self, key: &ChildKey, child: Node) -> Node {
        if key.is_priority() {
            return self.with_priority(Priority::from_node(&child));
        }
        let (mut map, priority) = match self {
            Node::Children { children, priority } => (children.as_ref().clone(), priority.clone()),
            // Writing a child into a leaf or empty node discards the scalar,
            // including its priority.
            _ => (BTreeMap::new(), Priority::None),
        };
        if child.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.clone(), child);
        }
        if map.is_empty() {
            Node::Empty
        } else {
            Node::Children {
                children: Arc::new(map),
                priority,
            }
        }
    }

    /// Replaces the descendant at `path`.
    pub fn update_child(&self, path: &Path, child: Node) -> Node {
        match path.front() {
            None => child,
            Some(front) if front.is_priority() && path.len() == 1 => {
                self.update_immediate_child(front, child)
            }
            Some(front) => {
                let rest = path.pop_front();
                let updated = self.immediate_child(front).update_child(&rest, child);
                self.update_immediate_child(front, updated)
            }
        }
    }

    /// Key of the child that precedes `key` in key order.
    pub fn predecessor_key(&self, key: &ChildKey) -> Option<&ChildKey> {
        match self {
            Node::Children { children, .. } => children.range(..key).next_back().map(|(k, _)| k),
            _ => None,
        }
    }

    /// Ordering used by value indexes.
    ///
    /// Empty sorts first, then leaves (see [`LeafValue::compare`]), then
    /// objects; objects compare equal to one another.
    pub fn compare_values(&self, other: &Node) -> Ordering {
        match (self, other) {
            (Node::Empty, Node::Empty) => Ordering::Equal,
            (Node::Empty, _) => Ordering::Less,
            (_, Node::Empty) => Ordering::Greater,
            (Node::Leaf { value: a, .. }, Node::Leaf { value: b, .. }) => a.compare(b),
            (Node::Leaf { .. }, Node::Children { .. }) => Ordering::Less,
            (Node::Children { .. }, Node::Leaf { .. }) => Ordering::Greater,
            (Node::Children { .. }, Node::Children { .. }) => Ordering::Equal,
        }
    }

    /// Shorthand for a string leaf.
    pub fn string(s: impl Into<String>) -> Node {
        Node::leaf(LeafValue::String(s.into()))
    }

    /// Shorthand for an integer leaf.
    pub fn integer(n: i64) -> Node {
        Node::leaf(LeafValue::Integer(n))
    }

    /// Shorthand for a floating point leaf.
    pub fn double(d: f64) -> Node {
        Node::leaf(LeafValue::Double(d))
    }

    /// Shorthand for a boolean leaf.
    pub fn boolean(b: bool) -> Node {
        Node::leaf(LeafValue::Bool(b))
    }
}

impl From<i64> for Node {
    fn from(n: i64) -> Self {
        Node::integer(n)
    }
}

impl From<i32> for Node {
    fn from(n: i32) -> Self {
        Node::integer(i64::from(n))
    }
}

impl From<f64> for Node {
    fn from(d: f64) -> Self {
        Node::double(d)
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Self {
        Node::boolean(b)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::string(s)
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: &[(&str, Node)]) -> Node {
        Node::from_children(pairs.iter().map(|(k, v)| (ChildKey::new(*k), v.clone())))
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Node::integer(42), Node::double(42.0));
        assert_ne!(Node::integer(42), Node::string("42"));
        assert_eq!(
            LeafValue::Integer(2).compare(&LeafValue::Double(2.5)),
            Ordering::Less
        );
    }

    #[test]
    fn update_child_shares_untouched_subtrees() {
        let big = obj(&[("x", Node::integer(1))]);
        let root = obj(&[("a", big.clone()), ("b", Node::integer(2))]);
        let updated = root.update_child(&Path::from("b"), Node::integer(3));

        match (&root, &updated) {
            (Node::Children { children: before, .. }, Node::Children { children: after, .. }) => {
                let (Node::Children { children: a1, .. }, Node::Children { children: a2, .. }) =
                    (&before[&ChildKey::new("a")], &after[&ChildKey::new("a")])
                else {
                    panic!("expected children");
                };
                assert!(Arc::ptr_eq(a1, a2));
            }
            _ => panic!("expected children"),
        }
        assert_eq!(root.child(&Path::from("b")), Node::integer(2));
        assert_eq!(updated.child(&Path::from("b")), Node::integer(3));
    }

    #[test]
    fn deep_update_creates_intermediate_objects() {
        let node = Node::Empty.update_child(&Path::from("a/b/c"), Node::boolean(true));
        assert_eq!(node.child(&Path::from("a/b/c")), Node::boolean(true));
        assert_eq!(node.child_count(), 1);
    }

    #[test]
    fn removing_last_child_collapses_to_empty() {
        let node = obj(&[("only", Node::integer(1))]).with_priority(Priority::from(3i64));
        let removed = node.update_child(&Path::from("only"), Node::Empty);
        assert!(removed.is_empty());
    }

    #[test]
    fn priority_pseudo_child() {
        let node = Node::string("v").update_child(&Path::from(".priority"), Node::integer(7));
        assert_eq!(node.priority(), &Priority::Number(7.0));
        assert_eq!(node.immediate_child(&ChildKey::priority()), Node::double(7.0));
        assert_eq!(node.leaf_value(), Some(&LeafValue::String("v".into())));
    }

    #[test]
    fn priority_ordering() {
        let mut prios = vec![
            Priority::from("b"),
            Priority::from(2.0),
            Priority::None,
            Priority::from("a"),
            Priority::from(-1.0),
        ];
        prios.sort_by(Priority::compare);
        assert_eq!(
            prios,
            vec![
                Priority::None,
                Priority::from(-1.0),
                Priority::from(2.0),
                Priority::from("a"),
                Priority::from("b"),
            ]
        );
    }

    #[test]
    fn predecessor_uses_key_order() {
        let node = obj(&[("b", 1.into()), ("10", 2.into()), ("2", 3.into())]);
        assert_eq!(node.predecessor_key(&ChildKey::new("10")).map(|k| k.as_str()), Some("2"));
        assert_eq!(node.predecessor_key(&ChildKey::new("b")).map(|k| k.as_str()), Some("10"));
        assert_eq!(node.predecessor_key(&ChildKey::new("2")), None);
    }

    #[test]
    fn value_ordering() {
        let values = [
            Node::Empty,
            Node::boolean(false),
            Node::boolean(true),
            Node::integer(-3),
            Node::double(1.5),
            Node::string("a"),
            obj(&[("k", 1.into())]),
        ];
        for pair in values.windows(2) {
            assert_eq!(pair[0].compare_values(&pair[1]), Ordering::Less);
        }
    }
}

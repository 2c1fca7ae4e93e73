//! Orderings over the children of a node.

use crate::key::ChildKey;
use crate::node::Node;
use crate::path::Path;
use std::cmp::Ordering;
use std::fmt;

/// A child key paired with its node.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedNode {
    /// The child key.
    pub key: ChildKey,
    /// The child node, or for query bounds the indexed value.
    pub node: Node,
}

impl NamedNode {
    /// Creates a named node.
    pub fn new(key: ChildKey, node: Node) -> Self {
        Self { key, node }
    }
}

/// How the children of a location are ordered.
///
/// Every index breaks ties by key, so the order is total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Index {
    /// By key alone.
    Key,
    /// By priority, then key.
    #[default]
    Priority,
    /// By the child's own value, then key.
    Value,
    /// By the value at a path below each child, then key.
    Child(Path),
}

impl Index {
    /// The value this index orders a child node by.
    ///
    /// Returns the empty node for the key index, which ignores values.
    pub fn indexed_value(&self, node: &Node) -> Node {
        match self {
            Index::Key => Node::Empty,
            Index::Priority => node.priority().to_node(),
            Index::Value => node.clone(),
            Index::Child(path) => node.child(path),
        }
    }

    /// Compares two children already reduced to their indexed values.
    pub fn compare_indexed(
        &self,
        a_key: &ChildKey,
        a_value: &Node,
        b_key: &ChildKey,
        b_value: &Node,
    ) -> Ordering {
        if matches!(self, Index::Key) {
            return a_key.cmp(b_key);
        }
        a_value
            .compare_values(b_value)
            .then_with(|| a_key.cmp(b_key))
    }

    /// Compares two children.
    pub fn compare(&self, a_key: &ChildKey, a: &Node, b_key: &ChildKey, b: &Node) -> Ordering {
        self.compare_indexed(a_key, &self.indexed_value(a), b_key, &self.indexed_value(b))
    }

    /// Compares a child against a query bound expressed as an indexed value.
    pub fn compare_to_bound(&self, key: &ChildKey, node: &Node, bound: &NamedNode) -> Ordering {
        self.compare_indexed(key, &self.indexed_value(node), &bound.key, &bound.node)
    }

    /// Returns true if the position of a child under this index moved
    /// between two versions of the child.
    pub fn indexed_value_changed(&self, old: &Node, new: &Node) -> bool {
        match self {
            Index::Key => false,
            _ => {
                self.indexed_value(old)
                    .compare_values(&self.indexed_value(new))
                    != Ordering::Equal
            }
        }
    }

    /// Children of `node` sorted under this index.
    pub fn sorted_children(&self, node: &Node) -> Vec<NamedNode> {
        let mut children: Vec<(Node, NamedNode)> = node
            .children()
            .map(|(k, v)| (self.indexed_value(v), NamedNode::new(k.clone(), v.clone())))
            .collect();
        children.sort_by(|(av, a), (bv, b)| self.compare_indexed(&a.key, av, &b.key, bv));
        children.into_iter().map(|(_, named)| named).collect()
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Key => f.write_str(".key"),
            Index::Priority => f.write_str(".priority"),
            Index::Value => f.write_str(".value"),
            Index::Child(path) => write!(f, "{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Priority;

    fn keys(named: &[NamedNode]) -> Vec<&str> {
        named.iter().map(|n| n.key.as_str()).collect()
    }

    fn sample() -> Node {
        Node::from_children([
            (ChildKey::new("a"), Node::integer(3).with_priority(Priority::from("z"))),
            (ChildKey::new("b"), Node::string("x")),
            (ChildKey::new("c"), Node::integer(1).with_priority(Priority::from(5.0))),
            (
                ChildKey::new("d"),
                Node::from_children([(ChildKey::new("score"), Node::integer(0))]),
            ),
        ])
    }

    #[test]
    fn priority_index_orders_none_numbers_strings() {
        let sorted = Index::Priority.sorted_children(&sample());
        assert_eq!(keys(&sorted), vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn value_index_orders_by_type_then_value() {
        let sorted = Index::Value.sorted_children(&sample());
        assert_eq!(keys(&sorted), vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn child_index_puts_missing_values_first() {
        let sorted = Index::Child(Path::from("score")).sorted_children(&sample());
        assert_eq!(keys(&sorted), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn indexed_value_changes() {
        let idx = Index::Value;
        assert!(idx.indexed_value_changed(&Node::integer(1), &Node::integer(2)));
        assert!(!idx.indexed_value_changed(&Node::integer(1), &Node::double(1.0)));
        assert!(!Index::Key.indexed_value_changed(&Node::integer(1), &Node::integer(2)));
        assert!(Index::Priority.indexed_value_changed(
            &Node::integer(1),
            &Node::integer(1).with_priority(Priority::from(1.0))
        ));
    }

    #[test]
    fn bounds_use_key_for_ties() {
        let bound = NamedNode::new(ChildKey::new("b"), Node::integer(3));
        let idx = Index::Value;
        assert_eq!(
            idx.compare_to_bound(&ChildKey::new("a"), &Node::integer(3), &bound),
            Ordering::Less
        );
        assert_eq!(
            idx.compare_to_bound(&ChildKey::new("z"), &Node::integer(2), &bound),
            Ordering::Less
        );
        assert_eq!(
            idx.compare_to_bound(&ChildKey::min(), &Node::integer(4), &bound),
            Ordering::Greater
        );
    }
}

//! Content hashes used as compare-and-put tokens.
//!
//! A node's hash is the base64 SHA-1 of a canonical text representation:
//!
//! - leaves: an optional `priority:<prio>:` prefix followed by
//!   `number:<ieee754 hex>`, `string:<s>` or `boolean:<b>`
//! - objects: the priority prefix followed by `:<key>:<child hash>` for every
//!   non-empty child, in priority order if any child has a priority and key
//!   order otherwise
//!
//! The empty node hashes to the empty string.

use crate::index::Index;
use crate::node::{LeafValue, Node, Priority};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

/// Computes the content hash of a node.
pub fn node_hash(node: &Node) -> String {
    match node {
        Node::Empty => String::new(),
        Node::Leaf { value, priority } => {
            let mut repr = priority_prefix(priority);
            repr.push_str(&leaf_repr(value));
            digest(&repr)
        }
        Node::Children { priority, .. } => {
            let mut repr = priority_prefix(priority);
            let by_priority = node.children().any(|(_, child)| !child.priority().is_none());
            let ordered: Vec<(String, String)> = if by_priority {
                Index::Priority
                    .sorted_children(node)
                    .into_iter()
                    .map(|named| (named.key.as_str().to_string(), node_hash(&named.node)))
                    .collect()
            } else {
                node.children()
                    .map(|(key, child)| (key.as_str().to_string(), node_hash(child)))
                    .collect()
            };
            for (key, hash) in ordered {
                if !hash.is_empty() {
                    repr.push(':');
                    repr.push_str(&key);
                    repr.push(':');
                    repr.push_str(&hash);
                }
            }
            if repr.is_empty() {
                String::new()
            } else {
                digest(&repr)
            }
        }
    }
}

fn digest(repr: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(repr.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn number_repr(n: f64) -> String {
    format!("number:{:016x}", n.to_bits())
}

fn leaf_repr(value: &LeafValue) -> String {
    match value {
        LeafValue::Bool(b) => format!("boolean:{b}"),
        LeafValue::Integer(n) => number_repr(*n as f64),
        LeafValue::Double(d) => number_repr(*d),
        LeafValue::String(s) => format!("string:{s}"),
    }
}

fn priority_prefix(priority: &Priority) -> String {
    match priority {
        Priority::None => String::new(),
        Priority::Number(n) => format!("priority:{}:", number_repr(*n)),
        Priority::String(s) => format!("priority:string:{s}:"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ChildKey;

    #[test]
    fn known_vectors() {
        assert_eq!(node_hash(&Node::Empty), "");
        assert_eq!(node_hash(&Node::integer(42)), "bQ5XV5L9riGZgerGMb/8Z87RxeI=");
        assert_eq!(node_hash(&Node::double(42.0)), "bQ5XV5L9riGZgerGMb/8Z87RxeI=");
        assert_eq!(node_hash(&Node::string("hi")), "jrODRP7VX0SYea22x77RsWRrgcQ=");
        let obj = Node::from_children([(ChildKey::new("a"), Node::integer(42))]);
        assert_eq!(node_hash(&obj), "niYJ4Y5rWOqTkWYiKVneRI6Lx6c=");
    }

    #[test]
    fn priority_changes_hash() {
        let plain = Node::string("x");
        let with_prio = plain.with_priority(Priority::from(1.0));
        assert_ne!(node_hash(&plain), node_hash(&with_prio));
    }

    #[test]
    fn child_priorities_change_ordering() {
        let a = Node::integer(1).with_priority(Priority::from(2.0));
        let b = Node::integer(1).with_priority(Priority::from(1.0));
        let node = Node::from_children([(ChildKey::new("a"), a), (ChildKey::new("b"), b)]);
        let swapped = Node::from_children([
            (ChildKey::new("a"), Node::integer(1).with_priority(Priority::from(1.0))),
            (ChildKey::new("b"), Node::integer(1).with_priority(Priority::from(2.0))),
        ]);
        assert_ne!(node_hash(&node), node_hash(&swapped));
    }
}

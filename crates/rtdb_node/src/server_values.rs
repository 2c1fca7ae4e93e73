//! Server value placeholders.
//!
//! `{".sv": "timestamp"}` stands for the server's clock at commit time and
//! `{".sv": {"increment": n}}` for the existing number plus `n`. The server
//! resolves them authoritatively; clients resolve them locally against their
//! own clock so the optimistic view has a concrete value.

use crate::key::{ChildKey, SERVER_VALUE_KEY};
use crate::node::{LeafValue, Node};

/// Returns true if the node is a server value placeholder.
pub fn is_server_value(node: &Node) -> bool {
    node.has_child(&ChildKey::new(SERVER_VALUE_KEY))
}

/// Returns true if the node contains a placeholder anywhere.
pub fn contains_server_values(node: &Node) -> bool {
    is_server_value(node) || node.children().any(|(_, child)| contains_server_values(child))
}

/// Replaces every placeholder in `node` with its locally resolved value.
///
/// `existing` is the value currently at the same location and is consulted
/// by increments. Unknown placeholders are left as they are.
pub fn resolve_deferred_value(node: &Node, existing: &Node, server_time_ms: i64) -> Node {
    if is_server_value(node) {
        let spec = node.immediate_child(&ChildKey::new(SERVER_VALUE_KEY));
        return match resolve_placeholder(&spec, existing, server_time_ms) {
            Some(resolved) => resolved.with_priority(node.priority().clone()),
            None => node.clone(),
        };
    }
    if !contains_server_values(node) {
        return node.clone();
    }
    let children = node.children().map(|(key, child)| {
        let resolved = resolve_deferred_value(child, &existing.immediate_child(key), server_time_ms);
        (key.clone(), resolved)
    });
    Node::from_children(children.collect::<Vec<_>>()).with_priority(node.priority().clone())
}

fn resolve_placeholder(spec: &Node, existing: &Node, server_time_ms: i64) -> Option<Node> {
    match spec.leaf_value() {
        Some(LeafValue::String(name)) if name == "timestamp" => {
            return Some(Node::integer(server_time_ms));
        }
        Some(_) => return None,
        None => {}
    }
    let delta = spec.immediate_child(&ChildKey::new("increment"));
    let delta = delta.leaf_value()?;
    delta.as_f64()?;
    let base = existing.leaf_value().filter(|v| v.as_f64().is_some());
    Some(match (base, delta) {
        (None, d) => Node::leaf(d.clone()),
        (Some(LeafValue::Integer(a)), LeafValue::Integer(b)) => match a.checked_add(*b) {
            Some(sum) => Node::integer(sum),
            None => Node::double(*a as f64 + *b as f64),
        },
        (Some(a), b) => Node::double(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Priority;
    use crate::path::Path;
    use serde_json::json;

    fn node(value: serde_json::Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    #[test]
    fn timestamp_uses_supplied_clock() {
        let resolved = resolve_deferred_value(&node(json!({".sv": "timestamp"})), &Node::Empty, 1234);
        assert_eq!(resolved, Node::integer(1234));
    }

    #[test]
    fn nested_placeholders_keep_siblings_and_priority() {
        let input = node(json!({
            "name": "x",
            "at": {".sv": "timestamp", ".priority": 3},
        }));
        let resolved = resolve_deferred_value(&input, &Node::Empty, 99);
        assert_eq!(resolved.child(&Path::from("name")), Node::string("x"));
        assert_eq!(
            resolved.child(&Path::from("at")),
            Node::integer(99).with_priority(Priority::from(3.0))
        );
        assert!(!contains_server_values(&resolved));
    }

    #[test]
    fn increment_adds_to_existing_number() {
        let inc = node(json!({".sv": {"increment": 2}}));
        assert_eq!(resolve_deferred_value(&inc, &Node::integer(40), 0), Node::integer(42));
        assert_eq!(resolve_deferred_value(&inc, &Node::double(0.5), 0), Node::double(2.5));
        assert_eq!(resolve_deferred_value(&inc, &Node::string("s"), 0), Node::integer(2));
        assert_eq!(resolve_deferred_value(&inc, &Node::Empty, 0), Node::integer(2));
    }

    #[test]
    fn unknown_placeholders_are_untouched() {
        let odd = node(json!({".sv": "mystery"}));
        assert_eq!(resolve_deferred_value(&odd, &Node::Empty, 5), odd);
    }
}

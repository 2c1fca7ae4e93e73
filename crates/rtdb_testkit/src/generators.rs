//! Property-based test generators using proptest.
//!
//! Provides strategies for keys, paths, nodes and JSON values that respect
//! the tree's invariants: valid keys, no empty children, no nulls inside
//! maps.

use proptest::prelude::*;
use rtdb_node::{ChildKey, LeafValue, Node, Path, Priority};
use serde_json::{json, Value};

/// Strategy for valid child keys, mixing integer-like and named keys.
pub fn key_strategy() -> impl Strategy<Value = ChildKey> {
    prop_oneof![
        (-50i32..500).prop_map(|n| ChildKey::new(n.to_string())),
        prop::string::string_regex("[a-zA-Z_][a-zA-Z0-9_-]{0,7}")
            .expect("Invalid regex")
            .prop_map(ChildKey::new),
        Just(ChildKey::new("007")),
    ]
}

/// Strategy for paths of up to `max_depth` segments.
pub fn path_strategy(max_depth: usize) -> impl Strategy<Value = Path> {
    prop::collection::vec(key_strategy(), 0..=max_depth).prop_map(Path::from_keys)
}

/// Strategy for priorities.
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        2 => Just(Priority::None),
        1 => (-100i64..100).prop_map(|n| Priority::Number(n as f64)),
        1 => "[a-z]{1,4}".prop_map(Priority::String),
    ]
}

/// Strategy for leaf values.
pub fn leaf_strategy() -> impl Strategy<Value = LeafValue> {
    prop_oneof![
        any::<bool>().prop_map(LeafValue::Bool),
        any::<i64>().prop_map(LeafValue::Integer),
        (-1.0e6f64..1.0e6).prop_map(LeafValue::Double),
        "[a-z ]{0,8}".prop_map(LeafValue::String),
    ]
}

/// Strategy for nodes up to `depth` levels deep, priorities included.
pub fn node_strategy(depth: u32) -> impl Strategy<Value = Node> {
    let leaf = (leaf_strategy(), priority_strategy())
        .prop_map(|(value, priority)| Node::leaf(value).with_priority(priority));
    leaf.prop_recursive(depth, 64, 6, |inner| {
        (
            prop::collection::vec((key_strategy(), inner), 0..6),
            priority_strategy(),
        )
            .prop_map(|(children, priority)| {
                Node::from_children(children).with_priority(priority)
            })
    })
}

/// Strategy for plain JSON values (no priorities) the tree can hold.
pub fn json_strategy(depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,6}".prop_map(Value::from),
    ];
    leaf.prop_recursive(depth, 32, 5, |inner| {
        prop::collection::btree_map("[a-z]{1,4}", inner, 1..5)
            .prop_map(|map| json!(map))
    })
}

/// One step of a client workload.
#[derive(Debug, Clone)]
pub enum WorkloadOp {
    /// Overwrite at a path.
    Set(Path, Node),
    /// Merge children below a path.
    Update(Path, Vec<(ChildKey, Node)>),
    /// Server-side overwrite by another client.
    ServerSet(Path, Node),
}

/// Strategy for workloads over shallow paths.
pub fn workload_strategy(len: usize) -> impl Strategy<Value = Vec<WorkloadOp>> {
    let op = prop_oneof![
        (path_strategy(2), node_strategy(2)).prop_map(|(p, n)| WorkloadOp::Set(p, n)),
        (
            path_strategy(1),
            prop::collection::btree_map(key_strategy(), node_strategy(1), 1..3)
        )
            .prop_map(|(p, children)| WorkloadOp::Update(p, children.into_iter().collect())),
        (path_strategy(2), node_strategy(2)).prop_map(|(p, n)| WorkloadOp::ServerSet(p, n)),
    ];
    prop::collection::vec(op, 1..=len)
}

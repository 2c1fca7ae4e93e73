//! Conversion between nodes and JSON.
//!
//! The export format carries priorities: a leaf with a priority becomes
//! `{".value": v, ".priority": p}` and an object with a priority gains a
//! `".priority"` member. Server value placeholders (`{".sv": ...}`) are kept
//! as ordinary children so they survive a round trip untouched.

use crate::error::{NodeError, NodeResult};
use crate::key::{ChildKey, PRIORITY_KEY, SERVER_VALUE_KEY, VALUE_KEY};
use crate::node::{LeafValue, Node, Priority};
use serde_json::{Map, Number, Value};

impl Node {
    /// Builds a node from JSON in export format.
    ///
    /// `null` members and array elements are skipped. Arrays become objects
    /// keyed by index.
    pub fn from_json(value: &Value) -> NodeResult<Node> {
        node_from_json(value, "/")
    }

    /// Exports the node including priorities.
    pub fn to_export_json(&self) -> Value {
        match self {
            Node::Empty => Value::Null,
            Node::Leaf { value, priority } => {
                if priority.is_none() {
                    leaf_to_json(value)
                } else {
                    let mut map = Map::new();
                    map.insert(VALUE_KEY.to_string(), leaf_to_json(value));
                    map.insert(PRIORITY_KEY.to_string(), priority_to_json(priority));
                    Value::Object(map)
                }
            }
            Node::Children { children, priority } => {
                let mut map = Map::new();
                for (key, child) in children.iter() {
                    map.insert(key.as_str().to_string(), child.to_export_json());
                }
                if !priority.is_none() {
                    map.insert(PRIORITY_KEY.to_string(), priority_to_json(priority));
                }
                Value::Object(map)
            }
        }
    }

    /// Plain JSON without priorities.
    ///
    /// Objects whose keys are all non-negative integers, with the largest
    /// key below twice the number of children, come back as arrays with
    /// `null` in the gaps.
    pub fn to_json_value(&self) -> Value {
        match self {
            Node::Empty => Value::Null,
            Node::Leaf { value, .. } => leaf_to_json(value),
            Node::Children { children, .. } => {
                let count = children.len();
                let mut max_index: i64 = -1;
                let all_indexes = children.keys().all(|k| match k.as_int() {
                    Some(n) if n >= 0 => {
                        max_index = max_index.max(i64::from(n));
                        true
                    }
                    _ => false,
                });
                if all_indexes && max_index < 2 * count as i64 {
                    let mut array = vec![Value::Null; (max_index + 1) as usize];
                    for (key, child) in children.iter() {
                        if let Some(n) = key.as_int() {
                            array[n as usize] = child.to_json_value();
                        }
                    }
                    Value::Array(array)
                } else {
                    let map = children
                        .iter()
                        .map(|(k, v)| (k.as_str().to_string(), v.to_json_value()))
                        .collect();
                    Value::Object(map)
                }
            }
        }
    }
}

/// Parses a priority from JSON.
pub fn priority_from_json(value: &Value) -> NodeResult<Priority> {
    match value {
        Value::Null => Ok(Priority::None),
        Value::Number(n) => n
            .as_f64()
            .map(Priority::Number)
            .ok_or_else(|| NodeError::InvalidPriority(n.to_string())),
        Value::String(s) => Ok(Priority::String(s.clone())),
        other => Err(NodeError::InvalidPriority(other.to_string())),
    }
}

/// Exports a priority to JSON.
pub fn priority_to_json(priority: &Priority) -> Value {
    match priority {
        Priority::None => Value::Null,
        Priority::Number(n) => number_to_json(*n),
        Priority::String(s) => Value::String(s.clone()),
    }
}

fn leaf_to_json(value: &LeafValue) -> Value {
    match value {
        LeafValue::Bool(b) => Value::Bool(*b),
        LeafValue::Integer(n) => Value::Number(Number::from(*n)),
        LeafValue::Double(d) => number_to_json(*d),
        LeafValue::String(s) => Value::String(s.clone()),
    }
}

fn number_to_json(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn leaf_from_json(value: &Value, at: &str) -> NodeResult<Option<LeafValue>> {
    Ok(match value {
        Value::Null => None,
        Value::Bool(b) => Some(LeafValue::Bool(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(LeafValue::Integer(i)),
            None => Some(LeafValue::Double(n.as_f64().ok_or_else(|| {
                NodeError::invalid_value(at, format!("unsupported number {n}"))
            })?)),
        },
        Value::String(s) => Some(LeafValue::String(s.clone())),
        Value::Array(_) | Value::Object(_) => {
            return Err(NodeError::invalid_value(at, "expected a scalar"));
        }
    })
}

fn child_location(at: &str, key: &str) -> String {
    if at == "/" {
        format!("/{key}")
    } else {
        format!("{at}/{key}")
    }
}

fn node_from_json(value: &Value, at: &str) -> NodeResult<Node> {
    match value {
        Value::Array(items) => {
            let mut children = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let key = i.to_string();
                let child = node_from_json(item, &child_location(at, &key))?;
                children.push((ChildKey::new(key), child));
            }
            Ok(Node::from_children(children))
        }
        Value::Object(map) => {
            let priority = match map.get(PRIORITY_KEY) {
                Some(p) => priority_from_json(p)?,
                None => Priority::None,
            };
            if let Some(inner) = map.get(VALUE_KEY) {
                let node = match leaf_from_json(inner, at)? {
                    Some(leaf) => Node::leaf(leaf),
                    None => Node::Empty,
                };
                return Ok(node.with_priority(priority));
            }
            let mut children = Vec::with_capacity(map.len());
            for (name, child) in map {
                if name == PRIORITY_KEY {
                    continue;
                }
                // The placeholder marker is the one dotted key a value may hold.
                let key = if name == SERVER_VALUE_KEY {
                    ChildKey::new(name.as_str())
                } else {
                    ChildKey::parse(name)
                        .map_err(|e| NodeError::invalid_value(at, e.to_string()))?
                };
                let child = node_from_json(child, &child_location(at, name))?;
                children.push((key, child));
            }
            Ok(Node::from_children(children).with_priority(priority))
        }
        scalar => Ok(match leaf_from_json(scalar, at)? {
            Some(leaf) => Node::leaf(leaf),
            None => Node::Empty,
        }),
    }
}

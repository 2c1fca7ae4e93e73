//! Query parameters and local filtering.
//!
//! The client always listens to whole locations and applies ordering,
//! range and limit filters to the local view.

use crate::error::{CoreError, CoreResult};
use rtdb_node::{ChildKey, Index, LeafValue, NamedNode, Node, Path};
use std::cmp::Ordering;
use std::fmt;

/// How many children a query keeps, and from which end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// The first `n` children in index order.
    First(usize),
    /// The last `n` children in index order.
    Last(usize),
}

/// Ordering, range and limit of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    index: Index,
    ordered: bool,
    start: Option<NamedNode>,
    end: Option<NamedNode>,
    limit: Option<Limit>,
}

impl QueryParams {
    /// Parameters that select the whole location.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ordering index.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The lower bound, if any.
    pub fn start(&self) -> Option<&NamedNode> {
        self.start.as_ref()
    }

    /// The upper bound, if any.
    pub fn end(&self) -> Option<&NamedNode> {
        self.end.as_ref()
    }

    /// The limit, if any.
    pub fn limit(&self) -> Option<Limit> {
        self.limit
    }

    /// Returns true if the query selects every child.
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    /// Orders by `index`.
    pub fn order_by(mut self, index: Index) -> CoreResult<Self> {
        if self.ordered {
            return Err(CoreError::invalid_argument("an order by was already specified"));
        }
        if let Index::Child(path) = &index {
            if path.is_empty() || path.iter().any(|k| k.is_priority()) || path.is_info() {
                return Err(CoreError::invalid_argument(format!(
                    "cannot order by child path {path}"
                )));
            }
        }
        if self.start.is_some() || self.end.is_some() {
            self.check_bound_types(&index)?;
        }
        self.index = index;
        self.ordered = true;
        Ok(self)
    }

    /// Keeps children at or after `value` (and `key` on ties).
    pub fn start_at(mut self, value: Node, key: Option<ChildKey>) -> CoreResult<Self> {
        if self.start.is_some() {
            return Err(CoreError::invalid_argument("a start point was already set"));
        }
        self.start = Some(self.bound(value, key, ChildKey::min())?);
        Ok(self)
    }

    /// Keeps children at or before `value` (and `key` on ties).
    pub fn end_at(mut self, value: Node, key: Option<ChildKey>) -> CoreResult<Self> {
        if self.end.is_some() {
            return Err(CoreError::invalid_argument("an end point was already set"));
        }
        self.end = Some(self.bound(value, key, ChildKey::max())?);
        Ok(self)
    }

    /// Keeps children equal to `value` (and `key`, if given).
    pub fn equal_to(self, value: Node, key: Option<ChildKey>) -> CoreResult<Self> {
        if self.start.is_some() || self.end.is_some() {
            return Err(CoreError::invalid_argument(
                "equal_to cannot be combined with start_at or end_at",
            ));
        }
        self.start_at(value.clone(), key.clone())?.end_at(value, key)
    }

    /// Keeps the first `n` children.
    pub fn limit_to_first(self, n: usize) -> CoreResult<Self> {
        self.with_limit(Limit::First(n), n)
    }

    /// Keeps the last `n` children.
    pub fn limit_to_last(self, n: usize) -> CoreResult<Self> {
        self.with_limit(Limit::Last(n), n)
    }

    fn with_limit(mut self, limit: Limit, n: usize) -> CoreResult<Self> {
        if n == 0 {
            return Err(CoreError::invalid_argument("limit must be positive"));
        }
        if self.limit.is_some() {
            return Err(CoreError::invalid_argument("a limit was already set"));
        }
        self.limit = Some(limit);
        Ok(self)
    }

    fn bound(&self, value: Node, key: Option<ChildKey>, default_key: ChildKey) -> CoreResult<NamedNode> {
        if let Some(k) = &key {
            if k.is_priority() {
                return Err(CoreError::invalid_argument("bound key must be a child key"));
            }
        }
        check_bound_value(&self.index, &value)?;
        if self.index == Index::Key {
            if key.is_some() {
                return Err(CoreError::invalid_argument(
                    "cannot pass a key to a bound when ordering by key",
                ));
            }
            let name = match value.leaf_value() {
                Some(LeafValue::String(s)) => s.clone(),
                _ => return Err(CoreError::invalid_argument("key bounds must be strings")),
            };
            return Ok(NamedNode::new(ChildKey::new(name), Node::Empty));
        }
        Ok(NamedNode::new(key.unwrap_or(default_key), value))
    }

    fn check_bound_types(&self, index: &Index) -> CoreResult<()> {
        for bound in [&self.start, &self.end].into_iter().flatten() {
            check_bound_value(index, &bound.node)?;
            if *index == Index::Key {
                return Err(CoreError::invalid_argument(
                    "order by key must be set before start_at, end_at or equal_to",
                ));
            }
        }
        Ok(())
    }

    /// Children of `node` inside this query's window, in index order.
    pub fn window(&self, node: &Node) -> Vec<NamedNode> {
        let mut children: Vec<NamedNode> = self
            .index
            .sorted_children(node)
            .into_iter()
            .filter(|child| self.in_range(&child.key, &child.node))
            .collect();
        match self.limit {
            Some(Limit::First(n)) => children.truncate(n),
            Some(Limit::Last(n)) => {
                let skip = children.len().saturating_sub(n);
                children.drain(..skip);
            }
            None => {}
        }
        children
    }

    fn in_range(&self, key: &ChildKey, node: &Node) -> bool {
        let after_start = self
            .start
            .as_ref()
            .map_or(true, |b| self.index.compare_to_bound(key, node, b) != Ordering::Less);
        let before_end = self
            .end
            .as_ref()
            .map_or(true, |b| self.index.compare_to_bound(key, node, b) != Ordering::Greater);
        after_start && before_end
    }

    /// The value of `node` as seen through this query.
    pub fn view(&self, node: &Node) -> Node {
        if self.loads_all_data() {
            return node.clone();
        }
        Node::from_children(self.window(node).into_iter().map(|c| (c.key, c.node)))
            .with_priority(node.priority().clone())
    }
}

fn check_bound_value(index: &Index, value: &Node) -> CoreResult<()> {
    if !value.is_empty() && !value.is_leaf() {
        return Err(CoreError::invalid_argument(
            "query bounds must be null, a boolean, a number or a string",
        ));
    }
    if *index == Index::Priority && matches!(value.leaf_value(), Some(LeafValue::Bool(_))) {
        return Err(CoreError::invalid_argument(
            "priority bounds must be null, a number or a string",
        ));
    }
    Ok(())
}

/// A location plus the parameters applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// The location.
    pub path: Path,
    /// The filter applied to it.
    pub params: QueryParams,
}

impl QuerySpec {
    /// A query for a whole location.
    pub fn location(path: Path) -> Self {
        Self {
            path,
            params: QueryParams::default(),
        }
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (by {})", self.path, self.params.index)?;
        if let Some(limit) = self.params.limit {
            write!(f, " {limit:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scores() -> Node {
        Node::from_json(&json!({
            "alice": {"score": 30},
            "bob": {"score": 10},
            "carol": {"score": 20},
            "dave": {"score": 20},
            "erin": {"name": "no score"},
        }))
        .unwrap()
    }

    fn keys(window: &[NamedNode]) -> Vec<&str> {
        window.iter().map(|c| c.key.as_str()).collect()
    }

    fn by_score() -> QueryParams {
        QueryParams::new().order_by(Index::Child(Path::from("score"))).unwrap()
    }

    #[test]
    fn order_and_limit() {
        let node = scores();
        let window = by_score().limit_to_last(2).unwrap().window(&node);
        assert_eq!(keys(&window), vec!["dave", "alice"]);

        let window = by_score().limit_to_first(2).unwrap().window(&node);
        assert_eq!(keys(&window), vec!["erin", "bob"]);
    }

    #[test]
    fn ranges_with_keys() {
        let node = scores();
        let window = by_score()
            .start_at(Node::integer(20), None)
            .unwrap()
            .window(&node);
        assert_eq!(keys(&window), vec!["carol", "dave", "alice"]);

        let window = by_score()
            .start_at(Node::integer(20), Some(ChildKey::new("d")))
            .unwrap()
            .window(&node);
        assert_eq!(keys(&window), vec!["dave", "alice"]);

        let window = by_score()
            .equal_to(Node::integer(20), None)
            .unwrap()
            .window(&node);
        assert_eq!(keys(&window), vec!["carol", "dave"]);
    }

    #[test]
    fn key_ranges() {
        let node = scores();
        let query = QueryParams::new()
            .order_by(Index::Key)
            .unwrap()
            .start_at(Node::string("b"), None)
            .unwrap()
            .end_at(Node::string("d"), None)
            .unwrap();
        assert_eq!(keys(&query.window(&node)), vec!["bob", "carol"]);
        assert!(QueryParams::new()
            .order_by(Index::Key)
            .unwrap()
            .start_at(Node::integer(1), None)
            .is_err());
    }

    #[test]
    fn view_keeps_only_the_window() {
        let node = scores();
        let query = by_score().limit_to_first(1).unwrap();
        let view = query.view(&node);
        assert_eq!(view.child_count(), 1);
        assert!(view.has_child(&ChildKey::new("erin")));

        assert_eq!(QueryParams::new().view(&Node::integer(4)), Node::integer(4));
        assert!(query.view(&Node::integer(4)).is_empty());
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        assert!(by_score().order_by(Index::Value).is_err());
        assert!(QueryParams::new().limit_to_first(0).is_err());
        assert!(QueryParams::new()
            .limit_to_first(1)
            .unwrap()
            .limit_to_last(1)
            .is_err());
        assert!(QueryParams::new()
            .start_at(Node::integer(1), None)
            .unwrap()
            .equal_to(Node::integer(1), None)
            .is_err());
        assert!(QueryParams::new()
            .start_at(Node::from_json(&json!({"a": 1})).unwrap(), None)
            .is_err());
        assert!(QueryParams::new()
            .start_at(Node::boolean(true), None)
            .is_err());
        assert!(QueryParams::new()
            .order_by(Index::Child(Path::from(".priority")))
            .is_err());
    }
}

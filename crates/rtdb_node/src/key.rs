//! Child keys and their ordering.

use crate::error::{NodeError, NodeResult};
use std::cmp::Ordering;
use std::fmt;

/// Name of the pseudo-child holding a node's priority.
pub const PRIORITY_KEY: &str = ".priority";

/// Name of the pseudo-child holding a leaf value in export format.
pub const VALUE_KEY: &str = ".value";

/// Name of the server-value placeholder key.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Root segment of the client-local info tree.
pub const INFO_KEY: &str = ".info";

const MIN_NAME: &str = "[MIN_NAME]";
const MAX_NAME: &str = "[MAX_NAME]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum KeyKind {
    Min,
    Int(i32),
    Name,
    Max,
}

impl KeyKind {
    fn rank(self) -> u8 {
        match self {
            KeyKind::Min => 0,
            KeyKind::Int(_) => 1,
            KeyKind::Name => 2,
            KeyKind::Max => 3,
        }
    }
}

/// The name of one child in a tree node.
///
/// Keys that are canonical 32-bit integers sort numerically and before every
/// other key. All remaining keys sort lexicographically by bytes. Two
/// sentinel keys bound the order from below and above and are only used as
/// query bounds.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChildKey {
    name: String,
    kind: KeyKind,
}

impl ChildKey {
    /// Creates a key without validating it.
    ///
    /// Use [`ChildKey::parse`] for user-supplied names.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = match parse_canonical_int(&name) {
            Some(n) => KeyKind::Int(n),
            None => KeyKind::Name,
        };
        Self { name, kind }
    }

    /// Parses and validates a user-supplied key.
    pub fn parse(name: &str) -> NodeResult<Self> {
        validate_key(name)?;
        Ok(Self::new(name))
    }

    /// The key that sorts before every other key.
    pub fn min() -> Self {
        Self {
            name: MIN_NAME.to_string(),
            kind: KeyKind::Min,
        }
    }

    /// The key that sorts after every other key.
    pub fn max() -> Self {
        Self {
            name: MAX_NAME.to_string(),
            kind: KeyKind::Max,
        }
    }

    /// The `.priority` pseudo-key.
    pub fn priority() -> Self {
        Self::new(PRIORITY_KEY)
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Returns true for the `.priority` pseudo-key.
    pub fn is_priority(&self) -> bool {
        self.name == PRIORITY_KEY
    }

    /// Returns the integer value if this is a canonical integer key.
    pub fn as_int(&self) -> Option<i32> {
        match self.kind {
            KeyKind::Int(n) => Some(n),
            _ => None,
        }
    }

    /// Returns true for the min or max sentinel.
    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, KeyKind::Min | KeyKind::Max)
    }
}

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.kind, other.kind) {
            (KeyKind::Int(a), KeyKind::Int(b)) => a.cmp(&b),
            (a, b) if a.rank() != b.rank() => a.rank().cmp(&b.rank()),
            _ => self.name.as_bytes().cmp(other.name.as_bytes()),
        }
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.name)
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for ChildKey {
    fn from(name: &str) -> Self {
        ChildKey::new(name)
    }
}

impl From<String> for ChildKey {
    fn from(name: String) -> Self {
        ChildKey::new(name)
    }
}

/// Returns the integer for keys like `0`, `17` or `-3`.
///
/// Leading zeros, `-0`, a leading `+` and values outside `i32` are not
/// canonical and stay string keys.
fn parse_canonical_int(name: &str) -> Option<i32> {
    let digits = name.strip_prefix('-').unwrap_or(name);
    if digits.is_empty() || digits.len() > 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if name == "-0" {
        return None;
    }
    name.parse::<i32>().ok()
}

/// Validates a user-supplied key.
pub(crate) fn validate_key(name: &str) -> NodeResult<()> {
    if name.is_empty() {
        return Err(NodeError::invalid_key(name, "key must not be empty"));
    }
    if name.len() > 768 {
        return Err(NodeError::invalid_key(name, "key is longer than 768 bytes"));
    }
    let forbidden = name
        .chars()
        .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']' | '/') || c.is_control());
    if forbidden {
        return Err(NodeError::invalid_key(
            name,
            "keys must not contain '/', '.', '#', '$', '[', ']' or control characters",
        ));
    }
    Ok(())
}

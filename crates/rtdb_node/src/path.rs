//! Slash-delimited locations in the tree.

use crate::error::{NodeError, NodeResult};
use crate::key::{validate_key, ChildKey, INFO_KEY, PRIORITY_KEY};
use std::fmt;

/// A location in the tree, relative to the root.
///
/// Paths are ordered segment by segment using the [`ChildKey`] ordering, so
/// an ancestor always sorts directly before its descendants.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<ChildKey>,
}

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Builds a path from already validated keys.
    pub fn from_keys(segments: impl IntoIterator<Item = ChildKey>) -> Self {
        Self {
            segments: segments.into_iter().collect(),
        }
    }

    /// Parses a user-supplied path such as `"users/alice/age"`.
    ///
    /// Empty segments are ignored, so leading, trailing and doubled slashes
    /// are harmless. `.info` is allowed as the first segment and `.priority`
    /// as the last one; any other segment must be a valid key.
    pub fn parse(path: &str) -> NodeResult<Self> {
        let raw: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let last = raw.len().saturating_sub(1);
        let mut segments = Vec::with_capacity(raw.len());
        for (i, segment) in raw.iter().enumerate() {
            let special = (i == 0 && *segment == INFO_KEY) || (i == last && *segment == PRIORITY_KEY);
            if !special {
                validate_key(segment)
                    .map_err(|e| NodeError::invalid_path(path, e.to_string()))?;
            }
            segments.push(ChildKey::new(*segment));
        }
        if path.len() > 768 {
            return Err(NodeError::invalid_path(path, "path is longer than 768 bytes"));
        }
        Ok(Self { segments })
    }

    /// Parses a path that is about to be written to.
    ///
    /// Writes under `.info` are rejected.
    pub fn parse_writable(path: &str) -> NodeResult<Self> {
        let parsed = Self::parse(path)?;
        if parsed.is_info() {
            return Err(NodeError::invalid_path(path, ".info paths are read-only"));
        }
        Ok(parsed)
    }

    /// Returns true for the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if the path lives under `.info`.
    pub fn is_info(&self) -> bool {
        self.front().map(|k| k.as_str() == INFO_KEY).unwrap_or(false)
    }

    /// First segment.
    pub fn front(&self) -> Option<&ChildKey> {
        self.segments.first()
    }

    /// Last segment.
    pub fn back(&self) -> Option<&ChildKey> {
        self.segments.last()
    }

    /// The path without its first segment.
    pub fn pop_front(&self) -> Path {
        Path {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// The parent path, or `None` at the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Path {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Appends one key.
    pub fn child(&self, key: impl Into<ChildKey>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(key.into());
        Path { segments }
    }

    /// Appends another path.
    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Path { segments }
    }

    /// Iterates over the segments.
    pub fn iter(&self) -> impl Iterator<Item = &ChildKey> {
        self.segments.iter()
    }

    /// Returns true if `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Returns true if one path contains the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The path from `self` down to `descendant`, if `self` contains it.
    pub fn relative(&self, descendant: &Path) -> Option<Path> {
        if !self.contains(descendant) {
            return None;
        }
        Some(Path {
            segments: descendant.segments[self.segments.len()..].to_vec(),
        })
    }

    /// Segments as plain strings.
    pub fn to_segments(&self) -> Vec<String> {
        self.segments.iter().map(|k| k.as_str().to_string()).collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl From<&str> for Path {
    /// Splits on `/` without validation; intended for literals in internal code
    /// and tests.
    fn from(path: &str) -> Self {
        Path::from_keys(path.split('/').filter(|s| !s.is_empty()).map(ChildKey::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ignores_empty_segments() {
        let path = Path::parse("/users//alice/").unwrap();
        assert_eq!(path.to_segments(), vec!["users", "alice"]);
        assert_eq!(path.to_string(), "/users/alice");
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn parse_rejects_bad_segments() {
        assert!(Path::parse("a/b.c").is_err());
        assert!(Path::parse("a/$b").is_err());
        assert!(Path::parse(".info/connected").is_ok());
        assert!(Path::parse("a/.info").is_err());
        assert!(Path::parse("a/.priority").is_ok());
        assert!(Path::parse(".priority/a").is_err());
        assert!(Path::parse_writable(".info/connected").is_err());
    }

    #[test]
    fn containment_and_relative() {
        let a = Path::from("a");
        let abc = Path::from("a/b/c");
        assert!(a.contains(&abc));
        assert!(!abc.contains(&a));
        assert!(a.overlaps(&abc) && abc.overlaps(&a));
        assert!(!Path::from("a/b").overlaps(&Path::from("a/c")));
        assert!(Path::root().contains(&abc));
        assert_eq!(a.relative(&abc), Some(Path::from("b/c")));
        assert_eq!(abc.relative(&a), None);
    }

    #[test]
    fn navigation() {
        let path = Path::from("x/y");
        assert_eq!(path.parent(), Some(Path::from("x")));
        assert_eq!(Path::root().parent(), None);
        assert_eq!(path.child("z"), Path::from("x/y/z"));
        assert_eq!(path.pop_front(), Path::from("y"));
        assert_eq!(path.front().map(|k| k.as_str()), Some("x"));
        assert_eq!(path.back().map(|k| k.as_str()), Some("y"));
        assert_eq!(Path::from("a").join(&Path::from("b/c")), Path::from("a/b/c"));
    }

    #[test]
    fn ancestors_sort_before_descendants() {
        let mut paths = vec![Path::from("a/b"), Path::from("b"), Path::from("a"), Path::from("10")];
        paths.sort();
        assert_eq!(
            paths,
            vec![Path::from("10"), Path::from("a"), Path::from("a/b"), Path::from("b")]
        );
    }
}

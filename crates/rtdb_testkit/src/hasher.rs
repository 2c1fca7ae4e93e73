//! A transaction hasher that can be made to lie.

use rtdb_core::{ContentHasher, TransactionHasher};
use rtdb_node::Node;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Token sent while hijacked. No stored value hashes to it.
pub const HIJACKED_HASH: &str = "hijacked";

/// Hashes like [`ContentHasher`] until hijacked, then returns a token that
/// never matches, forcing every conditional put to come back stale.
#[derive(Debug, Default)]
pub struct HijackableHasher {
    hijacked: AtomicBool,
    calls: AtomicUsize,
}

impl HijackableHasher {
    /// Creates an honest hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts returning [`HIJACKED_HASH`].
    pub fn hijack(&self) {
        self.hijacked.store(true, Ordering::SeqCst);
    }

    /// Goes back to honest hashing.
    pub fn restore(&self) {
        self.hijacked.store(false, Ordering::SeqCst);
    }

    /// Returns true while hijacked.
    pub fn is_hijacked(&self) -> bool {
        self.hijacked.load(Ordering::SeqCst)
    }

    /// Number of hashes computed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransactionHasher for HijackableHasher {
    fn hash(&self, node: &Node) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_hijacked() {
            HIJACKED_HASH.to_string()
        } else {
            ContentHasher.hash(node)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hijack_toggles() {
        let hasher = HijackableHasher::new();
        let node = Node::integer(1);
        assert_eq!(hasher.hash(&node), ContentHasher.hash(&node));
        hasher.hijack();
        assert_eq!(hasher.hash(&node), HIJACKED_HASH);
        hasher.restore();
        assert_ne!(hasher.hash(&node), HIJACKED_HASH);
        assert_eq!(hasher.calls(), 3);
    }
}

//! Subscriptions and event computation.

use crate::error::DatabaseError;
use crate::event::{Event, EventListener, EventMask, EventType};
use crate::query::QuerySpec;
use crate::run_loop::panic_message;
use crate::snapshot::DataSnapshot;
use rtdb_node::{ChildKey, NamedNode, Node, Path};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(pub(crate) u64);

impl ListenerHandle {
    /// Allocates a handle unique within the process.
    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerHandle(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// The last view dispatched to a subscription.
#[derive(Debug, Clone)]
struct View {
    node: Node,
    window: Vec<NamedNode>,
}

struct Subscription {
    query: QuerySpec,
    mask: EventMask,
    listener: Box<dyn EventListener>,
    last_view: Option<View>,
}

/// All subscriptions of one repo.
#[derive(Default)]
pub struct ListenerRegistry {
    subscriptions: BTreeMap<ListenerHandle, Subscription>,
    locations: BTreeMap<Path, usize>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription under `handle`.
    ///
    /// Returns true if it is the first one at its location.
    pub fn add(
        &mut self,
        handle: ListenerHandle,
        query: QuerySpec,
        mask: EventMask,
        listener: Box<dyn EventListener>,
    ) -> bool {
        let count = self.locations.entry(query.path.clone()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        debug!(query = %query, id = handle.0, "listener added");
        self.subscriptions.insert(
            handle,
            Subscription {
                query,
                mask,
                listener,
                last_view: None,
            },
        );
        first
    }

    /// Removes a subscription.
    ///
    /// Returns its location and whether it was the last one there, or
    /// `None` for an unknown handle.
    pub fn remove(&mut self, handle: ListenerHandle) -> Option<(Path, bool)> {
        let sub = self.subscriptions.remove(&handle)?;
        let path = sub.query.path;
        let last = match self.locations.get_mut(&path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                self.locations.remove(&path);
                true
            }
        };
        debug!(path = %path, id = handle.0, "listener removed");
        Some((path, last))
    }

    /// Cancels every subscription at `path`.
    ///
    /// Each listener's `on_cancel` runs once and the subscriptions are
    /// removed. Returns the number of subscriptions cancelled.
    pub fn cancel_location(&mut self, path: &Path, error: &DatabaseError) -> usize {
        let handles: Vec<ListenerHandle> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| &sub.query.path == path)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &handles {
            if let Some(mut sub) = self.subscriptions.remove(handle) {
                let outcome = catch_unwind(AssertUnwindSafe(|| sub.listener.on_cancel(error)));
                if let Err(panic) = outcome {
                    error!(path = %path, panic = %panic_message(panic.as_ref()), "listener panicked in on_cancel");
                }
            }
        }
        self.locations.remove(path);
        handles.len()
    }

    /// Locations with at least one subscription.
    pub fn locations(&self) -> impl Iterator<Item = &Path> {
        self.locations.keys()
    }

    /// Returns true if any subscription exists.
    pub fn has_listeners(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Returns true if the handle is registered.
    pub fn contains(&self, handle: ListenerHandle) -> bool {
        self.subscriptions.contains_key(&handle)
    }

    /// Recomputes every subscription whose location overlaps `changed`.
    ///
    /// `view_at` returns the current value at a location, or `None` while
    /// the location is not complete.
    pub fn recompute(&mut self, changed: &Path, view_at: &dyn Fn(&Path) -> Option<Node>) {
        let mut cache: HashMap<Path, Option<Node>> = HashMap::new();
        for (handle, sub) in self.subscriptions.iter_mut() {
            if !sub.query.path.overlaps(changed) {
                continue;
            }
            let current = cache
                .entry(sub.query.path.clone())
                .or_insert_with(|| view_at(&sub.query.path))
                .clone();
            if let Some(node) = current {
                dispatch(*handle, sub, &node);
            }
        }
    }

    /// Computes and dispatches the initial view of one subscription, if its
    /// location is complete.
    pub fn refresh(&mut self, handle: ListenerHandle, view_at: &dyn Fn(&Path) -> Option<Node>) {
        if let Some(sub) = self.subscriptions.get_mut(&handle) {
            if let Some(node) = view_at(&sub.query.path) {
                dispatch(handle, sub, &node);
            }
        }
    }
}

fn dispatch(handle: ListenerHandle, sub: &mut Subscription, location_node: &Node) {
    let params = &sub.query.params;
    let view = View {
        node: params.view(location_node),
        window: params.window(location_node),
    };
    let events = compute_events(&sub.query, sub.last_view.as_ref(), &view);
    sub.last_view = Some(view);
    for event in events.iter().filter(|e| sub.mask.contains(e.event_type)) {
        let outcome = catch_unwind(AssertUnwindSafe(|| sub.listener.on_event(event)));
        if let Err(panic) = outcome {
            error!(
                id = handle.0,
                event = %event.event_type,
                panic = %panic_message(panic.as_ref()),
                "listener panicked"
            );
        }
    }
}

fn prev_key(window: &[NamedNode], position: usize) -> Option<ChildKey> {
    position
        .checked_sub(1)
        .and_then(|p| window.get(p))
        .map(|c| c.key.clone())
}

/// Diffs two views into events, ordered removed, added, moved, changed,
/// value.
fn compute_events(query: &QuerySpec, old: Option<&View>, new: &View) -> Vec<Event> {
    let index = query.params.index();
    let child_snapshot = |key: &ChildKey, node: &Node| {
        DataSnapshot::with_index(query.path.child(key.clone()), node.clone(), index.clone())
    };
    let value_event = || Event {
        event_type: EventType::Value,
        snapshot: DataSnapshot::with_index(query.path.clone(), new.node.clone(), index.clone()),
        prev_sibling_key: None,
    };

    let Some(old) = old else {
        let mut events: Vec<Event> = new
            .window
            .iter()
            .enumerate()
            .map(|(i, child)| Event {
                event_type: EventType::ChildAdded,
                snapshot: child_snapshot(&child.key, &child.node),
                prev_sibling_key: prev_key(&new.window, i),
            })
            .collect();
        events.push(value_event());
        return events;
    };

    let old_children: HashMap<&ChildKey, &Node> =
        old.window.iter().map(|c| (&c.key, &c.node)).collect();
    let new_children: HashMap<&ChildKey, &Node> =
        new.window.iter().map(|c| (&c.key, &c.node)).collect();

    let mut removed = Vec::new();
    let mut added = Vec::new();
    let mut moved = Vec::new();
    let mut changed = Vec::new();

    for child in &old.window {
        if !new_children.contains_key(&child.key) {
            removed.push(Event {
                event_type: EventType::ChildRemoved,
                snapshot: child_snapshot(&child.key, &child.node),
                prev_sibling_key: None,
            });
        }
    }
    for (i, child) in new.window.iter().enumerate() {
        let event = |event_type| Event {
            event_type,
            snapshot: child_snapshot(&child.key, &child.node),
            prev_sibling_key: prev_key(&new.window, i),
        };
        match old_children.get(&child.key) {
            None => added.push(event(EventType::ChildAdded)),
            Some(previous) => {
                if index.indexed_value_changed(previous, &child.node) {
                    moved.push(event(EventType::ChildMoved));
                }
                if *previous != &child.node {
                    changed.push(event(EventType::ChildChanged));
                }
            }
        }
    }

    let mut events = removed;
    events.extend(added);
    events.extend(moved);
    events.extend(changed);
    if old.node != new.node {
        events.push(value_event());
    }
    events
}

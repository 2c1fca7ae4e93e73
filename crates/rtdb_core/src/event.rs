//! Events delivered to listeners.

use crate::error::DatabaseError;
use crate::snapshot::DataSnapshot;
use rtdb_node::ChildKey;
use std::fmt;
use std::ops::BitOr;

/// Kinds of events, in the order they are raised for one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// A child left the view.
    ChildRemoved,
    /// A child entered the view.
    ChildAdded,
    /// A child changed position under the view's ordering.
    ChildMoved,
    /// A child's value changed.
    ChildChanged,
    /// The value of the whole view changed.
    Value,
}

impl EventType {
    fn bit(self) -> u8 {
        match self {
            EventType::ChildRemoved => 1,
            EventType::ChildAdded => 1 << 1,
            EventType::ChildMoved => 1 << 2,
            EventType::ChildChanged => 1 << 3,
            EventType::Value => 1 << 4,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::ChildRemoved => "child_removed",
            EventType::ChildAdded => "child_added",
            EventType::ChildMoved => "child_moved",
            EventType::ChildChanged => "child_changed",
            EventType::Value => "value",
        })
    }
}

/// A set of event types a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    /// No events.
    pub const NONE: EventMask = EventMask(0);
    /// Only `value` events.
    pub const VALUE: EventMask = EventMask(1 << 4);
    /// The four child events.
    pub const CHILD: EventMask = EventMask(0b1111);
    /// Every event.
    pub const ALL: EventMask = EventMask(0b1_1111);

    /// A mask with exactly one event type.
    pub fn only(event_type: EventType) -> Self {
        EventMask(event_type.bit())
    }

    /// Returns true if `event_type` is in the mask.
    pub fn contains(self, event_type: EventType) -> bool {
        self.0 & event_type.bit() != 0
    }

    /// Returns true if the mask is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl From<EventType> for EventMask {
    fn from(event_type: EventType) -> Self {
        EventMask::only(event_type)
    }
}

/// One notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// What happened.
    pub event_type: EventType,
    /// The child for child events, or the whole view for `value`.
    pub snapshot: DataSnapshot,
    /// Key of the preceding child in the view, for added, moved and
    /// changed events.
    pub prev_sibling_key: Option<ChildKey>,
}

/// Receives events for one subscription.
///
/// Callbacks run on the repo's run loop thread and must not block.
pub trait EventListener: Send + 'static {
    /// Called for every event the subscription asked for.
    fn on_event(&mut self, event: &Event);

    /// Called once when the subscription is cancelled by the server.
    fn on_cancel(&mut self, error: &DatabaseError) {
        let _ = error;
    }
}

impl<F> EventListener for F
where
    F: FnMut(&Event) + Send + 'static,
{
    fn on_event(&mut self, event: &Event) {
        self(event)
    }
}

//! Domain event marker.
//!
//! `DomainEvent` is the lightweight trait every concrete event type
//! implements. Events carry no persistence concerns; they are in-process
//! values dispatched to listeners by the
//! [`subscription`](crate::subscription) module within the publishing
//! read-write transaction.
//!
//! Rust has no runtime class hierarchy, so supertype dispatch is expressed
//! with explicit tags: an event names its ancestor categories through
//! [`DomainEvent::parents`], and a listener subscribed to an ancestor tag
//! receives every event that lists it.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Runtime identity of an event type (or of a marker type standing in for an
/// event category).
///
/// Two tags are equal exactly when they were created for the same type. The
/// captured type name is diagnostic only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTag {
    id: TypeId,
    name: &'static str,
}

impl EventTag {
    /// Tag for the type `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The type name captured when the tag was created.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Marker trait for events published through a read-write transaction.
///
/// Implementations are plain data types. Declare ancestor categories by
/// overriding [`parents`](Self::parents) with the transitive closure of
/// category tags, nearest first; the default is no ancestors.
///
/// ```ignore
/// struct GroupChanged;
///
/// struct GroupRenamed { id: GroupId, name: String }
///
/// impl DomainEvent for GroupRenamed {
///     fn parents() -> Vec<EventTag> {
///         vec![EventTag::of::<GroupChanged>()]
///     }
/// }
/// ```
pub trait DomainEvent: Send + Sync + 'static {
    /// Ancestor category tags this event also matches, nearest first.
    #[must_use]
    fn parents() -> Vec<EventTag>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// A type-erased event captured at publish time.
///
/// Carries the concrete event behind `Any` together with its tag and the
/// ancestor tags recorded from [`DomainEvent::parents`], so the subscription
/// manager can dispatch without knowing the concrete type.
#[derive(Clone)]
pub struct PublishedEvent {
    tag: EventTag,
    parents: Arc<[EventTag]>,
    value: Arc<dyn Any + Send + Sync>,
}

impl PublishedEvent {
    /// Erase a concrete event for dispatch.
    #[must_use]
    pub fn new<E: DomainEvent>(event: E) -> Self {
        Self {
            tag: EventTag::of::<E>(),
            parents: E::parents().into(),
            value: Arc::new(event),
        }
    }

    /// The tag of the concrete event type.
    #[must_use]
    pub fn tag(&self) -> EventTag {
        self.tag
    }

    /// Ancestor tags declared by the event type, nearest first.
    #[must_use]
    pub fn parents(&self) -> &[EventTag] {
        &self.parents
    }

    /// Recover the concrete event, if `E` is its actual type.
    #[must_use]
    pub fn downcast<E: DomainEvent>(&self) -> Option<Arc<E>> {
        Arc::clone(&self.value).downcast::<E>().ok()
    }
}

impl fmt::Debug for PublishedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedEvent")
            .field("tag", &self.tag)
            .field("parents", &self.parents)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Changed;

    #[derive(Debug, PartialEq, Eq)]
    struct Renamed {
        name: &'static str,
    }

    impl DomainEvent for Renamed {
        fn parents() -> Vec<EventTag> {
            vec![EventTag::of::<Changed>()]
        }
    }

    #[derive(Debug)]
    struct Unrelated;

    impl DomainEvent for Unrelated {}

    #[test]
    fn tags_compare_by_type_identity() {
        assert_eq!(EventTag::of::<Renamed>(), EventTag::of::<Renamed>());
        assert_ne!(EventTag::of::<Renamed>(), EventTag::of::<Changed>());
    }

    #[test]
    fn published_event_records_tag_and_parents() {
        let published = PublishedEvent::new(Renamed { name: "g1" });
        assert_eq!(published.tag(), EventTag::of::<Renamed>());
        assert_eq!(published.parents(), &[EventTag::of::<Changed>()]);
    }

    #[test]
    fn downcast_recovers_the_concrete_event() {
        let published = PublishedEvent::new(Renamed { name: "g1" });
        let event = published.downcast::<Renamed>().expect("concrete type");
        assert_eq!(*event, Renamed { name: "g1" });
        assert!(published.downcast::<Unrelated>().is_none());
    }
}

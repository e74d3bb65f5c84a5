//! Typed in-process event subscriptions.
//!
//! [`EventSubscriptions`] is the registry through which mutations committed
//! inside a read-write transaction reach their listeners, typically the
//! storage adapter materializing the change. Listeners are registered under
//! the event tag they consume; publication dispatches to every listener
//! whose tag is the event's own tag or one of its declared ancestors.
//!
//! Dispatch is sequential and deterministic: the exact tag's bucket first,
//! then ancestor buckets in the order the event declares them, insertion
//! order within a bucket, and each listener at most once per publication.
//! Listeners run on the publishing task, inside the publishing transaction;
//! a listener error propagates out of [`publish`](EventSubscriptions::publish)
//! and aborts the remaining dispatch.
//!
//! # Concurrency
//!
//! The registry shares an immutable snapshot behind an atomic reference,
//! updated with the same compare-and-swap discipline as the property
//! container. `publish` reads the registry once at entry; subscriptions
//! added afterwards do not affect an in-flight dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::PersistenceError;
use crate::event::{DomainEvent, EventTag, PublishedEvent};

type ListenerFuture = Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send>>;
type Registry = HashMap<EventTag, Vec<Arc<EventListener>>>;

/// A typed handler invoked when a matching event is published.
///
/// Listeners have identity: subscribe, unsubscribe, and the at-most-once
/// dispatch guarantee all compare the `Arc` pointer, never the handler
/// contents.
pub struct EventListener {
    tag: EventTag,
    handler: Box<dyn Fn(PublishedEvent) -> ListenerFuture + Send + Sync>,
}

impl EventListener {
    /// A listener consuming events of exactly the type `E`.
    ///
    /// Events routed to this listener through an ancestor declaration are
    /// skipped with a warning; subscribe an ancestor-tag listener with
    /// [`for_tag`](Self::for_tag) to receive those.
    pub fn for_event<E, F, Fut>(handler: F) -> Arc<Self>
    where
        E: DomainEvent,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PersistenceError>> + Send + 'static,
    {
        Arc::new(Self {
            tag: EventTag::of::<E>(),
            handler: Box::new(move |published| -> ListenerFuture {
                match published.downcast::<E>() {
                    Some(event) => Box::pin(handler(event)),
                    None => {
                        tracing::warn!(
                            listener_tag = %EventTag::of::<E>().name(),
                            event_tag = %published.tag().name(),
                            "typed listener skipping event of a different concrete type"
                        );
                        Box::pin(std::future::ready(Ok(())))
                    }
                }
            }),
        })
    }

    /// A listener consuming every event published under `tag`, receiving the
    /// type-erased [`PublishedEvent`].
    ///
    /// This is the subscription point for event categories: a listener for a
    /// category tag sees all events whose [`DomainEvent::parents`] include
    /// it, and downcasts to the concrete types it understands.
    pub fn for_tag<F, Fut>(tag: EventTag, handler: F) -> Arc<Self>
    where
        F: Fn(PublishedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PersistenceError>> + Send + 'static,
    {
        Arc::new(Self {
            tag,
            handler: Box::new(move |published| -> ListenerFuture { Box::pin(handler(published)) }),
        })
    }

    /// The tag this listener is registered under.
    #[must_use]
    pub fn tag(&self) -> EventTag {
        self.tag
    }
}

/// Type-indexed registry of event listeners.
pub struct EventSubscriptions {
    registry: ArcSwap<Registry>,
}

impl EventSubscriptions {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: ArcSwap::from_pointee(Registry::default()),
        }
    }

    /// Add a listener under its declared tag.
    ///
    /// Subscribing the same listener again is permitted and preserved;
    /// dispatch still invokes it at most once per publication.
    pub fn subscribe(&self, listener: Arc<EventListener>) {
        tracing::debug!(tag = %listener.tag().name(), "listener subscribed");
        self.registry.rcu(|registry| {
            let mut next = Registry::clone(registry);
            next.entry(listener.tag())
                .or_default()
                .push(Arc::clone(&listener));
            next
        });
    }

    /// Remove every entry referring to this listener identity.
    pub fn unsubscribe(&self, listener: &Arc<EventListener>) {
        self.registry.rcu(|registry| {
            let mut next = Registry::clone(registry);
            for bucket in next.values_mut() {
                bucket.retain(|entry| !Arc::ptr_eq(entry, listener));
            }
            next.retain(|_, bucket| !bucket.is_empty());
            next
        });
    }

    /// Clear the registry.
    pub fn unsubscribe_all(&self) {
        self.registry.store(Arc::new(Registry::default()));
    }

    /// Whether this exact listener is currently subscribed.
    #[must_use]
    pub fn is_subscribed(&self, listener: &Arc<EventListener>) -> bool {
        self.registry
            .load()
            .values()
            .any(|bucket| bucket.iter().any(|entry| Arc::ptr_eq(entry, listener)))
    }

    /// Dispatch `event` to every matching listener, sequentially, on the
    /// calling task.
    ///
    /// # Errors
    ///
    /// The first listener error, which aborts the remaining dispatch.
    pub async fn publish(&self, event: PublishedEvent) -> Result<(), PersistenceError> {
        let registry = self.registry.load_full();

        let mut tags = Vec::with_capacity(1 + event.parents().len());
        tags.push(event.tag());
        tags.extend_from_slice(event.parents());

        let mut invoked: Vec<usize> = Vec::new();
        let mut delivered = 0_usize;
        for tag in tags {
            let Some(bucket) = registry.get(&tag) else {
                continue;
            };
            for listener in bucket {
                let identity = Arc::as_ptr(listener) as usize;
                if invoked.contains(&identity) {
                    continue;
                }
                invoked.push(identity);
                tracing::trace!(
                    event_tag = %event.tag().name(),
                    listener_tag = %tag.name(),
                    "dispatching event to listener"
                );
                (listener.handler)(event.clone()).await?;
                delivered += 1;
            }
        }

        tracing::debug!(tag = %event.tag().name(), delivered, "event published");
        Ok(())
    }
}

impl Default for EventSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}

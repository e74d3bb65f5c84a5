//! Persistent property container.
//!
//! This module provides [`PersistentProperties`], the per-aggregate mapping
//! from property name to a value cell. A cell is in one of three shapes:
//!
//! - *resolved* - a directly known value
//! - *unresolved* - a suspending computation that will yield the value
//! - *memoized* - a value cached from a previous resolution, retaining the
//!   computation so the cell can be reset
//!
//! Aggregates seed their container through [`PropertiesBuilder`] and read
//! fields back with [`get`](PersistentProperties::get) (scalars) or
//! [`get_lazy`](PersistentProperties::get_lazy) (related entities loaded
//! through the ambient transaction). The
//! [`persistent_accessors!`](crate::persistent_accessors) macro generates
//! the field-delegate methods.
//!
//! # Concurrency
//!
//! The container shares one immutable snapshot behind an atomic reference.
//! Every write swaps the whole snapshot with a compare-and-swap loop, so the
//! container is lock-free and safe to share across tasks. Lazy resolution is
//! deliberately not serialized: two tasks racing on the first read of the
//! same unresolved cell may both invoke the computation, and the last writer
//! wins the memoized slot. Computations must therefore be side-effect-free
//! with respect to the property itself; their return value is the contract.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::PersistenceError;
use crate::refresh;

type ErasedValue = Arc<dyn Any + Send + Sync>;
type LazyFuture = Pin<Box<dyn Future<Output = Result<PropertyValue, PersistenceError>> + Send>>;

/// A stored value together with the runtime identity captured when it was
/// written.
#[derive(Clone)]
struct PropertyValue {
    value: ErasedValue,
    type_name: &'static str,
    render: fn(&(dyn Any + Send + Sync)) -> String,
}

impl PropertyValue {
    fn new<T: fmt::Debug + Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            render: render_value::<T>,
        }
    }

    fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    fn rendered(&self) -> String {
        (self.render)(self.value.as_ref())
    }
}

fn render_value<T: fmt::Debug + 'static>(value: &(dyn Any + Send + Sync)) -> String {
    value
        .downcast_ref::<T>()
        .map_or_else(|| "<opaque>".to_string(), |value| format!("{value:?}"))
}

/// A lazy computation together with the runtime identity of the value it
/// yields.
#[derive(Clone)]
struct LazyFn {
    compute: Arc<dyn Fn() -> LazyFuture + Send + Sync>,
    type_name: &'static str,
}

impl LazyFn {
    fn new<T, F, Fut>(compute: F) -> Self
    where
        T: fmt::Debug + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PersistenceError>> + Send + 'static,
    {
        Self {
            compute: Arc::new(move || -> LazyFuture {
                let fut = compute();
                Box::pin(async move { fut.await.map(PropertyValue::new) })
            }),
            type_name: std::any::type_name::<T>(),
        }
    }

    fn invoke(&self) -> LazyFuture {
        (self.compute)()
    }
}

/// One entry of the container. The shape never changes for an established
/// name except through the documented transitions: first resolution turns
/// *unresolved* into *memoized*, and a reset turns *memoized* back into
/// *unresolved* with the same computation.
#[derive(Clone)]
enum PropertyCell {
    Resolved(PropertyValue),
    Unresolved(LazyFn),
    Memoized(LazyFn, PropertyValue),
}

/// The immutable snapshot swapped on every write.
#[derive(Clone, Default)]
struct PropertyMap {
    cells: HashMap<String, PropertyCell>,
    debug_order: Vec<String>,
}

/// One entry of [`PersistentProperties::debug_snapshot`].
#[derive(Clone, PartialEq, Eq)]
pub enum DebugValue {
    /// The cell is unresolved; its computation has not been invoked.
    NotYetResolved,
    /// The rendered resolved or memoized value.
    Value(String),
}

impl fmt::Debug for DebugValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotYetResolved => f.write_str("NotYetResolved"),
            Self::Value(rendered) => f.write_str(rendered),
        }
    }
}

/// Thread-safe mapping from property name to value cell.
///
/// See the [module docs](self) for the cell model and concurrency contract.
pub struct PersistentProperties {
    inner: ArcSwap<PropertyMap>,
}

impl PersistentProperties {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(PropertyMap::default()),
        }
    }

    /// Write-replace the cell for `name` with a resolved value.
    pub fn set<T: fmt::Debug + Send + Sync + 'static>(&self, name: impl Into<String>, value: T) {
        let name = name.into();
        let cell = PropertyCell::Resolved(PropertyValue::new(value));
        tracing::trace!(property = %name, "property set");
        self.insert_cell(name, cell);
    }

    /// Write-replace the cell for `name` with an unresolved computation.
    ///
    /// The computation is invoked on the first [`get_lazy`](Self::get_lazy)
    /// read (and again after [`reset_lazy`](Self::reset_lazy) or inside a
    /// [`with_lazy_refresh`](crate::refresh::with_lazy_refresh) scope). It
    /// must tolerate being invoked more than once when first reads race.
    pub fn set_lazy<T, F, Fut>(&self, name: impl Into<String>, compute: F)
    where
        T: fmt::Debug + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PersistenceError>> + Send + 'static,
    {
        let name = name.into();
        let cell = PropertyCell::Unresolved(LazyFn::new(compute));
        tracing::trace!(property = %name, "lazy property set");
        self.insert_cell(name, cell);
    }

    /// Delete the entry for `name`, if any.
    pub fn remove(&self, name: &str) {
        self.inner.rcu(|map| {
            let mut next = PropertyMap::clone(map);
            next.cells.remove(name);
            next
        });
    }

    /// Read a resolved scalar value.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::NoSuchProperty`] when `name` is absent, and
    /// [`PersistenceError::UnexpectedPropertyType`] when the cell holds a
    /// different type or is a lazy cell (use [`get_lazy`](Self::get_lazy)
    /// for those). A failed read never mutates the cell.
    pub fn get<T: Clone + 'static>(&self, name: &str) -> Result<T, PersistenceError> {
        let map = self.inner.load();
        match map.cells.get(name) {
            None => Err(PersistenceError::no_such_property(name)),
            Some(PropertyCell::Resolved(value)) => typed(name, value, false),
            Some(PropertyCell::Unresolved(lazy) | PropertyCell::Memoized(lazy, _)) => {
                Err(PersistenceError::UnexpectedPropertyType {
                    name: name.to_string(),
                    expected: std::any::type_name::<T>(),
                    actual: lazy.type_name,
                    lazy: true,
                })
            }
        }
    }

    /// Read a value, resolving it through its computation if necessary.
    ///
    /// Resolution follows the cell state machine:
    ///
    /// - *unresolved* - invoke the computation, memoize the value, return it
    /// - *memoized* inside a lazy-refresh scope - reset to *unresolved* and
    ///   resolve again
    /// - *memoized* otherwise, and *resolved* - return the stored value
    ///
    /// A computation failure propagates without memoizing anything, so the
    /// next read retries.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::NoSuchProperty`] when `name` is absent,
    /// [`PersistenceError::UnexpectedPropertyType`] on a type mismatch, and
    /// whatever error the computation itself raises.
    pub async fn get_lazy<T: Clone + 'static>(&self, name: &str) -> Result<T, PersistenceError> {
        loop {
            let cell = self
                .inner
                .load()
                .cells
                .get(name)
                .cloned()
                .ok_or_else(|| PersistenceError::no_such_property(name))?;

            match cell {
                PropertyCell::Resolved(value) => return typed(name, &value, false),
                PropertyCell::Memoized(_, value) => {
                    if refresh::is_lazy_refresh_active() {
                        tracing::trace!(property = %name, "lazy refresh active; discarding memoized value");
                        self.reset_lazy(name);
                        continue;
                    }
                    return typed(name, &value, true);
                }
                PropertyCell::Unresolved(lazy) => {
                    let value = lazy.invoke().await?;
                    let result = typed::<T>(name, &value, true)?;
                    // Last writer wins when first reads race.
                    self.insert_cell(name.to_string(), PropertyCell::Memoized(lazy, value));
                    tracing::trace!(property = %name, "lazy property resolved");
                    return Ok(result);
                }
            }
        }
    }

    /// Reset a memoized cell back to its unresolved computation.
    ///
    /// A no-op on resolved or unresolved cells and on absent names.
    pub fn reset_lazy(&self, name: &str) {
        if !matches!(
            self.inner.load().cells.get(name),
            Some(PropertyCell::Memoized(..))
        ) {
            return;
        }
        self.inner.rcu(|map| {
            let mut next = PropertyMap::clone(map);
            if let Some(PropertyCell::Memoized(lazy, _)) = next.cells.get(name) {
                let lazy = lazy.clone();
                next.cells
                    .insert(name.to_string(), PropertyCell::Unresolved(lazy));
            }
            next
        });
        tracing::trace!(property = %name, "lazy property reset");
    }

    /// Replace the current value with `update(current)` if the cell is
    /// resolved or memoized; do nothing if it is unresolved.
    ///
    /// Memoized cells keep their computation, so a later reset still works.
    /// Returns the updated value, or `None` when the cell was unresolved.
    /// `update` may be invoked more than once under write contention.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::NoSuchProperty`] when `name` is absent, and
    /// [`PersistenceError::UnexpectedPropertyType`] when the stored value is
    /// not a `T` (the cell is left untouched).
    pub fn update_if_resolved<T, F>(&self, name: &str, update: F) -> Result<Option<T>, PersistenceError>
    where
        T: Clone + fmt::Debug + Send + Sync + 'static,
        F: Fn(&T) -> T,
    {
        loop {
            let current = self.inner.load_full();
            let cell = current
                .cells
                .get(name)
                .ok_or_else(|| PersistenceError::no_such_property(name))?;

            let (next_cell, updated) = match cell {
                PropertyCell::Unresolved(_) => return Ok(None),
                PropertyCell::Resolved(value) => {
                    let updated = update(typed_ref::<T>(name, value, false)?);
                    (
                        PropertyCell::Resolved(PropertyValue::new(updated.clone())),
                        updated,
                    )
                }
                PropertyCell::Memoized(lazy, value) => {
                    let updated = update(typed_ref::<T>(name, value, true)?);
                    (
                        PropertyCell::Memoized(lazy.clone(), PropertyValue::new(updated.clone())),
                        updated,
                    )
                }
            };

            let mut next = PropertyMap::clone(&current);
            next.cells.insert(name.to_string(), next_cell);
            let previous = self.inner.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return Ok(Some(updated));
            }
        }
    }

    /// An independent container observing the current snapshot.
    ///
    /// Later writes to either instance are invisible to the other.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            inner: ArcSwap::new(self.inner.load_full()),
        }
    }

    /// Record the property order used by [`debug_snapshot`](Self::debug_snapshot).
    pub fn set_debug_property_order<I, S>(&self, order: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Vec<String> = order.into_iter().map(Into::into).collect();
        self.inner.rcu(|map| {
            let mut next = PropertyMap::clone(map);
            next.debug_order = order.clone();
            next
        });
    }

    /// An ordered dump of the container for diagnostics.
    ///
    /// Names follow the configured debug order (absent names skipped), then
    /// any unlisted properties in lexicographic order. Unresolved cells dump
    /// as [`DebugValue::NotYetResolved`]; resolved and memoized cells render
    /// their value through its `Debug` implementation, so a stored aggregate
    /// that formats itself via its own container recurses naturally.
    #[must_use]
    pub fn debug_snapshot(&self) -> Vec<(String, DebugValue)> {
        let map = self.inner.load_full();
        let mut names: Vec<&String> = map
            .debug_order
            .iter()
            .filter(|name| map.cells.contains_key(*name))
            .collect();
        let mut remaining: Vec<&String> = map
            .cells
            .keys()
            .filter(|name| !map.debug_order.contains(*name))
            .collect();
        remaining.sort();
        names.extend(remaining);

        names
            .into_iter()
            .map(|name| {
                let entry = match &map.cells[name] {
                    PropertyCell::Unresolved(_) => DebugValue::NotYetResolved,
                    PropertyCell::Resolved(value) | PropertyCell::Memoized(_, value) => {
                        DebugValue::Value(value.rendered())
                    }
                };
                (name.clone(), entry)
            })
            .collect()
    }

    fn insert_cell(&self, name: String, cell: PropertyCell) {
        self.inner.rcu(|map| {
            let mut next = PropertyMap::clone(map);
            next.cells.insert(name.clone(), cell.clone());
            next
        });
    }
}

impl Default for PersistentProperties {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PersistentProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.debug_snapshot()).finish()
    }
}

fn typed<T: Clone + 'static>(
    name: &str,
    value: &PropertyValue,
    lazy: bool,
) -> Result<T, PersistenceError> {
    typed_ref(name, value, lazy).cloned()
}

fn typed_ref<'v, T: 'static>(
    name: &str,
    value: &'v PropertyValue,
    lazy: bool,
) -> Result<&'v T, PersistenceError> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| PersistenceError::UnexpectedPropertyType {
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
            actual: value.type_name,
            lazy,
        })
}

/// Builder seeding a [`PersistentProperties`] for one aggregate.
///
/// Rejects a name seeded twice, whichever combination of scalar and lazy
/// entries produced the collision.
///
/// ```ignore
/// let props = PropertiesBuilder::for_owner("User")
///     .set("email", record.email.clone())
///     .set_lazy("groups", move || group_ids_for(user_id))
///     .build()?;
/// ```
pub struct PropertiesBuilder {
    owner: &'static str,
    props: PersistentProperties,
    names: Vec<String>,
    duplicate: Option<String>,
}

impl PropertiesBuilder {
    /// Start a builder for the named owning type. The owner appears in
    /// [`PersistenceError::DuplicateProperty`] diagnostics.
    #[must_use]
    pub fn for_owner(owner: &'static str) -> Self {
        Self {
            owner,
            props: PersistentProperties::new(),
            names: Vec::new(),
            duplicate: None,
        }
    }

    /// Seed a resolved scalar property.
    #[must_use]
    pub fn set<T: fmt::Debug + Send + Sync + 'static>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Self {
        let name = name.into();
        self.record(&name);
        self.props.set(name, value);
        self
    }

    /// Seed an unresolved lazy property.
    #[must_use]
    pub fn set_lazy<T, F, Fut>(mut self, name: impl Into<String>, compute: F) -> Self
    where
        T: fmt::Debug + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PersistenceError>> + Send + 'static,
    {
        let name = name.into();
        self.record(&name);
        self.props.set_lazy(name, compute);
        self
    }

    /// Finish the container, recording the seeded names as the debug order.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::DuplicateProperty`] naming the first collision.
    pub fn build(self) -> Result<PersistentProperties, PersistenceError> {
        if let Some(name) = self.duplicate {
            return Err(PersistenceError::DuplicateProperty {
                name,
                owner: self.owner,
            });
        }
        self.props.set_debug_property_order(self.names);
        Ok(self.props)
    }

    fn record(&mut self, name: &str) {
        if self.names.iter().any(|existing| existing == name) {
            self.duplicate.get_or_insert_with(|| name.to_string());
        } else {
            self.names.push(name.to_string());
        }
    }
}

/// Generate field-delegate accessors over an aggregate's property container.
///
/// Scalar fields become `fn name(&self) -> Result<T, PersistenceError>`
/// reading through [`PersistentProperties::get`]; `async fn` entries read
/// through [`PersistentProperties::get_lazy`].
///
/// ```ignore
/// persistent_accessors! {
///     impl User as properties {
///         pub fn email -> String;
///         pub fn status -> UserStatus;
///         pub async fn groups -> Vec<GroupId>;
///     }
/// }
/// ```
#[macro_export]
macro_rules! persistent_accessors {
    (impl $owner:ty as $field:ident { $($items:tt)* }) => {
        impl $owner {
            $crate::persistent_accessors!(@methods $field; $($items)*);
        }
    };
    (@methods $field:ident;) => {};
    (@methods $field:ident; $vis:vis async fn $name:ident -> $ty:ty; $($rest:tt)*) => {
        $vis async fn $name(&self) -> ::core::result::Result<$ty, $crate::error::PersistenceError> {
            self.$field.get_lazy(stringify!($name)).await
        }
        $crate::persistent_accessors!(@methods $field; $($rest)*);
    };
    (@methods $field:ident; $vis:vis fn $name:ident -> $ty:ty; $($rest:tt)*) => {
        $vis fn $name(&self) -> ::core::result::Result<$ty, $crate::error::PersistenceError> {
            self.$field.get(stringify!($name))
        }
        $crate::persistent_accessors!(@methods $field; $($rest)*);
    };
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::refresh::with_lazy_refresh;

    fn counting_lazy(calls: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<Result<i64, PersistenceError>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(7))
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let props = PersistentProperties::new();
        props.set("email", "j@e.com".to_string());
        assert_eq!(props.get::<String>("email").unwrap(), "j@e.com");
    }

    #[test]
    fn get_missing_property_errors() {
        let props = PersistentProperties::new();
        assert!(matches!(
            props.get::<String>("email"),
            Err(PersistenceError::NoSuchProperty { .. })
        ));
    }

    #[test]
    fn get_with_wrong_type_errors_and_preserves_the_cell() {
        let props = PersistentProperties::new();
        props.set("count", 3_i64);
        assert!(matches!(
            props.get::<String>("count"),
            Err(PersistenceError::UnexpectedPropertyType { lazy: false, .. })
        ));
        assert_eq!(props.get::<i64>("count").unwrap(), 3);
    }

    #[test]
    fn get_on_a_lazy_cell_is_flagged_as_lazy() {
        let props = PersistentProperties::new();
        props.set_lazy("count", || std::future::ready(Ok(3_i64)));
        assert!(matches!(
            props.get::<i64>("count"),
            Err(PersistenceError::UnexpectedPropertyType { lazy: true, .. })
        ));
    }

    #[test]
    fn unresolved_cell_dumps_as_the_sentinel() {
        let props = PersistentProperties::new();
        props.set_lazy("groups", || std::future::ready(Ok(Vec::<i64>::new())));
        assert_eq!(
            props.debug_snapshot(),
            vec![("groups".to_string(), DebugValue::NotYetResolved)]
        );
    }

    #[tokio::test]
    async fn lazy_resolution_invokes_the_computation_exactly_once() {
        let props = PersistentProperties::new();
        let calls = Arc::new(AtomicUsize::new(0));
        props.set_lazy("count", counting_lazy(&calls));

        assert_eq!(props.get_lazy::<i64>("count").await.unwrap(), 7);
        assert_eq!(props.get_lazy::<i64>("count").await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_lazy_forces_reinvocation() {
        let props = PersistentProperties::new();
        let calls = Arc::new(AtomicUsize::new(0));
        props.set_lazy("count", counting_lazy(&calls));

        props.get_lazy::<i64>("count").await.unwrap();
        props.reset_lazy("count");
        assert_eq!(
            props.debug_snapshot(),
            vec![("count".to_string(), DebugValue::NotYetResolved)]
        );
        props.get_lazy::<i64>("count").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reset_lazy_is_a_no_op_on_resolved_and_unresolved_cells() {
        let props = PersistentProperties::new();
        let calls = Arc::new(AtomicUsize::new(0));
        props.set("name", "g1".to_string());
        props.set_lazy("count", counting_lazy(&calls));

        props.reset_lazy("name");
        props.reset_lazy("count");
        props.reset_lazy("missing");

        assert_eq!(props.get::<String>("name").unwrap(), "g1");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lazy_refresh_scope_discards_the_memoized_value() {
        let props = PersistentProperties::new();
        let calls = Arc::new(AtomicUsize::new(0));
        props.set_lazy("count", counting_lazy(&calls));

        props.get_lazy::<i64>("count").await.unwrap();
        with_lazy_refresh(async {
            props.get_lazy::<i64>("count").await.unwrap();
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Outside the scope the refreshed value is memoized again.
        props.get_lazy::<i64>("count").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_computation_is_not_memoized() {
        let props = PersistentProperties::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        props.set_lazy("count", move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if attempt == 0 {
                Err(PersistenceError::CurrentTransactionUnavailable)
            } else {
                Ok(7_i64)
            })
        });

        assert!(matches!(
            props.get_lazy::<i64>("count").await,
            Err(PersistenceError::CurrentTransactionUnavailable)
        ));
        assert_eq!(props.get_lazy::<i64>("count").await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn update_if_resolved_updates_without_reinvoking_the_computation() {
        let props = PersistentProperties::new();
        let calls = Arc::new(AtomicUsize::new(0));
        props.set("total", 10_i64);
        props.set_lazy("count", counting_lazy(&calls));
        props.get_lazy::<i64>("count").await.unwrap();

        assert_eq!(
            props.update_if_resolved("total", |v: &i64| v + 1).unwrap(),
            Some(11)
        );
        assert_eq!(
            props.update_if_resolved("count", |v: &i64| v * 2).unwrap(),
            Some(14)
        );
        assert_eq!(props.get_lazy::<i64>("count").await.unwrap(), 14);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_if_resolved_is_a_no_op_on_unresolved_cells() {
        let props = PersistentProperties::new();
        props.set_lazy("count", || std::future::ready(Ok(7_i64)));
        assert_eq!(
            props.update_if_resolved("count", |v: &i64| v + 1).unwrap(),
            None
        );
        assert_eq!(
            props.debug_snapshot(),
            vec![("count".to_string(), DebugValue::NotYetResolved)]
        );
    }

    #[test]
    fn update_if_resolved_with_wrong_type_errors_without_mutating() {
        let props = PersistentProperties::new();
        props.set("total", 10_i64);
        assert!(matches!(
            props.update_if_resolved("total", |v: &String| v.clone()),
            Err(PersistenceError::UnexpectedPropertyType { .. })
        ));
        assert_eq!(props.get::<i64>("total").unwrap(), 10);
    }

    #[test]
    fn copies_diverge_independently() {
        let original = PersistentProperties::new();
        original.set("name", "before".to_string());

        let copy = original.copy();
        copy.set("name", "copied".to_string());
        original.set("extra", 1_i64);

        assert_eq!(original.get::<String>("name").unwrap(), "before");
        assert_eq!(copy.get::<String>("name").unwrap(), "copied");
        assert!(matches!(
            copy.get::<i64>("extra"),
            Err(PersistenceError::NoSuchProperty { .. })
        ));
    }

    #[test]
    fn remove_deletes_the_entry() {
        let props = PersistentProperties::new();
        props.set("name", "g1".to_string());
        props.remove("name");
        assert!(matches!(
            props.get::<String>("name"),
            Err(PersistenceError::NoSuchProperty { .. })
        ));
    }

    #[test]
    fn debug_snapshot_follows_the_configured_order_then_sorts_the_rest() {
        let props = PersistentProperties::new();
        props.set("b", 2_i64);
        props.set("a", 1_i64);
        props.set("c", 3_i64);
        props.set_debug_property_order(["c", "missing", "a"]);

        let names: Vec<String> = props
            .debug_snapshot()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn debug_format_renders_values_in_place() {
        let props = PersistentProperties::new();
        props.set("name", "g1".to_string());
        props.set_lazy("members", || std::future::ready(Ok(Vec::<i64>::new())));
        props.set_debug_property_order(["name", "members"]);

        let dump = format!("{props:?}");
        assert_eq!(dump, r#"{"name": "g1", "members": NotYetResolved}"#);
    }

    #[test]
    fn builder_rejects_duplicate_names() {
        let result = PropertiesBuilder::for_owner("User")
            .set("email", "j@e.com".to_string())
            .set_lazy("email", || std::future::ready(Ok(1_i64)))
            .build();
        assert!(matches!(
            result,
            Err(PersistenceError::DuplicateProperty { ref name, owner: "User" }) if name == "email"
        ));
    }

    #[test]
    fn builder_records_the_seeding_order_for_debugging() {
        let props = PropertiesBuilder::for_owner("Group")
            .set("name", "g1".to_string())
            .set("zone", "z1".to_string())
            .set_lazy("members", || std::future::ready(Ok(Vec::<i64>::new())))
            .build()
            .unwrap();

        let names: Vec<String> = props
            .debug_snapshot()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["name", "zone", "members"]);
    }

    struct Holder {
        properties: PersistentProperties,
    }

    crate::persistent_accessors! {
        impl Holder as properties {
            fn label -> String;
            async fn size -> i64;
        }
    }

    #[tokio::test]
    async fn generated_accessors_delegate_to_the_container() {
        let properties = PersistentProperties::new();
        properties.set("label", "ready".to_string());
        properties.set_lazy("size", || std::future::ready(Ok(3_i64)));

        let holder = Holder { properties };
        assert_eq!(holder.label().unwrap(), "ready");
        assert_eq!(holder.size().await.unwrap(), 3);
    }
}

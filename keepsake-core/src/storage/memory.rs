//! In-memory storage adapter.
//!
//! [`MemoryStorage`] is a reference [`Storage`] implementation suitable for
//! tests and examples. It keeps the domain state as an immutable snapshot of
//! a caller-supplied type `D` and serializes transactions with one
//! process-wide mutex, which trivially gives single-writer, linearizable
//! semantics: every transaction observes the snapshot committed by the most
//! recent preceding read-write transaction.
//!
//! A transaction accumulates its writes into a private snapshot
//! (copy-on-write through [`MemoryDatabase::update`]); commit publishes that
//! snapshot to the storage and unlocks. The handle holds the mutex as an
//! owned guard, so a transaction dropped on a cancelled task still unlocks
//! the storage.

use std::future::Future;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::OwnedMutexGuard;

use crate::error::PersistenceError;
use crate::storage::{Storage, TransactionMode, TransactionalDatabase};

/// Storage keeping the committed domain state in memory.
///
/// `D` is the domain snapshot type: cheap to clone, with `D::default()` as
/// the empty state. Clones of the storage share the same state.
#[derive(Clone)]
pub struct MemoryStorage<D> {
    inner: Arc<Inner<D>>,
}

struct Inner<D> {
    current: ArcSwap<D>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<D> MemoryStorage<D>
where
    D: Clone + Default + Send + Sync + 'static,
{
    /// Create a storage holding the empty domain state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                current: ArcSwap::from_pointee(D::default()),
                lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// The current committed snapshot.
    #[must_use]
    pub fn current_database(&self) -> Arc<D> {
        self.inner.current.load_full()
    }

    /// Replace the committed snapshot with the empty state.
    ///
    /// Takes the storage mutex, so a reset waits for the active transaction
    /// to finish rather than tearing state out from under it.
    pub async fn reset(&self) {
        let _guard = self.inner.lock.lock().await;
        self.inner.current.store(Arc::new(D::default()));
        tracing::debug!("in-memory storage reset");
    }
}

impl<D> Default for MemoryStorage<D>
where
    D: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Storage for MemoryStorage<D>
where
    D: Clone + Default + Send + Sync + 'static,
{
    type Database = MemoryDatabase<D>;

    #[tracing::instrument(skip(self))]
    fn transactional_database(
        &self,
        mode: TransactionMode,
    ) -> impl Future<Output = Result<Self::Database, PersistenceError>> + Send {
        let storage = self.clone();
        async move {
            let guard = Arc::clone(&storage.inner.lock).lock_owned().await;
            tracing::trace!("storage mutex acquired");
            Ok(MemoryDatabase {
                snapshot: Arc::new(ArcSwap::new(storage.inner.current.load_full())),
                guard: Arc::new(Mutex::new(Some(guard))),
                mode,
                storage,
            })
        }
    }
}

/// Transactional handle over an in-memory snapshot.
///
/// Clones share the same transaction: the same working snapshot and the same
/// mutex guard.
#[derive(Clone)]
pub struct MemoryDatabase<D> {
    storage: MemoryStorage<D>,
    mode: TransactionMode,
    snapshot: Arc<ArcSwap<D>>,
    guard: Arc<Mutex<Option<OwnedMutexGuard<()>>>>,
}

impl<D> MemoryDatabase<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// The transaction's current view of the domain state.
    #[must_use]
    pub fn database(&self) -> Arc<D> {
        self.snapshot.load_full()
    }

    /// Replace the transaction's snapshot with `update(current)`.
    ///
    /// `update` may be invoked more than once under contention, though the
    /// storage mutex means contention only arises between clones of one
    /// handle.
    pub fn update(&self, update: impl Fn(&D) -> D) {
        self.snapshot.rcu(|current| update(current));
    }

    fn unlock(&self) {
        self.guard
            .lock()
            .expect("in-memory guard lock poisoned")
            .take();
    }
}

impl<D> TransactionalDatabase for MemoryDatabase<D>
where
    D: Clone + Default + Send + Sync + 'static,
{
    #[tracing::instrument(skip(self))]
    fn commit(&self) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        if self.mode == TransactionMode::ReadWrite {
            let snapshot = self.snapshot.load_full();
            // CAS kept for uniformity with the other snapshot swaps; the
            // storage mutex leaves it uncontended.
            self.storage
                .inner
                .current
                .rcu(|_| Arc::clone(&snapshot));
            tracing::debug!("transaction snapshot published");
        }
        self.unlock();
        std::future::ready(Ok(()))
    }

    #[tracing::instrument(skip(self))]
    fn rollback(&self) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        self.unlock();
        tracing::debug!("transaction snapshot discarded");
        std::future::ready(Ok(()))
    }

    fn release(&self) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        self.unlock();
        std::future::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    type Names = BTreeMap<u32, String>;

    #[tokio::test]
    async fn commit_publishes_the_transaction_snapshot() {
        let storage: MemoryStorage<Names> = MemoryStorage::new();
        let db = storage
            .transactional_database(TransactionMode::ReadWrite)
            .await
            .unwrap();

        db.update(|names| {
            let mut next = names.clone();
            next.insert(1, "g1".to_string());
            next
        });
        assert!(storage.current_database().is_empty());

        db.commit().await.unwrap();
        assert_eq!(storage.current_database().get(&1).map(String::as_str), Some("g1"));
    }

    #[tokio::test]
    async fn rollback_discards_the_transaction_snapshot() {
        let storage: MemoryStorage<Names> = MemoryStorage::new();
        let db = storage
            .transactional_database(TransactionMode::ReadWrite)
            .await
            .unwrap();

        db.update(|names| {
            let mut next = names.clone();
            next.insert(1, "g1".to_string());
            next
        });
        db.rollback().await.unwrap();

        assert!(storage.current_database().is_empty());
    }

    #[tokio::test]
    async fn read_only_commit_does_not_publish() {
        let storage: MemoryStorage<Names> = MemoryStorage::new();
        let db = storage
            .transactional_database(TransactionMode::ReadOnly)
            .await
            .unwrap();

        db.update(|names| {
            let mut next = names.clone();
            next.insert(1, "oops".to_string());
            next
        });
        db.commit().await.unwrap();

        assert!(storage.current_database().is_empty());
    }

    #[tokio::test]
    async fn the_mutex_serializes_transactions() {
        let storage: MemoryStorage<Names> = MemoryStorage::new();
        let first = storage
            .transactional_database(TransactionMode::ReadWrite)
            .await
            .unwrap();

        let waiting = {
            let storage = storage.clone();
            tokio::spawn(async move {
                storage
                    .transactional_database(TransactionMode::ReadOnly)
                    .await
                    .unwrap()
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        first.commit().await.unwrap();
        let second = waiting.await.expect("waiting transaction panicked");
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let storage: MemoryStorage<Names> = MemoryStorage::new();
        let db = storage
            .transactional_database(TransactionMode::ReadWrite)
            .await
            .unwrap();

        db.release().await.unwrap();
        db.release().await.unwrap();

        // The mutex is free again.
        let next = storage
            .transactional_database(TransactionMode::ReadOnly)
            .await
            .unwrap();
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_an_unfinalized_handle_unlocks_the_storage() {
        let storage: MemoryStorage<Names> = MemoryStorage::new();
        {
            let _db = storage
                .transactional_database(TransactionMode::ReadWrite)
                .await
                .unwrap();
        }
        let next = storage
            .transactional_database(TransactionMode::ReadOnly)
            .await
            .unwrap();
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn reset_restores_the_empty_state() {
        let storage: MemoryStorage<Names> = MemoryStorage::new();
        let db = storage
            .transactional_database(TransactionMode::ReadWrite)
            .await
            .unwrap();
        db.update(|names| {
            let mut next = names.clone();
            next.insert(1, "g1".to_string());
            next
        });
        db.commit().await.unwrap();

        storage.reset().await;
        assert!(storage.current_database().is_empty());
    }
}

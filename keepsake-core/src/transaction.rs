//! Transactions, the ambient transaction context, and the manager.
//!
//! [`TransactionManager`] mints read-only and read-write transactions bound
//! to a concrete [`Storage`] adapter and runs caller blocks inside them:
//! commit on success, rollback on failure, release on every exit path, and,
//! for read-write blocks, automatic retry when the block raises
//! [`PersistenceError::TransactionRetry`].
//!
//! While a `with_…_transaction` block runs, its transaction occupies a
//! task-local slot. Repositories reach it from anywhere inside the block
//! through [`current_transaction`] (usually via the [`TransactionAware`]
//! mixin), and mutation helpers through
//! [`with_current_read_write_transaction`]. The slot propagates across
//! suspension points and is restored when the block exits.
//!
//! Transaction lifecycle: *open* → (*committed* | *rolled back*) →
//! *released*, with `release` idempotent. Finalizing an already finalized
//! transaction warns and no-ops rather than failing, so cleanup paths can be
//! unconditional.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::error::PersistenceError;
use crate::event::{DomainEvent, PublishedEvent};
use crate::storage::{Storage, TransactionMode, TransactionalDatabase};
use crate::subscription::EventSubscriptions;

/// Default retry budget for [`TransactionManager::with_read_write_transaction`].
pub const DEFAULT_RETRIES: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
    Released,
}

struct Lifecycle {
    state: Mutex<TxState>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: Mutex::new(TxState::Open),
        }
    }

    fn current(&self) -> TxState {
        *self.state.lock().expect("transaction state lock poisoned")
    }

    fn is_open(&self) -> bool {
        self.current() == TxState::Open
    }

    fn mark(&self, state: TxState) {
        *self.state.lock().expect("transaction state lock poisoned") = state;
    }

    /// Claim the release step. Returns `false` when already released.
    fn claim_release(&self) -> bool {
        let mut state = self.state.lock().expect("transaction state lock poisoned");
        if *state == TxState::Released {
            return false;
        }
        *state = TxState::Released;
        true
    }
}

/// Handle plus lifecycle shared by both transaction variants.
struct TxInner<Db> {
    db: Db,
    lifecycle: Lifecycle,
}

impl<Db: TransactionalDatabase> TxInner<Db> {
    fn new(db: Db) -> Self {
        Self {
            db,
            lifecycle: Lifecycle::new(),
        }
    }

    async fn commit(&self) -> Result<(), PersistenceError> {
        if !self.lifecycle.is_open() {
            tracing::warn!(state = ?self.lifecycle.current(), "commit on a finalized transaction ignored");
            return Ok(());
        }
        self.db.commit().await?;
        self.lifecycle.mark(TxState::Committed);
        tracing::debug!("transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PersistenceError> {
        if !self.lifecycle.is_open() {
            tracing::warn!(state = ?self.lifecycle.current(), "rollback on a finalized transaction ignored");
            return Ok(());
        }
        self.db.rollback().await?;
        self.lifecycle.mark(TxState::RolledBack);
        tracing::debug!("transaction rolled back");
        Ok(())
    }

    async fn release(&self) -> Result<(), PersistenceError> {
        if !self.lifecycle.claim_release() {
            return Ok(());
        }
        self.db.release().await
    }
}

impl<Db> Drop for TxInner<Db> {
    fn drop(&mut self) {
        if self.lifecycle.current() == TxState::Open {
            tracing::warn!("transaction dropped while open; the handle cleans up on drop");
        }
    }
}

/// A transaction with an isolated read view.
pub struct ReadOnlyTransaction<Db> {
    inner: TxInner<Db>,
}

impl<Db: TransactionalDatabase> ReadOnlyTransaction<Db> {
    fn new(db: Db) -> Self {
        Self {
            inner: TxInner::new(db),
        }
    }

    /// The adapter handle this transaction is bound to.
    #[must_use]
    pub fn database(&self) -> &Db {
        &self.inner.db
    }

    /// Finalize the transaction.
    ///
    /// # Errors
    ///
    /// Forwards the handle's commit failure; the transaction stays open so
    /// it can still be rolled back.
    pub async fn commit(&self) -> Result<(), PersistenceError> {
        self.inner.commit().await
    }

    /// Discard the transaction.
    ///
    /// # Errors
    ///
    /// Forwards the handle's rollback failure.
    pub async fn rollback(&self) -> Result<(), PersistenceError> {
        self.inner.rollback().await
    }

    /// Idempotent final cleanup.
    ///
    /// # Errors
    ///
    /// Forwards the handle's release failure.
    pub async fn release(&self) -> Result<(), PersistenceError> {
        self.inner.release().await
    }
}

/// A transaction with a serializable write view.
///
/// Mutations publish their domain events through [`notify`](Self::notify);
/// subscribed listeners run inside this transaction, before `notify`
/// returns.
pub struct ReadWriteTransaction<Db> {
    inner: TxInner<Db>,
    subscriptions: Arc<EventSubscriptions>,
}

impl<Db: TransactionalDatabase> ReadWriteTransaction<Db> {
    fn new(db: Db, subscriptions: Arc<EventSubscriptions>) -> Self {
        Self {
            inner: TxInner::new(db),
            subscriptions,
        }
    }

    /// The adapter handle this transaction is bound to.
    #[must_use]
    pub fn database(&self) -> &Db {
        &self.inner.db
    }

    /// Publish `event` to every subscribed listener, sequentially, within
    /// this transaction.
    ///
    /// # Errors
    ///
    /// The first listener error, unchanged. A listener may raise
    /// [`PersistenceError::TransactionRetry`] to ask the enclosing
    /// [`with_read_write_transaction`](TransactionManager::with_read_write_transaction)
    /// to start the block over on a fresh transaction.
    pub async fn notify<E: DomainEvent>(&self, event: E) -> Result<(), PersistenceError> {
        self.subscriptions.publish(PublishedEvent::new(event)).await
    }

    /// Finalize the transaction.
    ///
    /// # Errors
    ///
    /// Forwards the handle's commit failure; the transaction stays open so
    /// it can still be rolled back.
    pub async fn commit(&self) -> Result<(), PersistenceError> {
        self.inner.commit().await
    }

    /// Discard the transaction.
    ///
    /// # Errors
    ///
    /// Forwards the handle's rollback failure.
    pub async fn rollback(&self) -> Result<(), PersistenceError> {
        self.inner.rollback().await
    }

    /// Idempotent final cleanup.
    ///
    /// # Errors
    ///
    /// Forwards the handle's release failure.
    pub async fn release(&self) -> Result<(), PersistenceError> {
        self.inner.release().await
    }
}

/// The ambient transaction as seen through [`current_transaction`].
pub enum Transaction<Db> {
    ReadOnly(Arc<ReadOnlyTransaction<Db>>),
    ReadWrite(Arc<ReadWriteTransaction<Db>>),
}

impl<Db> Clone for Transaction<Db> {
    fn clone(&self) -> Self {
        match self {
            Self::ReadOnly(tx) => Self::ReadOnly(Arc::clone(tx)),
            Self::ReadWrite(tx) => Self::ReadWrite(Arc::clone(tx)),
        }
    }
}

impl<Db: TransactionalDatabase> Transaction<Db> {
    /// The adapter handle of either variant.
    #[must_use]
    pub fn database(&self) -> &Db {
        match self {
            Self::ReadOnly(tx) => tx.database(),
            Self::ReadWrite(tx) => tx.database(),
        }
    }

    /// Whether this is the read-only or read-write variant.
    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        match self {
            Self::ReadOnly(_) => TransactionMode::ReadOnly,
            Self::ReadWrite(_) => TransactionMode::ReadWrite,
        }
    }

    /// The read-write variant, or [`PersistenceError::ReadWriteTransactionRequired`].
    ///
    /// # Errors
    ///
    /// When this transaction is read-only.
    pub fn read_write(&self) -> Result<Arc<ReadWriteTransaction<Db>>, PersistenceError> {
        match self {
            Self::ReadOnly(_) => Err(PersistenceError::ReadWriteTransactionRequired),
            Self::ReadWrite(tx) => Ok(Arc::clone(tx)),
        }
    }
}

#[derive(Clone)]
struct AmbientTransaction {
    mode: TransactionMode,
    tx: Arc<dyn Any + Send + Sync>,
}

tokio::task_local! {
    static CURRENT_TRANSACTION: AmbientTransaction;
}

/// Whether the current task is inside a `with_…_transaction` block.
#[must_use]
pub fn transaction_is_active() -> bool {
    CURRENT_TRANSACTION.try_with(|_| ()).is_ok()
}

/// The transaction bound to the current task, downcast to the adapter handle
/// type `Db`.
///
/// # Errors
///
/// [`PersistenceError::CurrentTransactionUnavailable`] when no transaction
/// occupies the ambient slot, or when the occupying transaction belongs to a
/// different adapter.
pub fn current_transaction<Db: TransactionalDatabase>() -> Result<Transaction<Db>, PersistenceError>
{
    let ambient = CURRENT_TRANSACTION
        .try_with(Clone::clone)
        .map_err(|_| PersistenceError::CurrentTransactionUnavailable)?;
    ambient
        .tx
        .downcast_ref::<Transaction<Db>>()
        .cloned()
        .ok_or(PersistenceError::CurrentTransactionUnavailable)
}

/// The read-write transaction bound to the current task.
///
/// # Errors
///
/// [`PersistenceError::CurrentTransactionUnavailable`] when the slot is
/// empty or foreign, [`PersistenceError::ReadWriteTransactionRequired`] when
/// the ambient transaction is read-only.
pub fn current_read_write_transaction<Db: TransactionalDatabase>()
-> Result<Arc<ReadWriteTransaction<Db>>, PersistenceError> {
    let ambient = CURRENT_TRANSACTION
        .try_with(Clone::clone)
        .map_err(|_| PersistenceError::CurrentTransactionUnavailable)?;
    if ambient.mode == TransactionMode::ReadOnly {
        return Err(PersistenceError::ReadWriteTransactionRequired);
    }
    ambient
        .tx
        .downcast_ref::<Transaction<Db>>()
        .cloned()
        .ok_or(PersistenceError::CurrentTransactionUnavailable)?
        .read_write()
}

/// Run `block` against the ambient read-write transaction.
///
/// This is the building block for aggregate mutation helpers: update the
/// property container, then publish the domain events through the handed-in
/// transaction.
///
/// # Errors
///
/// The ambient-lookup errors of [`current_read_write_transaction`], or
/// whatever `block` returns.
pub async fn with_current_read_write_transaction<Db, F, Fut, R>(
    block: F,
) -> Result<R, PersistenceError>
where
    Db: TransactionalDatabase,
    F: FnOnce(Arc<ReadWriteTransaction<Db>>) -> Fut,
    Fut: Future<Output = Result<R, PersistenceError>>,
{
    let tx = current_read_write_transaction::<Db>()?;
    block(tx).await
}

/// Capability mixin by which repositories reach the ambient transaction.
///
/// Implementors pick the adapter handle type once; the provided methods
/// resolve the ambient slot against it.
///
/// ```ignore
/// struct UserRepository;
///
/// impl TransactionAware for UserRepository {
///     type Database = MemoryDatabase<Database>;
/// }
///
/// let db = UserRepository.current_database()?;
/// ```
pub trait TransactionAware {
    /// The adapter handle type this repository is coupled to.
    type Database: TransactionalDatabase + Clone;

    /// The ambient transaction, downcast to [`Self::Database`].
    ///
    /// # Errors
    ///
    /// See [`current_transaction`].
    fn current_transaction(&self) -> Result<Transaction<Self::Database>, PersistenceError> {
        current_transaction()
    }

    /// The ambient transaction's adapter handle.
    ///
    /// # Errors
    ///
    /// See [`current_transaction`].
    fn current_database(&self) -> Result<Self::Database, PersistenceError> {
        Ok(self.current_transaction()?.database().clone())
    }
}

/// Factory for transactions bound to one storage adapter, with the
/// `with_…_transaction` control-flow helpers.
pub struct TransactionManager<S: Storage> {
    storage: S,
    subscriptions: Arc<EventSubscriptions>,
}

impl<S: Storage> TransactionManager<S> {
    /// Create a manager with its own empty subscription registry.
    pub fn new(storage: S) -> Self {
        Self::with_subscriptions(storage, Arc::new(EventSubscriptions::new()))
    }

    /// Create a manager sharing an existing subscription registry.
    pub fn with_subscriptions(storage: S, subscriptions: Arc<EventSubscriptions>) -> Self {
        Self {
            storage,
            subscriptions,
        }
    }

    /// The registry read-write transactions publish through.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<EventSubscriptions> {
        &self.subscriptions
    }

    /// The storage this manager mints transactions against.
    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Acquire resources and begin an isolated read view.
    ///
    /// Most callers want [`with_read_only_transaction`](Self::with_read_only_transaction),
    /// which also installs the ambient context and drives the lifecycle.
    ///
    /// # Errors
    ///
    /// Forwards the adapter's acquisition failure.
    pub async fn new_read_only_transaction(
        &self,
    ) -> Result<ReadOnlyTransaction<S::Database>, PersistenceError> {
        let db = self
            .storage
            .transactional_database(TransactionMode::ReadOnly)
            .await?;
        Ok(ReadOnlyTransaction::new(db))
    }

    /// Acquire resources and begin a serializable write view.
    ///
    /// # Errors
    ///
    /// Forwards the adapter's acquisition failure.
    pub async fn new_read_write_transaction(
        &self,
    ) -> Result<ReadWriteTransaction<S::Database>, PersistenceError> {
        let db = self
            .storage
            .transactional_database(TransactionMode::ReadWrite)
            .await?;
        Ok(ReadWriteTransaction::new(
            db,
            Arc::clone(&self.subscriptions),
        ))
    }

    /// Run `block` inside a read-only transaction.
    ///
    /// The transaction occupies the ambient slot for the block's dynamic
    /// extent. On success the transaction commits and the block's value is
    /// returned; on failure it rolls back and the error is rethrown;
    /// `release` runs exactly once on every path, with its own failures
    /// logged and suppressed.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::ConcurrentTransaction`] when the ambient slot is
    /// already occupied, otherwise the block's or the commit's error.
    pub async fn with_read_only_transaction<F, Fut, R>(
        &self,
        block: F,
    ) -> Result<R, PersistenceError>
    where
        F: FnOnce(Arc<ReadOnlyTransaction<S::Database>>) -> Fut,
        Fut: Future<Output = Result<R, PersistenceError>>,
    {
        if transaction_is_active() {
            return Err(PersistenceError::ConcurrentTransaction);
        }
        let tx = Arc::new(self.new_read_only_transaction().await?);
        let ambient = AmbientTransaction {
            mode: TransactionMode::ReadOnly,
            tx: Arc::new(Transaction::ReadOnly(Arc::clone(&tx))),
        };
        tracing::debug!("read-only transaction opened");

        let outcome = CURRENT_TRANSACTION
            .scope(ambient, block(Arc::clone(&tx)))
            .await;
        let outcome = match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(commit_err) => {
                    rollback_quietly(tx.rollback().await);
                    Err(commit_err)
                }
            },
            Err(block_err) => {
                rollback_quietly(tx.rollback().await);
                Err(block_err)
            }
        };
        release_quietly(tx.release().await);
        outcome
    }

    /// Run `block` inside a read-write transaction with the default retry
    /// budget of [`DEFAULT_RETRIES`].
    ///
    /// # Errors
    ///
    /// See [`with_read_write_transaction_retries`](Self::with_read_write_transaction_retries).
    pub async fn with_read_write_transaction<F, Fut, R>(
        &self,
        block: F,
    ) -> Result<R, PersistenceError>
    where
        F: Fn(Arc<ReadWriteTransaction<S::Database>>) -> Fut,
        Fut: Future<Output = Result<R, PersistenceError>>,
    {
        self.with_read_write_transaction_retries(DEFAULT_RETRIES, block)
            .await
    }

    /// Run `block` inside a read-write transaction, reopening a fresh
    /// transaction and re-running the block each time it raises
    /// [`PersistenceError::TransactionRetry`], up to `retries` times.
    ///
    /// The block runs at most `retries + 1` times. Each attempt gets the
    /// full commit/rollback/release treatment of
    /// [`with_read_only_transaction`](Self::with_read_only_transaction).
    ///
    /// # Errors
    ///
    /// [`PersistenceError::ConcurrentTransaction`] when the ambient slot is
    /// already occupied; the retry cause when the budget is exhausted;
    /// otherwise the block's or the commit's error.
    pub async fn with_read_write_transaction_retries<F, Fut, R>(
        &self,
        retries: u32,
        block: F,
    ) -> Result<R, PersistenceError>
    where
        F: Fn(Arc<ReadWriteTransaction<S::Database>>) -> Fut,
        Fut: Future<Output = Result<R, PersistenceError>>,
    {
        let mut remaining = retries;
        loop {
            match self.read_write_attempt(&block).await {
                Err(PersistenceError::TransactionRetry { cause }) => {
                    if remaining == 0 {
                        tracing::debug!("retry budget exhausted; rethrowing the cause");
                        return Err(*cause);
                    }
                    remaining -= 1;
                    tracing::debug!(remaining, "transaction requested retry; reopening");
                }
                outcome => return outcome,
            }
        }
    }

    async fn read_write_attempt<F, Fut, R>(&self, block: &F) -> Result<R, PersistenceError>
    where
        F: Fn(Arc<ReadWriteTransaction<S::Database>>) -> Fut,
        Fut: Future<Output = Result<R, PersistenceError>>,
    {
        if transaction_is_active() {
            return Err(PersistenceError::ConcurrentTransaction);
        }
        let tx = Arc::new(self.new_read_write_transaction().await?);
        let ambient = AmbientTransaction {
            mode: TransactionMode::ReadWrite,
            tx: Arc::new(Transaction::ReadWrite(Arc::clone(&tx))),
        };
        tracing::debug!("read-write transaction opened");

        let outcome = CURRENT_TRANSACTION
            .scope(ambient, block(Arc::clone(&tx)))
            .await;
        let outcome = match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(commit_err) => {
                    rollback_quietly(tx.rollback().await);
                    Err(commit_err)
                }
            },
            Err(block_err) => {
                rollback_quietly(tx.rollback().await);
                Err(block_err)
            }
        };
        release_quietly(tx.release().await);
        outcome
    }
}

/// A rollback failure must not mask the error that triggered it.
fn rollback_quietly(result: Result<(), PersistenceError>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "suppressing rollback failure");
    }
}

/// A release failure must never mask an in-flight error.
fn release_quietly(result: Result<(), PersistenceError>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "suppressing release failure");
    }
}

//! Storage layer abstractions.
//!
//! The core is coupled to storage through two small traits: a
//! [`TransactionalDatabase`] handle whose lifecycle responds to
//! commit/rollback/release, and a [`Storage`] that mints such handles.
//! Repositories are coupled to concrete adapters; the transaction layer only
//! assumes the handle exists and forwards its lifecycle calls.
//!
//! [`memory`] provides the reference in-memory adapter.

use std::future::Future;

use crate::error::PersistenceError;

pub mod memory;

/// Whether a transaction may mutate the store.
///
/// Adapters receive the mode when minting a handle so they can configure the
/// underlying resource (a SQL adapter would set the connection's read-only
/// flag; the in-memory adapter decides whether commit publishes a snapshot).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Transactional handle minted by a [`Storage`] adapter.
///
/// The handle is opaque to the core: repositories downcast the ambient
/// transaction to the concrete handle type to reach their connection or
/// snapshot. Lifecycle calls arrive at most once each from the transaction
/// layer, except `release`, which must be idempotent.
pub trait TransactionalDatabase: Send + Sync + 'static {
    /// Finalize the transaction, making its effects visible.
    fn commit(&self) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Discard the transaction's effects.
    fn rollback(&self) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Final cleanup: close the connection or unlock the storage if still
    /// held. Must tolerate being invoked on an already-finalized handle.
    fn release(&self) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

/// A store that mints transactional database handles.
pub trait Storage: Send + Sync {
    /// The concrete handle type repositories work against.
    type Database: TransactionalDatabase + Clone;

    /// Acquire the resources for one transaction and return its handle.
    ///
    /// May suspend on the adapter's coordination primitive (the in-memory
    /// storage mutex, a connection pool, a remote handshake).
    fn transactional_database(
        &self,
        mode: TransactionMode,
    ) -> impl Future<Output = Result<Self::Database, PersistenceError>> + Send;
}

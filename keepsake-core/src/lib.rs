//! Core types for the Keepsake domain-persistence library.
//!
//! This crate provides the building blocks for repository-backed aggregates:
//!
//! - [`properties`] - Per-aggregate property container with lazy, memoized,
//!   refreshable value cells (`PersistentProperties`, `PropertiesBuilder`)
//! - [`refresh`] - The ambient lazy-refresh flag (`with_lazy_refresh`)
//! - [`transaction`] - Transaction objects, the ambient transaction context,
//!   and the `TransactionManager` control-flow helpers
//! - [`subscription`] - Typed in-process event subscriptions
//!   (`EventSubscriptions`, `EventListener`)
//! - [`event`] - Event marker trait and type tags (`DomainEvent`, `EventTag`)
//! - [`storage`] - Storage adapter contracts, plus the reference in-memory
//!   adapter in [`storage::memory`]
//! - [`error`] - The `PersistenceError` category
//!
//! # Example
//!
//! ```ignore
//! use keepsake_core::{
//!     storage::memory::MemoryStorage, transaction::TransactionManager,
//! };
//!
//! let storage: MemoryStorage<Database> = MemoryStorage::new();
//! let manager = TransactionManager::new(storage);
//!
//! let user = manager
//!     .with_read_write_transaction(|_tx| async { users.create(spec()).await })
//!     .await?;
//! ```
//!
//! Most users should depend on the `keepsake` crate, which re-exports these
//! types with a cleaner API surface.

pub mod error;
pub mod event;
pub mod properties;
pub mod refresh;
pub mod storage;
pub mod subscription;
pub mod transaction;

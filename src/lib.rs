#![doc = include_str!("../README.md")]

pub use keepsake_core::{
    error::PersistenceError,
    event::{DomainEvent, EventTag, PublishedEvent},
    persistent_accessors,
    properties::{DebugValue, PersistentProperties, PropertiesBuilder},
    refresh::{is_lazy_refresh_active, with_lazy_refresh},
    subscription::{EventListener, EventSubscriptions},
    transaction::{
        DEFAULT_RETRIES, ReadOnlyTransaction, ReadWriteTransaction, Transaction,
        TransactionAware, TransactionManager, current_read_write_transaction,
        current_transaction, transaction_is_active, with_current_read_write_transaction,
    },
};

pub mod storage {
    pub use keepsake_core::storage::{Storage, TransactionMode, TransactionalDatabase};

    pub mod memory {
        pub use keepsake_core::storage::memory::{MemoryDatabase, MemoryStorage};
    }
}

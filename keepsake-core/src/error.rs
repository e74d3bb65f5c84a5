//! The error category shared by every subsystem.
//!
//! All fallible operations in this crate surface [`PersistenceError`].
//! Adapter failures and domain-level errors are folded in through the boxed
//! [`Storage`](PersistenceError::Storage) and
//! [`Domain`](PersistenceError::Domain) variants so callers handle a single
//! error type across property reads, transaction control flow, and event
//! dispatch.

use thiserror::Error;

/// Top-level error category for the persistence core.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The requested property has never been set.
    #[error("no such property `{name}`")]
    NoSuchProperty {
        /// The property name that was looked up.
        name: String,
    },

    /// A property read requested a type other than the one the cell holds.
    #[error("{}", format_type_mismatch(.name, .expected, .actual, .lazy))]
    UnexpectedPropertyType {
        /// The property name that was read.
        name: String,
        /// The type the caller asked for.
        expected: &'static str,
        /// The type the cell actually holds.
        actual: &'static str,
        /// Whether the cell is a lazy (unresolved or memoized) cell.
        lazy: bool,
    },

    /// An object seeded the same property name twice while building its
    /// property container.
    #[error("`{owner}` declares the property `{name}` more than once")]
    DuplicateProperty {
        /// The colliding property name.
        name: String,
        /// The type that declared the collision.
        owner: &'static str,
    },

    /// No transaction is bound to the current task.
    #[error("no transaction is bound to the current task")]
    CurrentTransactionUnavailable,

    /// The ambient transaction is read-only but a read-write transaction was
    /// requested.
    #[error("the current transaction is read-only; a read-write transaction is required")]
    ReadWriteTransactionRequired,

    /// A `with_…_transaction` helper was entered while another transaction
    /// already occupies the ambient slot.
    #[error("a transaction is already bound to the current task")]
    ConcurrentTransaction,

    /// Signal consumed by the read-write retry loop; never observed by
    /// callers unless the retry budget is exhausted, in which case the
    /// wrapped cause is rethrown instead.
    #[error("transaction retry requested: {cause}")]
    TransactionRetry {
        /// The error that prompted the retry request.
        #[source]
        cause: Box<PersistenceError>,
    },

    /// Failure raised by a storage adapter.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Domain-level failure raised by repositories or aggregates built on
    /// the core.
    #[error(transparent)]
    Domain(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl PersistenceError {
    /// Wrap a storage-adapter failure.
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }

    /// Wrap a domain-level failure.
    pub fn domain(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Domain(Box::new(err))
    }

    /// Request that the enclosing read-write transaction be retried.
    #[must_use]
    pub fn retry(cause: PersistenceError) -> Self {
        Self::TransactionRetry {
            cause: Box::new(cause),
        }
    }

    pub(crate) fn no_such_property(name: impl Into<String>) -> Self {
        Self::NoSuchProperty { name: name.into() }
    }
}

/// Build the type-mismatch message, distinguishing lazy cells so the caller
/// can tell a wrong accessor from a wrong type argument.
fn format_type_mismatch(name: &str, expected: &str, actual: &str, lazy: &bool) -> String {
    let kind = if *lazy { "lazy property" } else { "property" };
    format!("{kind} `{name}` holds `{actual}`, expected `{expected}`")
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn type_mismatch_mentions_both_types() {
        let err = PersistenceError::UnexpectedPropertyType {
            name: "email".to_string(),
            expected: "alloc::string::String",
            actual: "i64",
            lazy: false,
        };
        let msg = err.to_string();
        assert!(msg.contains("email"));
        assert!(msg.contains("i64"));
        assert!(msg.contains("String"));
        assert!(!msg.contains("lazy"));
    }

    #[test]
    fn lazy_type_mismatch_is_flagged() {
        let err = PersistenceError::UnexpectedPropertyType {
            name: "groups".to_string(),
            expected: "alloc::vec::Vec<uuid::Uuid>",
            actual: "alloc::string::String",
            lazy: true,
        };
        assert!(err.to_string().contains("lazy property"));
    }

    #[test]
    fn retry_wraps_its_cause_as_source() {
        let err = PersistenceError::retry(PersistenceError::CurrentTransactionUnavailable);
        assert!(err.to_string().contains("retry"));
        assert!(err.source().is_some());
    }

    #[test]
    fn domain_errors_display_transparently() {
        let err = PersistenceError::domain(std::io::Error::other("email taken"));
        assert_eq!(err.to_string(), "email taken");
    }
}

use thiserror::Error;

/// Typed failures of engine operations.
///
/// Engine APIs return [`anyhow::Result`]; when one of these is the cause it
/// can be recovered with `err.downcast_ref::<EngineError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The transaction's base version is no longer the last committed one.
    /// Nothing was published; the caller may restart the transaction.
    #[error("commit conflict: transaction based on {base}, last committed is {current}")]
    Conflict { base: u64, current: u64 },

    /// A file failed validation or a reference points outside of it.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// The cursor is not positioned on a key.
    #[error("no current key")]
    NotFound,

    /// A mutation was attempted through a read transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// A size limit of the on-disk format would be exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("key too large (max {max} bytes)", max = crate::MAX_KEY_SIZE)]
    KeyTooLarge,

    #[error("value too large (max {max} bytes)", max = crate::MAX_VALUE_SIZE)]
    ValueTooLarge,
}

/// Returns `true` when `err` carries [`EngineError::Conflict`].
#[must_use]
pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Conflict { .. })
    )
}

/// Returns `true` when `err` carries [`EngineError::Cancelled`].
#[must_use]
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Cancelled))
}

/// Error kinds the synchronization layer classifies by downcast.
///
/// Everything still travels as [`anyhow::Error`]; these are the kinds that
/// change behaviour (recorded vs dropped vs fatal) rather than a parallel
/// error hierarchy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Canonical bytes violate a recipe rule.
    #[error("decode error: {0}")]
    Decode(String),
    /// A payload does not hash to its advertised address.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    /// The requested hash is absent locally.
    #[error("not found: {0}")]
    NotFound(String),
    /// A grant filter rejected an item.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The merge algorithm has no deterministic resolution for a field.
    #[error("merge conflict at {0}")]
    ConflictMerge(String),
    /// The transport ended while requests were in flight.
    #[error("connection closed")]
    ConnectionClosed,
    /// Operation attempted against a closed or mis-sequenced instance.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A second `init` without an intervening close.
    #[error("instance already initialized")]
    AlreadyInitialized,
    /// Encryption requested without a usable secret.
    #[error("invalid secret")]
    InvalidSecret,
}

impl StoreError {
    /// Returns the typed kind of an error if it carries one.
    pub fn kind_of(err: &anyhow::Error) -> Option<&StoreError> {
        err.downcast_ref::<StoreError>()
    }

    /// Transport faults are dropped from session error lists.
    pub fn is_connection_closed(err: &anyhow::Error) -> bool {
        matches!(Self::kind_of(err), Some(StoreError::ConnectionClosed))
    }
}

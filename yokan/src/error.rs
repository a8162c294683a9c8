//! The error taxonomy returned by every operation in this crate.

use thiserror::Error;

/// An error type for the provider-side request engine.
///
/// Each variant corresponds to one of the error kinds a request can fail
/// with. Per-item failures inside a batch (key not found, buffer too small)
/// are not represented here: those are reported through [`crate::sentinel`]
/// sentinel sizes, not through `Result`.
#[derive(Debug, Error)]
pub enum Error {
    /// Null/empty argument where forbidden, or inconsistent sizes.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The admin token presented with the request does not match.
    #[error("invalid token")]
    InvalidToken,

    /// The RPC targeted a provider id that is not registered, or tried to
    /// register a provider id twice.
    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    /// The database id or name does not resolve to a live database, or the
    /// database is mid-migration and not accepting operations.
    #[error("invalid database: {0}")]
    InvalidDatabase(String),

    /// The requested backend type is not registered.
    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    /// The backend configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation referenced a document id that does not exist.
    #[error("invalid document id: {0}")]
    InvalidId(u64),

    /// A single-key operation found no value for the key.
    ///
    /// Multi-key operations report this per item via a sentinel size
    /// instead of failing the whole request.
    #[error("key not found")]
    KeyNotFound,

    /// A single-key `get` was given a destination buffer too small for the
    /// value.
    ///
    /// Multi-key operations report this per item via `SIZE_TOO_SMALL`
    /// instead.
    #[error("buffer too small")]
    BufferSize,

    /// The backend does not advertise the capability the operation needs.
    #[error("operation not supported by backend: {0}")]
    OpUnsupported(&'static str),

    /// A bulk segment that the codec needed to access directly was not
    /// contiguous.
    #[error("non-contiguous bulk segment")]
    Noncontig,

    /// A streaming operation was requested but the client's endpoint is not
    /// listening for back-RPCs.
    #[error("client endpoint not listening")]
    MidNotListening,

    /// A transport-layer failure, bubbled up unchanged.
    #[error("transport error: {0}")]
    FromTransport(String),

    /// A scheduler/runtime failure, bubbled up unchanged.
    #[error("scheduler error: {0}")]
    FromScheduler(String),

    /// Memory or buffer allocation failed.
    #[error("allocation failure")]
    Allocation,

    /// Any other failure not covered by a more specific kind.
    #[error("{0}")]
    Other(String),
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio::sync::AcquireError> for Error {
    fn from(e: tokio::sync::AcquireError) -> Self {
        Error::FromScheduler(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::FromTransport(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::FromTransport(e.to_string())
    }
}

//! Error types for store access and registry operations.
//!
//! `StoreError` is the boundary type every [`KvStore`] implementation maps its
//! client errors into. `RegistryError` is what callers of [`Registry`] see; it
//! wraps store failures and adds the registration-specific causes.
//!
//! [`KvStore`]: crate::store::KvStore
//! [`Registry`]: crate::Registry

use thiserror::Error;

use crate::store::LeaseId;

/// Failure reported by the backing key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation did not complete within its bound.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The lease is unknown to the store (expired or revoked).
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// Stored bytes could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,
}

impl StoreError {
    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }

    /// Returns true if the connection was already closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

/// Shorthand result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The step of the registration protocol that failed.
#[derive(Debug, Error)]
pub enum RegistrationFailure {
    /// The store refused or failed to grant a lease.
    #[error("lease grant failed: {0}")]
    LeaseGrantFailed(#[source] StoreError),

    /// The key could not be written under the new lease.
    #[error("publish failed: {0}")]
    PublishFailed(#[source] StoreError),

    /// The keep-alive stream for the new lease could not be started.
    #[error("renewal start failed: {0}")]
    RenewalStartFailed(#[source] StoreError),
}

/// Top-level error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Dialing or closing the store connection failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// `register` (or the self-heal fallback of `update`) failed.
    #[error("registration of '{key}' failed: {cause}")]
    Registration {
        key: String,
        #[source]
        cause: RegistrationFailure,
    },

    /// Rejected before any store I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Passthrough for get/watch/delete failures.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The registry was closed and accepts no further operations.
    #[error("registry is closed")]
    Closed,
}

impl RegistryError {
    /// Returns the registration cause, if this is a registration failure.
    pub fn registration_cause(&self) -> Option<&RegistrationFailure> {
        match self {
            RegistryError::Registration { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Shorthand result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

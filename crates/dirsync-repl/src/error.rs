//! Error types for the replication subsystem.

use dirsync_meta::types::MetaError;
use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Error from the metadata core (backend, directory, cluster, raft).
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Could not connect to a partner.
    #[error("connection to {partner} failed: {msg}")]
    Connection {
        /// Partner host name.
        partner: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// Partner did not answer in time.
    #[error("timeout talking to {partner}")]
    Timeout {
        /// Partner host name.
        partner: String,
    },

    /// An established partner connection dropped.
    #[error("connection to {partner} lost")]
    ConnectionLost {
        /// Partner host name.
        partner: String,
    },

    /// The partner rejected the bind credentials.
    #[error("invalid credentials for {partner}")]
    InvalidCredentials {
        /// Partner host name.
        partner: String,
    },

    /// A replicated change needs an entry (or its parent) that is missing locally.
    #[error("no such object for {dn}")]
    MissingParent {
        /// DN of the change that could not be applied.
        dn: String,
    },

    /// The server is shutting down.
    #[error("shutting down")]
    Shutdown,

    /// A progress cookie could not be parsed.
    #[error("invalid cookie: {0}")]
    InvalidCookie(String),

    /// Replicated metadata could not be parsed.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A synchronization primitive failed; the driver cannot continue.
    #[error("synchronization failure: {0}")]
    Sync(String),

    /// The bootstrap cycle failed.
    #[error("first replication cycle failed: {0}")]
    FirstCycle(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// True for failures that are expected to clear up by the next cycle:
    /// shutting down, lost connections, timeouts and failed connects.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplError::Shutdown
                | ReplError::ConnectionLost { .. }
                | ReplError::Timeout { .. }
                | ReplError::Connection { .. }
                | ReplError::Meta(MetaError::ShuttingDown)
        )
    }

    /// True for failures excluded from the failure histogram bucket.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ReplError::Shutdown
                | ReplError::ConnectionLost { .. }
                | ReplError::Timeout { .. }
                | ReplError::Meta(MetaError::ShuttingDown)
        )
    }
}

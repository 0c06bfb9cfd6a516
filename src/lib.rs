// Tablestore - resilient table storage client
// Decorator-composed access to a remote table/blob service with declarative entity mapping

#![warn(rust_2018_idioms)]

pub mod batch;
pub mod blob;
pub mod config;
pub mod decorators;
pub mod entity;
pub mod factory;
pub mod paging;
pub mod query;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod value;

// Re-exports for convenience
pub use crate::config::StorageConfig;
pub use entity::{EntityDescriptor, EntityMetadata, TableEntity, TableRow};
pub use error::{Error, Result};
pub use factory::TableStorageFactory;
pub use query::{Filter, QueryComparison, TableQuery};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{InMemoryTable, RemoteTableStorage, TableStorage};
pub use value::{PropertyName, PropertyValue, ValueKind};

/// Storage error types
pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const PRECONDITION_FAILED: u16 = 412;

    #[derive(Error, Debug, Clone)]
    pub enum Error {
        #[error("Conflict: {0}")]
        Conflict(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Forbidden: {0}")]
        Forbidden(String),

        #[error("Bad request: {0}")]
        BadRequest(String),

        #[error("Precondition failed: {0}")]
        PreconditionFailed(String),

        #[error("Remote error {status}: {message}")]
        Remote { status: u16, message: String },

        #[error("Transient failure: {0}")]
        Transient(String),

        #[error("Operation timed out after {0:?}")]
        Timeout(Duration),

        #[error("Operation cancelled: {0}")]
        Cancelled(String),

        #[error("Configuration error: {0}")]
        Configuration(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Batch for partition '{partition}' failed at chunk {chunk}: {source}")]
        BatchFailed {
            partition: String,
            chunk: usize,
            #[source]
            source: Box<Error>,
        },

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Build an error from a status code reported by the remote service
        pub fn from_status(status: u16, message: impl Into<String>) -> Self {
            let message = message.into();
            match status {
                BAD_REQUEST => Error::BadRequest(message),
                FORBIDDEN => Error::Forbidden(message),
                NOT_FOUND => Error::NotFound(message),
                CONFLICT => Error::Conflict(message),
                PRECONDITION_FAILED => Error::PreconditionFailed(message),
                _ => Error::Remote { status, message },
            }
        }

        /// HTTP-equivalent status marker, identical for remote and in-memory backends
        pub fn status_code(&self) -> Option<u16> {
            match self {
                Error::BadRequest(_) => Some(BAD_REQUEST),
                Error::Forbidden(_) => Some(FORBIDDEN),
                Error::NotFound(_) => Some(NOT_FOUND),
                Error::Conflict(_) => Some(CONFLICT),
                Error::PreconditionFailed(_) => Some(PRECONDITION_FAILED),
                Error::Remote { status, .. } => Some(*status),
                Error::BatchFailed { source, .. } => source.status_code(),
                _ => None,
            }
        }

        pub fn is_conflict(&self) -> bool {
            self.status_code() == Some(CONFLICT)
        }

        pub fn is_not_found(&self) -> bool {
            self.status_code() == Some(NOT_FOUND)
        }

        pub fn is_precondition_failed(&self) -> bool {
            self.status_code() == Some(PRECONDITION_FAILED)
        }

        /// Authorization failure; triggers a reconnect in the reconnecting decorators
        pub fn is_auth_failure(&self) -> bool {
            self.status_code() == Some(FORBIDDEN)
        }

        /// Timeout or caller-side cancellation
        pub fn is_cancellation(&self) -> bool {
            match self {
                Error::Timeout(_) | Error::Cancelled(_) => true,
                Error::BatchFailed { source, .. } => source.is_cancellation(),
                _ => false,
            }
        }

        /// Per-call execution time expired
        pub fn is_timeout(&self) -> bool {
            match self {
                Error::Timeout(_) => true,
                Error::BatchFailed { source, .. } => source.is_timeout(),
                _ => false,
            }
        }

        pub fn is_configuration(&self) -> bool {
            matches!(self, Error::Configuration(_))
        }
    }

    impl From<serde_json::Error> for Error {
        fn from(e: serde_json::Error) -> Self {
            Error::Serialization(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

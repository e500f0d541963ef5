//! Service Registry Error Hierarchy
//!
//! Errors are grouped by the layer that produces them. Only
//! fatal-at-init failures reach callers of
//! [`ServiceRegistry::register`](crate::ServiceRegistry::register);
//! transient store failures are retried internally and decode failures
//! are logged and skipped.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registration parameter and lifecycle failures
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Consistent store failures (connection, lease, CRUD, watch)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid configuration detected by `validate()`
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A mandatory registration field was empty
    #[error("Register param `{0}` can not be empty")]
    MissingParam(&'static str),

    /// `authKey` was not base64("user,password")
    #[error("Invalid auth key: {0}")]
    InvalidAuthKey(String),

    /// The self record could not be serialized
    #[error("Encode server record failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Operation attempted after the registry was shut down
    #[error("Registry is {0}")]
    NotActive(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store endpoints unreachable at connect time
    #[error("Unable to connect to store at {endpoints}: {source}")]
    Connect {
        endpoints: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Credentials rejected by the store
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Etcd request failures
    #[error(transparent)]
    Etcd(#[from] Box<etcd_client::Error>),

    /// Requested key does not exist
    #[error("Key not found in storage: {0}")]
    KeyNotFound(String),

    /// Lease revoke did not finish in time
    #[error("Lease revoke timed out after {0:?}")]
    RevokeTimeout(Duration),

    /// Keepalive stream ended before the first acknowledgement
    #[error("Keepalive stream for lease {0} closed")]
    KeepAliveClosed(i64),

    /// Watch stream could not be opened
    #[error("Watch on {prefix} failed: {reason}")]
    Watch { prefix: String, reason: String },

    /// Generic backend failures
    #[error("Backend error: {0}")]
    Backend(String),

    /// Background task failures
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

/// Failure to ingest a single store entry into the cache.
///
/// Never surfaced to callers: the entry is logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Json decode failed for {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Key path {0} has fewer than two segments")]
    InvalidPath(String),
}

// ============== Conversion Implementations ============== //
impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        StoreError::from(err).into()
    }
}

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        if let etcd_client::Error::GRpcStatus(status) = &err {
            // etcd reports bad credentials as InvalidArgument
            if matches!(
                status.code(),
                tonic::Code::Unauthenticated | tonic::Code::PermissionDenied
            ) || status.message().contains("authentication failed")
            {
                return StoreError::AuthRejected(status.message().to_string());
            }
        }
        StoreError::Etcd(Box::new(err))
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        StoreError::TaskFailed(err).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        RegistrationError::Encode(err).into()
    }
}

//! Error types for `backlink-core`.
//!
//! Failures that the console turns into UI state (rejected HTTP calls,
//! unreachable hosts, malformed tokens) are recovered close to where they
//! happen; only the variants below cross a module boundary.

use backlink_storage::StorageError;

use crate::server::ServerId;

/// A submitted or patched backend server record failed a schema check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Name of the offending field, as shown on the form.
    pub field: &'static str,
    /// Human-readable reason, suitable for an inline form message.
    pub reason: &'static str,
}

impl ValidationError {
    pub(crate) const fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

/// Errors from connection store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record was rejected before any mutation took place.
    #[error("server rejected: {0}")]
    Validation(#[from] ValidationError),

    /// No record carries the given id.
    #[error("server not found: {id}")]
    NotFound { id: ServerId },

    /// A positional operation addressed a slot past the end of the list.
    #[error("server index {index} out of bounds (have {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    /// The persisted state was written by a newer release.
    #[error("persisted state has version {found}, this build supports up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Persisted state could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage backend returned an error.
    #[error("store storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from templated API requests.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response (DNS, connect, TLS, timeout).
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// The backend answered with a non-success status.
    #[error("API call failed with status {status}")]
    Http {
        status: u16,
        /// Response body, if it parsed as JSON.
        body: Option<serde_json::Value>,
    },

    /// The response body could not be decoded into the expected shape.
    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    /// The template named an HTTP method that does not parse.
    #[error("invalid HTTP method '{method}'")]
    InvalidMethod { method: String },

    /// The underlying HTTP client could not be constructed.
    #[error("failed to build HTTP client: {reason}")]
    Client { reason: String },
}

impl ApiError {
    /// HTTP status carried by this error; `0` when no response was received.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Http { status, .. } => *status,
            Self::Network { .. }
            | Self::Decode { .. }
            | Self::InvalidMethod { .. }
            | Self::Client { .. } => 0,
        }
    }
}

/// Errors from a connection workflow submission.
///
/// Authorization and ping failures are not errors: they are reported as
/// [`ConnectOutcome`](crate::workflow::ConnectOutcome) variants.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The submitted form failed validation; no request was sent.
    #[error("form rejected: {0}")]
    Validation(#[from] ValidationError),

    /// Committing the record to the store failed.
    #[error("workflow store error: {0}")]
    Store(#[from] StoreError),
}

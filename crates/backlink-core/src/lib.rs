//! Core library for Backlink.
//!
//! Contains the connection store (registered backend servers, the active
//! backend, the theme), the connection workflow that logs in and pings a
//! backend before saving it, templated API requests, and bearer token claim
//! decoding. This crate depends on `backlink-storage` for the storage backend
//! trait and reads no environment variables; front ends own configuration.

pub mod api;
pub mod error;
pub mod inspect;
pub mod server;
pub mod store;
pub mod token;
pub mod user;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use api::{ApiCall, ApiClient, ApiTemplate, DEFAULT_TIMEOUT};
pub use error::{ApiError, StoreError, ValidationError, WorkflowError};
pub use inspect::{AuthorizationDetails, inspect_authorization};
pub use server::{BackendServer, ServerForm, ServerId, ServerPatch};
pub use store::{ConnectionStore, Theme};
pub use token::{ClaimRow, Claims, ExpiryStatus, decode_token};
pub use user::{User, UserStatus};
pub use workflow::{
    ConnectOutcome, ConnectionLoading, ConnectionPhase, ConnectionWorkflow, FormMode,
    LoadingState,
};

//! "Show Authorization" for a stored backend.

use chrono::Utc;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::error::{ApiError, StoreError};
use crate::server::{BackendServer, ServerId};
use crate::store::ConnectionStore;
use crate::token::{ClaimRow, Claims, claim_rows, decode_token};
use crate::user::User;

/// Everything the authorization view shows for one record.
#[derive(Debug)]
pub struct AuthorizationDetails {
    pub server: BackendServer,
    /// `None` if the stored token does not decode.
    pub claims: Option<Claims>,
    pub rows: Vec<ClaimRow>,
    pub user: Option<User>,
    /// Why the profile fetch failed, if it did.
    pub user_error: Option<ApiError>,
}

/// Decode the record's token and fetch the profile it belongs to.
///
/// The fetched profile replaces the store's current user; a failed fetch
/// clears it. Fetch failures are returned in the details rather than as an
/// error. Records that never connected skip the fetch.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if no record has `id`.
pub async fn inspect_authorization(
    store: &ConnectionStore,
    api: &ApiClient,
    id: ServerId,
) -> Result<AuthorizationDetails, StoreError> {
    let server = store.server(id).await.ok_or(StoreError::NotFound { id })?;

    let claims = decode_token(&server.authorization);
    let rows = claims
        .as_ref()
        .map(|c| claim_rows(c, Utc::now().timestamp()))
        .unwrap_or_default();

    if !server.is_connected() {
        debug!(%id, "record has no token; skipping profile fetch");
        store.set_user(None).await;
        return Ok(AuthorizationDetails {
            server,
            claims,
            rows,
            user: None,
            user_error: None,
        });
    }

    let (user, user_error) = match api.fetch_user(&server.host, &server.authorization).await {
        Ok(user) => (Some(user), None),
        Err(e) => {
            warn!(%id, status = e.status(), error = %e, "failed to fetch user profile");
            (None, Some(e))
        }
    };
    store.set_user(user.clone()).await;

    Ok(AuthorizationDetails {
        server,
        claims,
        rows,
        user,
        user_error,
    })
}

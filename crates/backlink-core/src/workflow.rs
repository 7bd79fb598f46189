//! The connection workflow run for every "Configure Backend" submission.
//!
//! In create mode a submission logs in against `{host}rest/v2/user/login`,
//! pings `{host}{pingPath}` with the returned bearer token, and only when
//! both succeed commits the record to the [`ConnectionStore`]. Either
//! failure is reported as a [`ConnectOutcome`] and leaves the store alone.
//! Edit mode writes the form straight through without touching the network.
//!
//! Progress is published on a `watch` channel as a [`LoadingState`]. Every
//! submission takes a new generation number; updates and commits from a
//! submission that has since been superseded are dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, Envelope, join_url};
use crate::error::WorkflowError;
use crate::server::{ServerForm, ServerId, ServerPatch};
use crate::store::ConnectionStore;

/// Title shown above a failed-step alert.
pub const CONNECTION_ERROR_TITLE: &str = "Connection Error";

/// Message shown when the login call fails.
pub const AUTHORIZE_FAILED_MESSAGE: &str =
    "Unable to authorize with the backend. Check the host and credentials.";

/// Message shown when the health-check call fails.
pub const PING_FAILED_MESSAGE: &str =
    "Ping request failed. Check the ping path and that the backend is reachable.";

/// Login route, relative to the server's host.
pub const LOGIN_PATH: &str = "rest/v2/user/login";

/// Where a submission currently stands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Authorizing,
    AuthorizeFailed { message: String },
    Pinging,
    PingFailed { message: String },
    PingSucceeded,
    /// Both calls succeeded but the record could not be stored.
    SaveFailed { message: String },
}

impl ConnectionPhase {
    /// Whether a network call is outstanding.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Authorizing | Self::Pinging)
    }

    /// The five-flag view the form renders from.
    #[must_use]
    pub fn loading(&self) -> ConnectionLoading {
        match self {
            Self::Idle | Self::PingSucceeded => ConnectionLoading::default(),
            Self::Authorizing => ConnectionLoading {
                authorization: true,
                ..ConnectionLoading::default()
            },
            Self::AuthorizeFailed { message } => ConnectionLoading {
                authorization_error: true,
                message: Some(message.clone()),
                ..ConnectionLoading::default()
            },
            Self::Pinging => ConnectionLoading {
                ping: true,
                ..ConnectionLoading::default()
            },
            Self::PingFailed { message } => ConnectionLoading {
                ping_error: true,
                message: Some(message.clone()),
                ..ConnectionLoading::default()
            },
            Self::SaveFailed { message } => ConnectionLoading {
                message: Some(message.clone()),
                ..ConnectionLoading::default()
            },
        }
    }
}

/// Flags for the form: at most one step in progress, errors end the attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionLoading {
    pub authorization: bool,
    pub authorization_error: bool,
    pub ping: bool,
    pub ping_error: bool,
    pub message: Option<String>,
}

/// Latest published phase and the submission it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingState {
    pub generation: u64,
    pub phase: ConnectionPhase,
}

/// Whether the form creates a new record or edits an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMode {
    Create,
    Edit(ServerId),
}

/// Result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Both steps succeeded and the record was stored.
    Committed { id: ServerId, authorization: String },
    /// Edit mode wrote the form through.
    Updated { id: ServerId },
    /// The login call failed; `status` is 0 when no response arrived.
    AuthorizeFailed { message: String, status: u16 },
    /// Login worked but the ping did not. The token is handed back so the
    /// caller can retry without logging in again; nothing was stored.
    PingFailed {
        message: String,
        status: u16,
        authorization: String,
    },
    /// A later submission started before this one finished.
    Superseded,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    token: String,
}

/// Runs submissions and publishes their progress.
#[derive(Debug)]
pub struct ConnectionWorkflow {
    api: ApiClient,
    generation: AtomicU64,
    state: watch::Sender<LoadingState>,
}

impl ConnectionWorkflow {
    #[must_use]
    pub fn new(api: ApiClient) -> Self {
        let (state, _) = watch::channel(LoadingState::default());
        Self {
            api,
            generation: AtomicU64::new(0),
            state,
        }
    }

    /// Follow phase changes, e.g. to drive a spinner.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LoadingState> {
        self.state.subscribe()
    }

    /// Snapshot of the latest published state.
    #[must_use]
    pub fn state(&self) -> LoadingState {
        self.state.borrow().clone()
    }

    /// Drop back to `Idle`; any submission still in flight is superseded.
    pub fn reset(&self) {
        self.begin();
    }

    fn begin(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|s| {
            if generation > s.generation {
                s.generation = generation;
                s.phase = ConnectionPhase::Idle;
            }
        });
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.borrow().generation == generation
    }

    /// Publish `phase` unless a newer submission owns the state.
    fn publish(&self, generation: u64, phase: ConnectionPhase) -> bool {
        self.state.send_if_modified(move |s| {
            if s.generation != generation {
                return false;
            }
            s.phase = phase;
            true
        })
    }

    /// Handle one form submission.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Validation`] before any request if the form
    /// is invalid, and [`WorkflowError::Store`] if the final write fails.
    /// Login and ping failures are outcomes, not errors.
    pub async fn submit(
        &self,
        store: &ConnectionStore,
        form: ServerForm,
        mode: FormMode,
    ) -> Result<ConnectOutcome, WorkflowError> {
        if let FormMode::Edit(id) = mode {
            form.validate_details()?;
            store.update_server(id, ServerPatch::from(form)).await?;
            return Ok(ConnectOutcome::Updated { id });
        }
        form.validate()?;

        let generation = self.begin();
        self.publish(generation, ConnectionPhase::Authorizing);

        let token = match self
            .authorize(&form.host, &form.username_or_email, &form.password)
            .await
        {
            Ok(token) => token,
            Err(status) => {
                if !self.publish(
                    generation,
                    ConnectionPhase::AuthorizeFailed {
                        message: AUTHORIZE_FAILED_MESSAGE.to_owned(),
                    },
                ) {
                    return Ok(ConnectOutcome::Superseded);
                }
                return Ok(ConnectOutcome::AuthorizeFailed {
                    message: AUTHORIZE_FAILED_MESSAGE.to_owned(),
                    status,
                });
            }
        };

        if !self.publish(generation, ConnectionPhase::Pinging) {
            return Ok(ConnectOutcome::Superseded);
        }

        if let Err(status) = self.ping(&form.host, &form.ping_path, &token).await {
            if !self.publish(
                generation,
                ConnectionPhase::PingFailed {
                    message: PING_FAILED_MESSAGE.to_owned(),
                },
            ) {
                return Ok(ConnectOutcome::Superseded);
            }
            return Ok(ConnectOutcome::PingFailed {
                message: PING_FAILED_MESSAGE.to_owned(),
                status,
                authorization: token,
            });
        }

        if !self.is_current(generation) {
            return Ok(ConnectOutcome::Superseded);
        }

        match store.add_server(form, token.clone()).await {
            Ok(id) => {
                self.publish(generation, ConnectionPhase::PingSucceeded);
                info!(%id, "backend connected and saved");
                Ok(ConnectOutcome::Committed {
                    id,
                    authorization: token,
                })
            }
            Err(e) => {
                warn!(error = %e, "backend verified but could not be saved");
                self.publish(
                    generation,
                    ConnectionPhase::SaveFailed {
                        message: e.to_string(),
                    },
                );
                Err(e.into())
            }
        }
    }

    /// Log in and return the bearer token, or the failing status (0 when no
    /// response arrived).
    async fn authorize(&self, host: &str, username: &str, password: &str) -> Result<String, u16> {
        let url = join_url(host, LOGIN_PATH);
        debug!(%url, "authorizing");

        let resp = self
            .api
            .http()
            .post(&url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| {
                warn!(%url, error = %e, "login request failed");
                0_u16
            })?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "login rejected");
            return Err(status.as_u16());
        }

        let envelope: Envelope<LoginData> = resp.json().await.map_err(|e| {
            warn!(%url, error = %e, "login response did not decode");
            status.as_u16()
        })?;
        if envelope.data.token.is_empty() {
            warn!(%url, message = %envelope.message, "login response carried no token");
            return Err(status.as_u16());
        }
        Ok(envelope.data.token)
    }

    /// Call the health-check route with the fresh token.
    async fn ping(&self, host: &str, ping_path: &str, token: &str) -> Result<(), u16> {
        let url = join_url(host, ping_path);
        debug!(%url, "pinging");

        let resp = self
            .api
            .http()
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                warn!(%url, error = %e, "ping request failed");
                0_u16
            })?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            warn!(%url, status = status.as_u16(), "ping rejected");
            Err(status.as_u16())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;
    use crate::api::DEFAULT_TIMEOUT;
    use crate::server::tests::sample_form;
    use crate::store::tests::ReadOnlyBackend;
    use crate::testing::{closed_port, serve};

    struct FakeBackend {
        login_status: StatusCode,
        ping_status: StatusCode,
        login_delay: Duration,
        token: &'static str,
        logins: AtomicUsize,
        pings: AtomicUsize,
    }

    impl FakeBackend {
        fn new(login_status: StatusCode, ping_status: StatusCode) -> Self {
            Self {
                login_status,
                ping_status,
                login_delay: Duration::ZERO,
                token: "abc",
                logins: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
            }
        }
    }

    async fn login(
        State(fake): State<Arc<FakeBackend>>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        fake.logins.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(fake.login_delay).await;
        if body != json!({"username": "admin@example.com", "password": "hunter2"}) {
            return (StatusCode::BAD_REQUEST, Json(json!({"success": false})));
        }
        if !fake.login_status.is_success() {
            return (
                fake.login_status,
                Json(json!({"success": false, "message": "bad credentials"})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({"success": true, "message": "ok", "data": {"token": fake.token}})),
        )
    }

    async fn ping(State(fake): State<Arc<FakeBackend>>, headers: HeaderMap) -> StatusCode {
        fake.pings.fetch_add(1, Ordering::SeqCst);
        let expected = format!("Bearer {}", fake.token);
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED;
        }
        fake.ping_status
    }

    async fn start(fake: FakeBackend) -> (String, Arc<FakeBackend>) {
        let fake = Arc::new(fake);
        let router = Router::new()
            .route("/rest/v2/user/login", post(login))
            .route("/ping", get(ping))
            .with_state(Arc::clone(&fake));
        (serve(router).await, fake)
    }

    fn workflow() -> ConnectionWorkflow {
        ConnectionWorkflow::new(ApiClient::new(DEFAULT_TIMEOUT).unwrap())
    }

    fn form_for(host: &str) -> ServerForm {
        ServerForm {
            host: host.to_owned(),
            ..sample_form("prod")
        }
    }

    #[tokio::test]
    async fn commits_after_login_and_ping() {
        let (host, fake) = start(FakeBackend::new(StatusCode::OK, StatusCode::OK)).await;
        let store = ConnectionStore::in_memory();
        let wf = workflow();

        let outcome = wf.submit(&store, form_for(&host), FormMode::Create).await.unwrap();

        let ConnectOutcome::Committed { id, authorization } = outcome else {
            unreachable!("expected a committed outcome");
        };
        assert_eq!(authorization, "abc");
        let saved = store.server(id).await.unwrap();
        assert_eq!(saved.authorization, "abc");
        assert!(!saved.in_use);
        assert_eq!(fake.pings.load(Ordering::SeqCst), 1);
        assert_eq!(wf.state().phase, ConnectionPhase::PingSucceeded);
        assert_eq!(wf.state().phase.loading(), ConnectionLoading::default());
    }

    #[tokio::test]
    async fn host_without_trailing_slash_still_connects() {
        let (host, _fake) = start(FakeBackend::new(StatusCode::OK, StatusCode::OK)).await;
        let store = ConnectionStore::in_memory();
        let host = host.trim_end_matches('/').to_owned();

        let outcome = workflow()
            .submit(&store, form_for(&host), FormMode::Create)
            .await
            .unwrap();
        assert!(matches!(outcome, ConnectOutcome::Committed { .. }));
    }

    #[tokio::test]
    async fn rejected_login_commits_nothing_and_skips_ping() {
        let (host, fake) =
            start(FakeBackend::new(StatusCode::UNAUTHORIZED, StatusCode::OK)).await;
        let store = ConnectionStore::in_memory();
        let wf = workflow();

        let outcome = wf.submit(&store, form_for(&host), FormMode::Create).await.unwrap();

        assert_eq!(
            outcome,
            ConnectOutcome::AuthorizeFailed {
                message: AUTHORIZE_FAILED_MESSAGE.to_owned(),
                status: 401,
            }
        );
        assert!(store.is_empty().await);
        assert_eq!(fake.pings.load(Ordering::SeqCst), 0);

        let loading = wf.state().phase.loading();
        assert!(loading.authorization_error);
        assert!(!loading.authorization);
        assert!(!loading.ping);
        assert_eq!(loading.message.as_deref(), Some(AUTHORIZE_FAILED_MESSAGE));
    }

    #[tokio::test]
    async fn unreachable_host_fails_authorization_with_status_zero() {
        let store = ConnectionStore::in_memory();
        let outcome = workflow()
            .submit(&store, form_for(&closed_port().await), FormMode::Create)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ConnectOutcome::AuthorizeFailed { status: 0, .. }
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_ping_commits_nothing_but_returns_token() {
        let (host, fake) = start(FakeBackend::new(
            StatusCode::OK,
            StatusCode::SERVICE_UNAVAILABLE,
        ))
        .await;
        let store = ConnectionStore::in_memory();
        let wf = workflow();

        let outcome = wf.submit(&store, form_for(&host), FormMode::Create).await.unwrap();

        assert_eq!(
            outcome,
            ConnectOutcome::PingFailed {
                message: PING_FAILED_MESSAGE.to_owned(),
                status: 503,
                authorization: "abc".to_owned(),
            }
        );
        assert!(store.is_empty().await);
        assert_eq!(fake.logins.load(Ordering::SeqCst), 1);
        let loading = wf.state().phase.loading();
        assert!(loading.ping_error);
        assert!(!loading.authorization_error);
    }

    #[tokio::test]
    async fn wrong_ping_path_fails_ping() {
        let (host, _fake) = start(FakeBackend::new(StatusCode::OK, StatusCode::OK)).await;
        let store = ConnectionStore::in_memory();
        let mut form = form_for(&host);
        form.ping_path = "/missing".to_owned();

        let outcome = workflow().submit(&store, form, FormMode::Create).await.unwrap();
        assert!(matches!(
            outcome,
            ConnectOutcome::PingFailed { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn invalid_form_is_rejected_before_any_request() {
        let (host, fake) = start(FakeBackend::new(StatusCode::OK, StatusCode::OK)).await;
        let store = ConnectionStore::in_memory();
        let wf = workflow();
        let mut form = form_for(&host);
        form.ping_path = "ping".to_owned();

        let result = wf.submit(&store, form, FormMode::Create).await;
        assert!(matches!(result, Err(WorkflowError::Validation(_))));
        assert_eq!(fake.logins.load(Ordering::SeqCst), 0);
        assert_eq!(wf.state().phase, ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn edit_mode_writes_through_without_network() {
        let store = ConnectionStore::in_memory();
        let id = store
            .add_server(sample_form("prod"), "tok".to_owned())
            .await
            .unwrap();

        let mut form = ServerForm::from(&store.server(id).await.unwrap());
        form.name = "renamed".to_owned();
        form.host = closed_port().await;
        assert!(form.password.is_empty());
        let outcome = workflow()
            .submit(&store, form, FormMode::Edit(id))
            .await
            .unwrap();

        assert_eq!(outcome, ConnectOutcome::Updated { id });
        let saved = store.server(id).await.unwrap();
        assert_eq!(saved.name, "renamed");
        assert_eq!(saved.authorization, "tok");
    }

    #[tokio::test]
    async fn superseded_submission_does_not_commit() {
        let mut slow = FakeBackend::new(StatusCode::OK, StatusCode::OK);
        slow.login_delay = Duration::from_millis(300);
        let (slow_host, _slow) = start(slow).await;
        let (fast_host, _fast) = start(FakeBackend::new(StatusCode::OK, StatusCode::OK)).await;

        let store = ConnectionStore::in_memory();
        let wf = workflow();
        let mut rx = wf.subscribe();

        let (first, second) = tokio::join!(
            wf.submit(&store, form_for(&slow_host), FormMode::Create),
            wf.submit(&store, form_for(&fast_host), FormMode::Create),
        );

        assert_eq!(first.unwrap(), ConnectOutcome::Superseded);
        assert!(matches!(second.unwrap(), ConnectOutcome::Committed { .. }));
        let servers = store.servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].host, fast_host);

        let last = rx.borrow_and_update().clone();
        assert_eq!(last.generation, 2);
        assert_eq!(last.phase, ConnectionPhase::PingSucceeded);
    }

    #[tokio::test]
    async fn failed_save_does_not_report_success() {
        let (host, fake) = start(FakeBackend::new(StatusCode::OK, StatusCode::OK)).await;
        let store = ConnectionStore::load(Arc::new(ReadOnlyBackend)).await.unwrap();
        let wf = workflow();

        let result = wf.submit(&store, form_for(&host), FormMode::Create).await;

        assert!(matches!(result, Err(WorkflowError::Store(_))));
        assert!(store.is_empty().await);
        assert_eq!(fake.pings.load(Ordering::SeqCst), 1);
        let phase = wf.state().phase;
        assert!(matches!(phase, ConnectionPhase::SaveFailed { .. }));
        assert!(phase.loading().message.unwrap().contains("read-only"));
    }

    #[tokio::test]
    async fn slow_login_is_cut_off_by_client_timeout() {
        let mut slow = FakeBackend::new(StatusCode::OK, StatusCode::OK);
        slow.login_delay = Duration::from_secs(5);
        let (host, fake) = start(slow).await;
        let store = ConnectionStore::in_memory();
        let wf = ConnectionWorkflow::new(ApiClient::new(Duration::from_millis(100)).unwrap());

        let started = std::time::Instant::now();
        let outcome = wf.submit(&store, form_for(&host), FormMode::Create).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            outcome,
            ConnectOutcome::AuthorizeFailed { status: 0, .. }
        ));
        assert_eq!(fake.pings.load(Ordering::SeqCst), 0);
        assert!(store.is_empty().await);
    }

    #[test]
    fn loading_flags_follow_phase() {
        assert!(ConnectionPhase::Authorizing.loading().authorization);
        let failed = ConnectionPhase::SaveFailed {
            message: "disk full".to_owned(),
        }
        .loading();
        assert_eq!(failed.message.as_deref(), Some("disk full"));
        assert!(!failed.authorization_error && !failed.ping_error);
        assert!(ConnectionPhase::Pinging.loading().ping);
        assert!(ConnectionPhase::Pinging.is_in_flight());
        assert!(!ConnectionPhase::PingSucceeded.is_in_flight());
        assert_eq!(ConnectionPhase::Idle.loading(), ConnectionLoading::default());
    }
}

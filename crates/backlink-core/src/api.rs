//! Templated API requests against a registered backend.
//!
//! A template names a path, a method, and headers that may contain
//! `{{key}}` placeholders. Resolving a template substitutes every
//! placeholder from a replacement map; keys missing from the map become the
//! empty string, so a resolved template never carries placeholder text.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiError;
use crate::user::User;

/// Default timeout applied to every request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(clippy::expect_used)] // literal pattern
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern"));

#[allow(clippy::expect_used)] // literal pattern
static REPEATED_SLASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^:])/+").expect("slash pattern"));

/// An API call description with unresolved placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTemplate {
    pub path: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

/// The named calls the console knows how to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCall {
    /// `GET {{host}}/rest/v2/user`: profile of the token's owner.
    GetUser,
}

impl ApiCall {
    #[must_use]
    pub fn template(self) -> ApiTemplate {
        match self {
            Self::GetUser => ApiTemplate {
                path: "{{host}}/rest/v2/user".to_owned(),
                method: "GET".to_owned(),
                headers: vec![("Authorization".to_owned(), "Bearer {{token}}".to_owned())],
            },
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::GetUser => "getUser",
        }
    }
}

fn replace_placeholders(input: &str, replacements: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures<'_>| {
            replacements.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Substitute `{{key}}` placeholders in the path and every header value.
#[must_use]
pub fn resolve_api_config(
    template: &ApiTemplate,
    replacements: &HashMap<String, String>,
) -> ApiTemplate {
    ApiTemplate {
        path: replace_placeholders(&template.path, replacements),
        method: template.method.clone(),
        headers: template
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), replace_placeholders(value, replacements)))
            .collect(),
    }
}

/// Collapse runs of `/` into one, except right after a `:` (`proto://`).
#[must_use]
pub fn collapse_slashes(url: &str) -> String {
    REPEATED_SLASHES.replace_all(url, "$1/").into_owned()
}

/// Join a base host and a path with exactly one `/` between them.
#[must_use]
pub fn join_url(host: &str, path: &str) -> String {
    format!(
        "{}/{}",
        host.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// The `{success, message, data}` envelope the backend wraps responses in.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: T,
}

/// HTTP client shared by the connection workflow and templated calls.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
}

impl ApiClient {
    /// Build a client whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Client`] if the TLS backend fails to initialize.
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("backlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Client {
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }

    /// The underlying `reqwest` client.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Resolve the named template, issue the call, and decode the JSON body.
    ///
    /// `body` is sent as JSON unless the method is `GET` or `HEAD`.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Network`] if no response arrived (status 0).
    /// - [`ApiError::Http`] for non-success statuses, with the body if it was JSON.
    /// - [`ApiError::Decode`] if the success body does not match `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        call: ApiCall,
        replacements: &HashMap<String, String>,
        body: Option<&serde_json::Value>,
    ) -> Result<T, ApiError> {
        let config = resolve_api_config(&call.template(), replacements);
        let method =
            Method::from_bytes(config.method.as_bytes()).map_err(|_| ApiError::InvalidMethod {
                method: config.method.clone(),
            })?;
        let url = collapse_slashes(&config.path);
        debug!(call = call.name(), %method, %url, "api request");

        let mut req = self.http.request(method.clone(), &url);
        for (name, value) in &config.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            if method != Method::GET && method != Method::HEAD {
                req = req.json(body);
            }
        }

        let resp = req.send().await.map_err(|e| ApiError::Network {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ApiError::Network {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        if !status.is_success() {
            debug!(call = call.name(), status = status.as_u16(), "api call rejected");
            return Err(ApiError::Http {
                status: status.as_u16(),
                body: serde_json::from_str(&text).ok(),
            });
        }

        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| ApiError::Decode {
            url,
            reason: e.to_string(),
        })
    }

    /// Fetch the profile of the user `token` belongs to.
    ///
    /// # Errors
    ///
    /// Propagates [`request`](Self::request) errors; a body whose `data` is
    /// not a user profile is an [`ApiError::Decode`].
    pub async fn fetch_user(&self, host: &str, token: &str) -> Result<User, ApiError> {
        let replacements = HashMap::from([
            ("host".to_owned(), host.to_owned()),
            ("token".to_owned(), token.to_owned()),
        ]);
        let envelope: Envelope<User> = self.request(ApiCall::GetUser, &replacements, None).await?;
        Ok(envelope.data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::testing::{closed_port, serve};
    use crate::user::UserStatus;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn resolves_path_and_headers() {
        let resolved = resolve_api_config(
            &ApiCall::GetUser.template(),
            &map(&[("host", "http://x.com"), ("token", "abc")]),
        );
        assert_eq!(resolved.path, "http://x.com/rest/v2/user");
        assert_eq!(resolved.method, "GET");
        assert_eq!(
            resolved.headers,
            vec![("Authorization".to_owned(), "Bearer abc".to_owned())]
        );
    }

    #[test]
    fn unknown_placeholders_become_empty() {
        let template = ApiTemplate {
            path: "{{host}}/v1/{{missing}}/x".to_owned(),
            method: "GET".to_owned(),
            headers: vec![("X-Tenant".to_owned(), "{{tenant}}".to_owned())],
        };
        let resolved = resolve_api_config(&template, &map(&[("host", "h")]));
        assert_eq!(resolved.path, "h/v1//x");
        assert_eq!(resolved.headers[0].1, "");
    }

    #[test]
    fn double_slash_after_host_is_collapsed() {
        let template = ApiTemplate {
            path: "{{host}}//rest/v2/user".to_owned(),
            method: "GET".to_owned(),
            headers: Vec::new(),
        };
        let resolved = resolve_api_config(&template, &map(&[("host", "http://x.com")]));
        assert_eq!(collapse_slashes(&resolved.path), "http://x.com/rest/v2/user");
    }

    #[test]
    fn collapse_keeps_scheme_separator() {
        assert_eq!(
            collapse_slashes("https://a.com///b//c"),
            "https://a.com/b/c"
        );
        assert_eq!(collapse_slashes("http://a.com/b"), "http://a.com/b");
    }

    #[test]
    fn join_url_uses_one_separator() {
        assert_eq!(join_url("http://a/", "/ping"), "http://a/ping");
        assert_eq!(join_url("http://a", "ping"), "http://a/ping");
        assert_eq!(
            join_url("http://a/", "rest/v2/user/login"),
            "http://a/rest/v2/user/login"
        );
    }

    #[tokio::test]
    async fn fetch_user_sends_bearer_token() {
        let router = Router::new().route(
            "/rest/v2/user",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                if auth != "Bearer abc" {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"success": false})));
                }
                (
                    StatusCode::OK,
                    Json(json!({
                        "success": true,
                        "message": "ok",
                        "data": {
                            "username": "ops",
                            "email": "ops@example.com",
                            "confirmation": 1,
                            "status": 2
                        }
                    })),
                )
            }),
        );
        let host = serve(router).await;
        let client = ApiClient::new(DEFAULT_TIMEOUT).unwrap();

        let user = client.fetch_user(&host, "abc").await.unwrap();
        assert_eq!(user.username, "ops");
        assert_eq!(user.status, UserStatus::Active);

        let err = client.fetch_user(&host, "wrong").await.unwrap_err();
        assert_eq!(err.status(), 401);
        match err {
            ApiError::Http { body, .. } => {
                assert_eq!(body, Some(json!({"success": false})));
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let client = ApiClient::new(DEFAULT_TIMEOUT).unwrap();
        let err = client
            .fetch_user(&closed_port().await, "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Network { .. }));
        assert_eq!(err.status(), 0);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_network_error() {
        let router = Router::new().route(
            "/rest/v2/user",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let host = serve(router).await;
        let client = ApiClient::new(Duration::from_millis(100)).unwrap();

        let started = std::time::Instant::now();
        let err = client.fetch_user(&host, "abc").await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, ApiError::Network { .. }));
        assert_eq!(err.status(), 0);
    }

    #[tokio::test]
    async fn unexpected_body_is_decode_error() {
        let router = Router::new().route("/rest/v2/user", get(|| async { "not json" }));
        let host = serve(router).await;
        let client = ApiClient::new(DEFAULT_TIMEOUT).unwrap();
        let err = client.fetch_user(&host, "abc").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }
}

//! Backend server records and the form values they are built from.
//!
//! A [`ServerForm`] is what the operator submits; it carries the password
//! used once for the login call. A [`BackendServer`] is what the store keeps:
//! the same fields minus the password, plus a stable id, the bearer token
//! obtained at connect time, and a creation timestamp.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Stable identifier assigned to a record when it is first stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(Uuid);

impl ServerId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ServerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Values submitted through the "Configure Backend" form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerForm {
    pub name: String,
    pub description: Option<String>,
    /// Base URL of the backend, e.g. `https://monocon.example.com/`.
    pub host: String,
    pub username_or_email: String,
    pub password: String,
    /// Health-check route, always starting with `/`.
    pub ping_path: String,
    /// Mark this backend as the active one.
    pub in_use: bool,
}

impl ServerForm {
    /// Run the same checks the form applies before submission.
    ///
    /// # Errors
    ///
    /// Returns the first failing field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_details()?;
        if self.password.is_empty() {
            return Err(ValidationError::new("password", "Password is required"));
        }
        Ok(())
    }

    /// Checks applied in edit mode, where the password is not re-entered.
    ///
    /// # Errors
    ///
    /// Returns the first failing field.
    pub fn validate_details(&self) -> Result<(), ValidationError> {
        validate_common(&self.name, &self.host, &self.username_or_email, &self.ping_path)
    }
}

fn validate_common(
    name: &str,
    host: &str,
    username_or_email: &str,
    ping_path: &str,
) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name", "Name is required"));
    }
    if host.is_empty() {
        return Err(ValidationError::new("host", "Host is required"));
    }
    if username_or_email.is_empty() {
        return Err(ValidationError::new(
            "usernameOrEmail",
            "Username or email is required",
        ));
    }
    if ping_path.is_empty() {
        return Err(ValidationError::new("pingPath", "Ping path is required"));
    }
    if !ping_path.starts_with('/') {
        return Err(ValidationError::new(
            "pingPath",
            "Ping path must start with '/'",
        ));
    }
    Ok(())
}

/// One registered backend, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendServer {
    /// Records written before ids existed get one on load.
    #[serde(default = "ServerId::generate")]
    pub id: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub host: String,
    pub username_or_email: String,
    pub ping_path: String,
    #[serde(default)]
    pub in_use: bool,
    /// Bearer token from the login call; empty if never connected.
    #[serde(default)]
    pub authorization: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl BackendServer {
    /// Build a record from validated form values. The password is dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the form fails its checks.
    pub fn from_form(form: ServerForm, authorization: String) -> Result<Self, ValidationError> {
        form.validate()?;
        Ok(Self {
            id: ServerId::generate(),
            name: form.name,
            description: form.description.filter(|d| !d.is_empty()),
            host: form.host,
            username_or_email: form.username_or_email,
            ping_path: form.ping_path,
            in_use: form.in_use,
            authorization,
            created_at: Utc::now(),
        })
    }

    /// Check the stored-record invariants.
    ///
    /// # Errors
    ///
    /// Returns the first failing field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_common(&self.name, &self.host, &self.username_or_email, &self.ping_path)
    }

    /// Merge the fields present in `patch`, leaving the rest untouched.
    pub fn apply(&mut self, patch: ServerPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = Some(description).filter(|d| !d.is_empty());
        }
        if let Some(host) = patch.host {
            self.host = host;
        }
        if let Some(username) = patch.username_or_email {
            self.username_or_email = username;
        }
        if let Some(ping_path) = patch.ping_path {
            self.ping_path = ping_path;
        }
        if let Some(in_use) = patch.in_use {
            self.in_use = in_use;
        }
        if let Some(authorization) = patch.authorization {
            self.authorization = authorization;
        }
    }

    /// Host name for display, falling back to the raw host string.
    #[must_use]
    pub fn display_host(&self) -> String {
        reqwest::Url::parse(&self.host)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| self.host.clone())
    }

    /// Whether a login has ever succeeded for this record.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.authorization.is_empty()
    }
}

/// Partial update for a stored record. `None` fields are left as they are.
///
/// An empty `description` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub host: Option<String>,
    pub username_or_email: Option<String>,
    pub ping_path: Option<String>,
    pub in_use: Option<bool>,
    pub authorization: Option<String>,
}

impl ServerPatch {
    /// A patch that only flips the active flag.
    #[must_use]
    pub fn in_use(in_use: bool) -> Self {
        Self {
            in_use: Some(in_use),
            ..Self::default()
        }
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Prefill the form for editing. The password is never stored, so it
/// starts empty.
impl From<&BackendServer> for ServerForm {
    fn from(server: &BackendServer) -> Self {
        Self {
            name: server.name.clone(),
            description: server.description.clone(),
            host: server.host.clone(),
            username_or_email: server.username_or_email.clone(),
            password: String::new(),
            ping_path: server.ping_path.clone(),
            in_use: server.in_use,
        }
    }
}

/// Edit-mode submissions overwrite every form field; the password is not
/// kept and the token is left alone.
impl From<ServerForm> for ServerPatch {
    fn from(form: ServerForm) -> Self {
        Self {
            name: Some(form.name),
            description: Some(form.description.unwrap_or_default()),
            host: Some(form.host),
            username_or_email: Some(form.username_or_email),
            ping_path: Some(form.ping_path),
            in_use: Some(form.in_use),
            authorization: None,
        }
    }
}

//! The connection store, single source of truth for registered backends.
//!
//! The store is an explicit context object: build it with
//! [`ConnectionStore::load`], share it behind an `Arc`, and route every
//! mutation through its methods. Writers are serialized by an async
//! `RwLock` held across the persist step. Each mutation works on a copy of
//! the collection, writes that copy to storage, and only then swaps it in,
//! so a failed write leaves the in-memory state untouched.
//!
//! Persisted subset: `{version, backendServers, theme}` under [`STORE_KEY`].
//! The user profile is kept in memory only; it is derived from
//! a token and re-fetched whenever authorization details are shown.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use backlink_storage::{MemoryBackend, StorageBackend};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::server::{BackendServer, ServerForm, ServerId, ServerPatch};
use crate::user::User;

/// Storage key holding the persisted state.
pub const STORE_KEY: &str = "admin-app-backend-servers";

/// Version written with every save. Version 0 is the unversioned layout.
pub const STATE_VERSION: u32 = 1;

/// Console color theme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Light => "light",
            Self::Dark => "dark",
        })
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            other => Err(format!("unknown theme '{other}' (expected light or dark)")),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    backend_servers: Vec<BackendServer>,
    #[serde(default)]
    theme: Theme,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedStateRef<'a> {
    version: u32,
    backend_servers: &'a [BackendServer],
    theme: Theme,
}

/// Decode persisted bytes, migrating older layouts.
///
/// Unversioned data may still be wrapped in a `{"state": {...}}` envelope.
fn decode_state(bytes: &[u8]) -> Result<PersistedState, StoreError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.get("backendServers").is_none() {
        if let Some(inner) = value.get_mut("state").map(serde_json::Value::take) {
            value = inner;
        }
    }

    let mut state: PersistedState = serde_json::from_value(value)?;
    if state.version > STATE_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: state.version,
            supported: STATE_VERSION,
        });
    }
    if state.version < STATE_VERSION {
        info!(
            from = state.version,
            to = STATE_VERSION,
            servers = state.backend_servers.len(),
            "migrating persisted store"
        );
        state.version = STATE_VERSION;
    }

    // Older data may claim several active backends; the first one wins.
    if let Some(first) = state.backend_servers.iter().position(|s| s.in_use) {
        clear_other_active(&mut state.backend_servers, first);
    }
    Ok(state)
}

fn clear_other_active(servers: &mut [BackendServer], keep: usize) {
    for (i, server) in servers.iter_mut().enumerate() {
        if i != keep && server.in_use {
            debug!(id = %server.id, name = %server.name, "clearing previous active backend");
            server.in_use = false;
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    servers: Vec<BackendServer>,
    theme: Theme,
    user: Option<User>,
}

/// Persisted collection of backend servers plus the current user and theme.
pub struct ConnectionStore {
    backend: Arc<dyn StorageBackend>,
    state: RwLock<StoreState>,
}

impl fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStore").finish_non_exhaustive()
    }
}

impl ConnectionStore {
    /// Load the store from `backend`, starting empty if nothing was saved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend read fails,
    /// [`StoreError::Serialization`] if the saved state is corrupt, and
    /// [`StoreError::UnsupportedVersion`] if it was written by a newer build.
    pub async fn load(backend: Arc<dyn StorageBackend>) -> Result<Self, StoreError> {
        let persisted = match backend.get(STORE_KEY).await? {
            Some(bytes) => decode_state(&bytes)?,
            None => PersistedState::default(),
        };
        debug!(
            servers = persisted.backend_servers.len(),
            theme = %persisted.theme,
            "connection store loaded"
        );
        Ok(Self {
            backend,
            state: RwLock::new(StoreState {
                servers: persisted.backend_servers,
                theme: persisted.theme,
                user: None,
            }),
        })
    }

    /// An empty store over a throwaway in-memory backend.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Write the current state to storage.
    ///
    /// Mutations already persist themselves; this is for callers that want
    /// to force a rewrite (for example after migrating an old layout).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or the backend write fails.
    pub async fn save(&self) -> Result<(), StoreError> {
        let state = self.state.read().await;
        self.persist(&state.servers, state.theme).await
    }

    async fn persist(&self, servers: &[BackendServer], theme: Theme) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&PersistedStateRef {
            version: STATE_VERSION,
            backend_servers: servers,
            theme,
        })?;
        self.backend.put(STORE_KEY, &bytes).await?;
        Ok(())
    }

    /// Apply `f` to a copy of the collection, persist it, then swap it in.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<BackendServer>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.write().await;
        let mut servers = state.servers.clone();
        let out = f(&mut servers)?;
        self.persist(&servers, state.theme).await?;
        state.servers = servers;
        Ok(out)
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Validate `form` and append it as a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] (and mutates nothing) if the form
    /// fails its checks, or a storage error if the write fails.
    pub async fn add_server(
        &self,
        form: ServerForm,
        authorization: String,
    ) -> Result<ServerId, StoreError> {
        let server = BackendServer::from_form(form, authorization).inspect_err(|e| {
            warn!(field = e.field, reason = e.reason, "rejected invalid server");
        })?;
        let id = server.id;
        let name = server.name.clone();

        self.mutate(|servers| {
            servers.push(server);
            let last = servers.len() - 1;
            if servers[last].in_use {
                clear_other_active(servers, last);
            }
            Ok(())
        })
        .await?;

        info!(%id, %name, "backend server added");
        Ok(id)
    }

    /// Merge `patch` into the record with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id and
    /// [`StoreError::Validation`] if the merged record breaks an invariant.
    pub async fn update_server(&self, id: ServerId, patch: ServerPatch) -> Result<(), StoreError> {
        self.mutate(|servers| {
            let index = servers
                .iter()
                .position(|s| s.id == id)
                .ok_or(StoreError::NotFound { id })?;
            patch_at(servers, index, patch)
        })
        .await?;
        debug!(%id, "backend server updated");
        Ok(())
    }

    /// Positional variant of [`update_server`](Self::update_server).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexOutOfBounds`] if `index` is past the end.
    pub async fn update_server_at(&self, index: usize, patch: ServerPatch) -> Result<(), StoreError> {
        self.mutate(|servers| {
            check_index(servers, index)?;
            patch_at(servers, index, patch)
        })
        .await
    }

    /// Mark one record as the active backend, clearing the flag elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub async fn set_active(&self, id: ServerId) -> Result<(), StoreError> {
        self.update_server(id, ServerPatch::in_use(true)).await
    }

    /// Remove the record with the given id and return it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub async fn remove_server(&self, id: ServerId) -> Result<BackendServer, StoreError> {
        let removed = self
            .mutate(|servers| {
                let index = servers
                    .iter()
                    .position(|s| s.id == id)
                    .ok_or(StoreError::NotFound { id })?;
                Ok(servers.remove(index))
            })
            .await?;
        info!(%id, name = %removed.name, "backend server removed");
        Ok(removed)
    }

    /// Remove the record at `index`. Later records shift down by one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexOutOfBounds`] if `index` is past the end.
    pub async fn remove_server_at(&self, index: usize) -> Result<BackendServer, StoreError> {
        self.mutate(|servers| {
            check_index(servers, index)?;
            Ok(servers.remove(index))
        })
        .await
    }

    /// Remove every record.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub async fn reset_servers(&self) -> Result<(), StoreError> {
        self.mutate(|servers| {
            servers.clear();
            Ok(())
        })
        .await?;
        info!("backend servers reset");
        Ok(())
    }

    /// Replace the current user profile. Not persisted.
    pub async fn set_user(&self, user: Option<User>) {
        self.state.write().await.user = user;
    }

    /// Change and persist the theme.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails; the old theme is kept.
    pub async fn set_theme(&self, theme: Theme) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        self.persist(&state.servers, theme).await?;
        state.theme = theme;
        Ok(())
    }

    // ── Readers ──────────────────────────────────────────────────────

    /// Snapshot of all records in insertion order.
    pub async fn servers(&self) -> Vec<BackendServer> {
        self.state.read().await.servers.clone()
    }

    pub async fn server(&self, id: ServerId) -> Option<BackendServer> {
        let state = self.state.read().await;
        state.servers.iter().find(|s| s.id == id).cloned()
    }

    pub async fn server_at(&self, index: usize) -> Option<BackendServer> {
        self.state.read().await.servers.get(index).cloned()
    }

    /// Current position of a record, if it exists.
    pub async fn position(&self, id: ServerId) -> Option<usize> {
        let state = self.state.read().await;
        state.servers.iter().position(|s| s.id == id)
    }

    pub async fn active_server(&self) -> Option<BackendServer> {
        let state = self.state.read().await;
        state.servers.iter().find(|s| s.in_use).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.servers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.servers.is_empty()
    }

    pub async fn user(&self) -> Option<User> {
        self.state.read().await.user.clone()
    }

    pub async fn theme(&self) -> Theme {
        self.state.read().await.theme
    }
}

fn check_index(servers: &[BackendServer], index: usize) -> Result<(), StoreError> {
    if index >= servers.len() {
        return Err(StoreError::IndexOutOfBounds {
            index,
            len: servers.len(),
        });
    }
    Ok(())
}

fn patch_at(
    servers: &mut [BackendServer],
    index: usize,
    patch: ServerPatch,
) -> Result<(), StoreError> {
    let activates = patch.in_use == Some(true);
    let mut updated = servers[index].clone();
    updated.apply(patch);
    updated.validate().inspect_err(|e| {
        warn!(id = %updated.id, field = e.field, reason = e.reason, "rejected invalid update");
    })?;
    servers[index] = updated;
    if activates {
        clear_other_active(servers, index);
    }
    Ok(())
}

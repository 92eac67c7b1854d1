// src/state/store.rs
// Persisted server config, endpoint collection and last tunnel status

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::frp::config::write_atomically;
use crate::frp::types::{
    check_port_unique, next_available_port, EndpointSpec, TunnelServerConfig, ValidationError,
};
use crate::process::types::LaunchMethod;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatusRecord {
    pub is_active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub method: Option<LaunchMethod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub server: Option<TunnelServerConfig>,
    pub endpoints: Vec<EndpointSpec>,
    pub last_status: Option<TunnelStatusRecord>,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState>;
    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// Pretty JSON on disk, replaced atomically on every save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {:?}", self.path))?;
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse state file {:?}", self.path))
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        write_atomically(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to write state file {:?}", self.path))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<PersistedState>,
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<PersistedState> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Endpoint not found: {0}")]
    NotFound(String),

    #[error("Endpoint id already exists: {0}")]
    DuplicateId(String),

    #[error("missing server config")]
    MissingServerConfig,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Partial edit of an endpoint; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct EndpointUpdate {
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub enabled: Option<bool>,
}

/// Validated access to the persisted endpoint collection. Every mutation is a
/// full load-check-save under one lock, so a rejected change leaves the store untouched.
pub struct EndpointRegistry {
    store: Arc<dyn StateStore>,
    write_lock: Mutex<()>,
}

impl EndpointRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    fn mutate<T>(&self, change: impl FnOnce(&mut PersistedState) -> Result<T, RegistryError>) -> Result<T, RegistryError> {
        let _guard = self.write_lock.lock();
        let mut state = self.store.load()?;
        let result = change(&mut state)?;
        self.store.save(&state)?;
        Ok(result)
    }

    pub fn save_server_config(&self, server_addr: &str, server_port: u16, auth_token: &str) -> Result<TunnelServerConfig, RegistryError> {
        let config = TunnelServerConfig::new(server_addr, server_port, auth_token);
        config.validate()?;

        self.mutate(|state| {
            state.server = Some(config.clone());
            Ok(())
        })?;
        log::info!("Server config saved: {}", config.address());
        Ok(config)
    }

    pub fn server_config(&self) -> Result<Option<TunnelServerConfig>, RegistryError> {
        Ok(self.store.load()?.server)
    }

    /// Validate and append. An empty id gets a generated one.
    pub fn add_endpoint(&self, mut spec: EndpointSpec) -> Result<EndpointSpec, RegistryError> {
        if spec.id.trim().is_empty() {
            spec.id = EndpointSpec::generate_id();
        }
        spec.local_host = spec.local_host.trim().to_string();
        spec.validate()?;

        let added = self.mutate(|state| {
            if state.endpoints.iter().any(|e| e.id == spec.id) {
                return Err(RegistryError::DuplicateId(spec.id.clone()));
            }
            check_port_unique(spec.remote_port, &state.endpoints, None)?;
            state.endpoints.push(spec.clone());
            Ok(spec)
        })?;

        log::info!("Endpoint {} added on remote port {}", added.id, added.remote_port);
        Ok(added)
    }

    pub fn update_endpoint(&self, id: &str, update: EndpointUpdate) -> Result<EndpointSpec, RegistryError> {
        self.mutate(|state| {
            let index = state
                .endpoints
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let mut updated = state.endpoints[index].clone();
            if let Some(host) = update.local_host {
                updated.local_host = host.trim().to_string();
            }
            if let Some(port) = update.local_port {
                updated.local_port = port;
            }
            if let Some(port) = update.remote_port {
                updated.remote_port = port;
            }
            if let Some(enabled) = update.enabled {
                updated.enabled = enabled;
            }

            updated.validate()?;
            check_port_unique(updated.remote_port, &state.endpoints, Some(id))?;
            state.endpoints[index] = updated.clone();
            Ok(updated)
        })
    }

    pub fn remove_endpoint(&self, id: &str) -> Result<EndpointSpec, RegistryError> {
        let removed = self.mutate(|state| {
            let index = state
                .endpoints
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            Ok(state.endpoints.remove(index))
        })?;
        log::info!("Endpoint {} removed", removed.id);
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<EndpointSpec, RegistryError> {
        self.update_endpoint(
            id,
            EndpointUpdate {
                enabled: Some(enabled),
                ..EndpointUpdate::default()
            },
        )
    }

    pub fn endpoints(&self) -> Result<Vec<EndpointSpec>, RegistryError> {
        Ok(self.store.load()?.endpoints)
    }

    pub fn enabled_endpoints(&self) -> Result<Vec<EndpointSpec>, RegistryError> {
        Ok(self.endpoints()?.into_iter().filter(|e| e.enabled).collect())
    }

    pub fn next_available_port(&self) -> Result<Option<u16>, RegistryError> {
        Ok(next_available_port(&self.endpoints()?))
    }

    pub fn stream_url(&self, id: &str) -> Result<String, RegistryError> {
        let state = self.store.load()?;
        let server = state.server.ok_or(RegistryError::MissingServerConfig)?;
        let endpoint = state
            .endpoints
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(endpoint.stream_url(&server))
    }

    pub fn record_status(&self, record: TunnelStatusRecord) -> Result<(), RegistryError> {
        self.mutate(|state| {
            state.last_status = Some(record);
            Ok(())
        })
    }

    pub fn last_status(&self) -> Result<Option<TunnelStatusRecord>, RegistryError> {
        Ok(self.store.load()?.last_status)
    }
}

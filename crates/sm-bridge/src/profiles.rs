//! Saved connection profiles.
//!
//! Profiles remember where to connect and which AI model to use, so a client
//! can list them and fill in a `connect` message. They live in memory only and
//! never hold secrets: passwords, keys and AI API keys in a saved body are
//! dropped on the way in.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sm_core::error::ErrorCode;
use sm_core::types::ProfileId;
use tracing::info;

use crate::api_error::ApiError;
use crate::protocol::connect_target;

/// Upper bound on stored profiles.
pub const MAX_PROFILES: usize = 1024;

fn default_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileAiConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionProfile {
    pub id: ProfileId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub ai_config: Option<ProfileAiConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /api/configs`. Without an `id` a new profile is created;
/// with one, that profile is replaced and keeps its `created_at`.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveProfile {
    #[serde(default)]
    pub id: Option<ProfileId>,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub ai_config: Option<ProfileAiConfig>,
}

#[derive(Default)]
pub struct ProfileStore {
    profiles: DashMap<ProfileId, ConnectionProfile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All profiles, oldest first.
    pub fn list(&self) -> Vec<ConnectionProfile> {
        let mut all: Vec<ConnectionProfile> =
            self.profiles.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        all
    }

    pub fn get(&self, id: ProfileId) -> Result<ConnectionProfile, ApiError> {
        self.profiles
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| not_found(id))
    }

    pub fn save(&self, body: SaveProfile) -> Result<ConnectionProfile, ApiError> {
        let target = connect_target(&body.host, body.port, &body.username)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        if let Some(ai) = &body.ai_config {
            if ai.provider.trim().is_empty() || ai.model.trim().is_empty() {
                return Err(ApiError::BadRequest(
                    "ai_config needs a provider and a model".into(),
                ));
            }
        }

        let now = Utc::now();
        let id = body.id.unwrap_or_default();
        let name = body
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| target.host.clone());

        let created_at = match self.profiles.get(&id) {
            Some(existing) => existing.created_at,
            None if self.profiles.len() >= MAX_PROFILES => {
                return Err(ApiError::coded(
                    ErrorCode::ProtocolError,
                    format!("at most {MAX_PROFILES} profiles can be saved"),
                ));
            }
            None => now,
        };

        let profile = ConnectionProfile {
            id,
            name,
            host: target.host,
            port: target.port,
            username: target.username,
            ai_config: body.ai_config,
            created_at,
            updated_at: now,
        };
        self.profiles.insert(id, profile.clone());
        info!(profile = %id, name = %profile.name, "connection profile saved");
        Ok(profile)
    }

    pub fn remove(&self, id: ProfileId) -> Result<(), ApiError> {
        self.profiles
            .remove(&id)
            .map(|_| info!(profile = %id, "connection profile deleted"))
            .ok_or_else(|| not_found(id))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn not_found(id: ProfileId) -> ApiError {
    ApiError::coded(ErrorCode::ProfileNotFound, format!("profile {id} not found"))
}

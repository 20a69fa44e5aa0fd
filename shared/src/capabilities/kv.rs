use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{AlertId, EmergencyAlert, PinRecord, RideId, UnixTimeMs, UserId};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), StoreError> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path segments".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(StoreError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Alerts,
    CurrentAlert,
    Pins,
}

impl KeyNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            KeyNamespace::Alerts => "alerts",
            KeyNamespace::CurrentAlert => "alerts-current",
            KeyNamespace::Pins => "pins",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvValue {
    data: Vec<u8>,
    version: u64,
    created_at: u64,
    updated_at: u64,
}

impl KvValue {
    pub fn from_serializable<T: Serialize>(value: &T, now: UnixTimeMs) -> Result<Self, StoreError> {
        let data = serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        if data.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: data.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        Ok(Self {
            data,
            version: 1,
            created_at: now.0,
            updated_at: now.0,
        })
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_slice(&self.data).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    fn replace(&mut self, next: KvValue) {
        self.data = next.data;
        self.version = self.version.saturating_add(1);
        self.updated_at = next.updated_at;
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {key}")]
    NotFound { key: String },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {message} (retryable: {retryable})")]
    Unavailable { message: String, retryable: bool },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Durable keyed store for alerts. One active alert per user.
#[async_trait::async_trait]
pub trait AlertStore: Send + Sync {
    async fn create_alert(&self, alert: &EmergencyAlert) -> Result<(), StoreError>;
    async fn current_alert(&self, user_id: &UserId) -> Result<Option<EmergencyAlert>, StoreError>;
    async fn resolve_alert(
        &self,
        alert_id: &AlertId,
        at: UnixTimeMs,
    ) -> Result<EmergencyAlert, StoreError>;
}

/// Durable keyed store for pickup pins, keyed by ride.
#[async_trait::async_trait]
pub trait PinStore: Send + Sync {
    async fn get_pin(&self, ride_id: &RideId) -> Result<Option<PinRecord>, StoreError>;
    /// Stores `record` unless one already exists for the ride; returns whichever
    /// record is stored afterwards.
    async fn insert_pin_if_absent(&self, record: &PinRecord) -> Result<PinRecord, StoreError>;
}

/// In-process implementation of both stores. Values are JSON-encoded and
/// versioned the same way a shell-backed store persists them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, KvValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn version_of(&self, key: &KvKey) -> Option<u64> {
        self.entries.read().await.get(&key.raw()).map(KvValue::version)
    }
}

#[async_trait::async_trait]
impl AlertStore for MemoryStore {
    async fn create_alert(&self, alert: &EmergencyAlert) -> Result<(), StoreError> {
        let alert_key = KvKey::new(KeyNamespace::Alerts, alert.id().as_str())?;
        let current_key = KvKey::new(KeyNamespace::CurrentAlert, alert.user_id().as_str())?;
        let value = KvValue::from_serializable(alert, alert.timestamp())?;
        let pointer = KvValue::from_serializable(alert.id(), alert.timestamp())?;

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&current_key.raw()) {
            let existing_id: AlertId = existing.deserialize()?;
            return Err(StoreError::Conflict(format!(
                "user {} already has active alert {existing_id}",
                alert.user_id()
            )));
        }
        entries.insert(alert_key.raw(), value);
        entries.insert(current_key.raw(), pointer);
        debug!(alert_id = %alert.id(), "alert stored");
        Ok(())
    }

    async fn current_alert(&self, user_id: &UserId) -> Result<Option<EmergencyAlert>, StoreError> {
        let current_key = KvKey::new(KeyNamespace::CurrentAlert, user_id.as_str())?;
        let entries = self.entries.read().await;
        let Some(pointer) = entries.get(&current_key.raw()) else {
            return Ok(None);
        };
        let alert_id: AlertId = pointer.deserialize()?;
        let alert_key = KvKey::new(KeyNamespace::Alerts, alert_id.as_str())?;
        entries
            .get(&alert_key.raw())
            .map(KvValue::deserialize)
            .transpose()
    }

    async fn resolve_alert(
        &self,
        alert_id: &AlertId,
        at: UnixTimeMs,
    ) -> Result<EmergencyAlert, StoreError> {
        let alert_key = KvKey::new(KeyNamespace::Alerts, alert_id.as_str())?;
        let mut entries = self.entries.write().await;
        let stored = entries
            .get_mut(&alert_key.raw())
            .ok_or_else(|| StoreError::NotFound {
                key: alert_key.raw(),
            })?;

        let mut alert: EmergencyAlert = stored.deserialize()?;
        if alert.is_active() {
            alert.resolve(at);
            stored.replace(KvValue::from_serializable(&alert, at)?);
        }

        let current_key = KvKey::new(KeyNamespace::CurrentAlert, alert.user_id().as_str())?;
        let points_here = entries
            .get(&current_key.raw())
            .map(KvValue::deserialize::<AlertId>)
            .transpose()?
            .is_some_and(|id| &id == alert_id);
        if points_here {
            entries.remove(&current_key.raw());
        }
        Ok(alert)
    }
}

#[async_trait::async_trait]
impl PinStore for MemoryStore {
    async fn get_pin(&self, ride_id: &RideId) -> Result<Option<PinRecord>, StoreError> {
        let key = KvKey::new(KeyNamespace::Pins, ride_id.as_str())?;
        self.entries
            .read()
            .await
            .get(&key.raw())
            .map(KvValue::deserialize)
            .transpose()
    }

    async fn insert_pin_if_absent(&self, record: &PinRecord) -> Result<PinRecord, StoreError> {
        let key = KvKey::new(KeyNamespace::Pins, record.ride_id.as_str())?;
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&key.raw()) {
            return existing.deserialize();
        }
        entries.insert(key.raw(), KvValue::from_serializable(record, record.created_at)?);
        Ok(record.clone())
    }
}

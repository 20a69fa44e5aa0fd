use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SafetyError;

pub const DEFAULT_COUNTDOWN_SECONDS: u32 = 5;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LOCATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_EMERGENCY_NUMBER: &str = "911";
pub const DEFAULT_DIAL_CODE: &str = "1";
pub const DEFAULT_PIN_CACHE_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_max_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): exponential, capped,
    /// plus `jitter_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_delay_ms);
        Duration::from_millis(capped.saturating_add(jitter_ms))
    }

    #[must_use]
    pub fn jitter(&self) -> u64 {
        if self.jitter_max_ms == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..self.jitter_max_ms)
    }
}

/// Tunables handed over by the shell, usually as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub countdown_seconds: u32,
    pub tick_interval_ms: u64,
    pub location_timeout_ms: u64,
    pub emergency_services_number: String,
    /// Country dial code (digits only) for normalizing national numbers.
    pub default_dial_code: String,
    pub notification_retry: RetryPolicy,
    pub pin_cache_capacity: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            countdown_seconds: DEFAULT_COUNTDOWN_SECONDS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            location_timeout_ms: DEFAULT_LOCATION_TIMEOUT_MS,
            emergency_services_number: DEFAULT_EMERGENCY_NUMBER.to_string(),
            default_dial_code: DEFAULT_DIAL_CODE.to_string(),
            notification_retry: RetryPolicy::default(),
            pin_cache_capacity: DEFAULT_PIN_CACHE_CAPACITY,
        }
    }
}

impl SafetyConfig {
    pub fn from_json(raw: &str) -> Result<Self, SafetyError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| SafetyError::InvalidConfig(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SafetyError> {
        if self.countdown_seconds == 0 {
            return Err(SafetyError::InvalidConfig(
                "countdown_seconds must be > 0".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(SafetyError::InvalidConfig("tick_interval_ms must be > 0".into()));
        }
        if self.location_timeout_ms == 0 {
            return Err(SafetyError::InvalidConfig(
                "location_timeout_ms must be > 0".into(),
            ));
        }
        if self.emergency_services_number.trim().is_empty() {
            return Err(SafetyError::InvalidConfig(
                "emergency_services_number cannot be empty".into(),
            ));
        }
        if self.default_dial_code.is_empty()
            || self.default_dial_code.len() > 3
            || !self.default_dial_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(SafetyError::InvalidConfig(format!(
                "default_dial_code '{}' must be 1-3 digits",
                self.default_dial_code
            )));
        }
        if self.notification_retry.max_attempts == 0 {
            return Err(SafetyError::InvalidConfig(
                "notification_retry.max_attempts must be > 0".into(),
            ));
        }
        if self.pin_cache_capacity == 0 {
            return Err(SafetyError::InvalidConfig(
                "pin_cache_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }
}

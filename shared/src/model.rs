use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

pub const PIN_LENGTH: usize = 4;
pub const MIN_E164_DIGITS: usize = 8;
pub const MAX_E164_DIGITS: usize = 15;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid coordinate: lat={0}, lon={1}")]
    InvalidCoordinate(f64, f64),
    #[error("invalid phone number '{raw}': {reason}")]
    InvalidPhoneNumber { raw: String, reason: &'static str },
    #[error("pin must be exactly 4 ascii digits")]
    InvalidPin,
    #[error("identifier cannot be empty")]
    EmptyId,
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
                let s = s.into();
                if s.trim().is_empty() {
                    return Err(ValidationError::EmptyId);
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(AlertId);
typed_id!(RideId);
typed_id!(UserId);
typed_id!(ContactId);

impl AlertId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }
}

/// Validated geographic coordinates
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        if !latitude.is_finite()
            || !longitude.is_finite()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(ValidationError::InvalidCoordinate(latitude, longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    #[must_use]
    pub const fn latitude(self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub const fn longitude(self) -> f64 {
        self.longitude
    }
}

// --- Emergency alerts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    Panic,
    Medical,
    Accident,
    Harassment,
    Other,
}

impl EmergencyType {
    pub const ALL: [Self; 5] = [
        Self::Panic,
        Self::Medical,
        Self::Accident,
        Self::Harassment,
        Self::Other,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::Medical => "medical",
            Self::Accident => "accident",
            Self::Harassment => "harassment",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// A raised distress signal. Only the emergency engine constructs or resolves
/// these; everything else sees snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    id: AlertId,
    user_id: UserId,
    emergency_type: EmergencyType,
    timestamp: UnixTimeMs,
    location: Option<Coordinates>,
    status: AlertStatus,
    resolved_at: Option<UnixTimeMs>,
}

impl EmergencyAlert {
    pub(crate) fn new(
        user_id: UserId,
        emergency_type: EmergencyType,
        timestamp: UnixTimeMs,
        location: Option<Coordinates>,
    ) -> Self {
        Self {
            id: AlertId::generate(),
            user_id,
            emergency_type,
            timestamp,
            location,
            status: AlertStatus::Active,
            resolved_at: None,
        }
    }

    pub(crate) fn resolve(&mut self, at: UnixTimeMs) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(at);
    }

    pub fn id(&self) -> &AlertId {
        &self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn emergency_type(&self) -> EmergencyType {
        self.emergency_type
    }

    pub fn timestamp(&self) -> UnixTimeMs {
        self.timestamp
    }

    pub fn location(&self) -> Option<Coordinates> {
        self.location
    }

    pub fn status(&self) -> AlertStatus {
        self.status
    }

    pub fn resolved_at(&self) -> Option<UnixTimeMs> {
        self.resolved_at
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

// --- Contacts ---

/// E.164 phone number, always `+` followed by 8 to 15 digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accepts an already-normalized E.164 number.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let Some(digits) = raw.strip_prefix('+') else {
            return Err(ValidationError::InvalidPhoneNumber {
                raw: raw.to_string(),
                reason: "missing leading '+'",
            });
        };
        Self::from_digits(raw, digits)
    }

    /// Normalizes a user-entered number, filling in `dial_code` for national
    /// numbers.
    pub fn normalize(raw: &str, dial_code: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let international = trimmed.starts_with('+');
        let mut digits: String = trimmed
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '+'))
            .collect();

        if !international {
            if let Some(rest) = digits.strip_prefix("00") {
                digits = rest.to_string();
            } else {
                let national = digits.strip_prefix('0').unwrap_or(&digits);
                digits = format!("{dial_code}{national}");
            }
        }

        Self::from_digits(raw, &digits)
    }

    fn from_digits(raw: &str, digits: &str) -> Result<Self, ValidationError> {
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::InvalidPhoneNumber {
                raw: raw.to_string(),
                reason: "contains non-digit characters",
            });
        }
        if !(MIN_E164_DIGITS..=MAX_E164_DIGITS).contains(&digits.len()) {
            return Err(ValidationError::InvalidPhoneNumber {
                raw: raw.to_string(),
                reason: "wrong number of digits",
            });
        }
        if digits.starts_with('0') {
            return Err(ValidationError::InvalidPhoneNumber {
                raw: raw.to_string(),
                reason: "country code cannot start with 0",
            });
        }
        Ok(Self(format!("+{digits}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: ContactId,
    pub name: String,
    pub phone_number: PhoneNumber,
    /// Free text ("sister", "flatmate", ...).
    pub relationship: String,
    pub is_primary: bool,
}

// --- Pickup pin ---

/// Four-digit pickup secret. Leading zeros are significant.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pin(String);

impl Pin {
    pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        if !Self::is_well_formed(&s) {
            return Err(ValidationError::InvalidPin);
        }
        Ok(Self(s))
    }

    pub(crate) fn from_digits(digits: [u8; PIN_LENGTH]) -> Self {
        Self(digits.iter().map(|d| char::from(b'0' + d % 10)).collect())
    }

    pub fn is_well_formed(s: &str) -> bool {
        s.len() == PIN_LENGTH && s.bytes().all(|b| b.is_ascii_digit())
    }

    /// Byte-exact comparison that always walks the whole candidate.
    pub fn matches(&self, candidate: &str) -> bool {
        let ours = self.0.as_bytes();
        let theirs = candidate.as_bytes();
        if ours.len() != theirs.len() {
            return false;
        }
        ours.iter()
            .zip(theirs)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl TryFrom<String> for Pin {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Pin> for String {
    fn from(value: Pin) -> Self {
        value.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub ride_id: RideId,
    pub pin: Pin,
    pub created_at: UnixTimeMs,
}

//! Pickup PIN Verification Protocol.
//!
//! Both devices resolve a ride to the same [`PinRecord`] through the
//! [`PinStore`]; there is no live handshake between them. Records are
//! immutable once written, so the local LRU never goes stale.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroize;

use crate::capabilities::{PinStore, Providers, RandomError, RandomProvider};
use crate::error::SafetyError;
use crate::model::{Pin, PinRecord, RideId, PIN_LENGTH};
use crate::timer::Clock;

/// Largest multiple of 10 that fits in a byte; bytes at or above it are
/// redrawn so every digit is equally likely.
const DIGIT_REJECTION_BOUND: u8 = 250;
const MAX_DRAW_ROUNDS: usize = 32;

pub struct PinProtocol {
    store: Arc<dyn PinStore>,
    random: Arc<dyn RandomProvider>,
    clock: Arc<dyn Clock>,
    cache: Mutex<LruCache<RideId, PinRecord>>,
}

impl PinProtocol {
    pub fn new(cache_capacity: usize, providers: &Providers) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: providers.pins.clone(),
            random: providers.random.clone(),
            clock: providers.clock.clone(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The issued pin for `ride_id`, or `None`. Never creates one.
    #[instrument(skip(self, ride_id), fields(ride_id = %ride_id))]
    pub async fn get_pin_for_ride(&self, ride_id: &RideId) -> Result<Option<Pin>, SafetyError> {
        Ok(self.lookup(ride_id).await?.map(|record| record.pin))
    }

    /// Issues a pin for `ride_id` unless one exists, in which case the
    /// existing pin comes back unchanged. If another device wins the write
    /// race, its pin is returned.
    #[instrument(skip(self, ride_id), fields(ride_id = %ride_id))]
    pub async fn create_pin_for_ride(&self, ride_id: &RideId) -> Result<Pin, SafetyError> {
        if let Some(existing) = self.lookup(ride_id).await? {
            debug!("pin already issued");
            return Ok(existing.pin);
        }

        let record = PinRecord {
            ride_id: ride_id.clone(),
            pin: self.generate()?,
            created_at: self.clock.now(),
        };
        let stored = self.store.insert_pin_if_absent(&record).await?;
        if stored.pin != record.pin {
            info!("pin was issued concurrently, using stored record");
        } else {
            info!("pickup pin issued");
        }
        self.remember(stored.clone());
        Ok(stored.pin)
    }

    /// `Ok(true)` only when `candidate` is byte-for-byte the issued pin.
    /// Malformed candidates and rides with no pin are `Ok(false)`.
    #[instrument(skip(self, ride_id, candidate), fields(ride_id = %ride_id))]
    pub async fn verify_pin(&self, ride_id: &RideId, candidate: &str) -> Result<bool, SafetyError> {
        if !Pin::is_well_formed(candidate) {
            debug!("malformed pin candidate");
            return Ok(false);
        }
        let Some(record) = self.lookup(ride_id).await? else {
            warn!("verification against a ride with no issued pin");
            return Ok(false);
        };
        let matched = record.pin.matches(candidate);
        info!(matched, "pickup pin checked");
        Ok(matched)
    }

    pub fn reset(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    async fn lookup(&self, ride_id: &RideId) -> Result<Option<PinRecord>, SafetyError> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(ride_id)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let record = self.store.get_pin(ride_id).await?;
        if let Some(record) = &record {
            self.remember(record.clone());
        }
        Ok(record)
    }

    fn remember(&self, record: PinRecord) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(record.ride_id.clone(), record);
    }

    /// Each digit is drawn independently and uniformly; leading zeros stay.
    fn generate(&self) -> Result<Pin, RandomError> {
        let mut digits = [0u8; PIN_LENGTH];
        let mut buf = [0u8; PIN_LENGTH * 2];
        let mut filled = 0;

        for _ in 0..MAX_DRAW_ROUNDS {
            self.random.fill(&mut buf)?;
            for &byte in buf.iter().filter(|b| **b < DIGIT_REJECTION_BOUND) {
                if filled == PIN_LENGTH {
                    break;
                }
                digits[filled] = byte % 10;
                filled += 1;
            }
            if filled == PIN_LENGTH {
                break;
            }
        }
        buf.zeroize();

        if filled < PIN_LENGTH {
            digits.zeroize();
            return Err(RandomError::Unavailable);
        }
        let pin = Pin::from_digits(digits);
        digits.zeroize();
        Ok(pin)
    }
}

//! The surface the UI calls. Holds no state of its own beyond the two
//! engines and the event bus they share.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::capabilities::Providers;
use crate::config::SafetyConfig;
use crate::emergency::{EmergencyEngine, EmergencyState};
use crate::error::SafetyError;
use crate::escalation::{Escalation, NotificationStatus};
use crate::event::{EventBus, SafetyEvent};
use crate::model::{
    AlertId, EmergencyAlert, EmergencyContact, EmergencyType, PhoneNumber, Pin, RideId, UserId,
    ValidationError,
};
use crate::pin::PinProtocol;
use crate::pin_entry::PinEntrySession;

/// One per running app. Construct at the root and pass it down.
pub struct SafetyCore {
    config: SafetyConfig,
    engine: Arc<EmergencyEngine>,
    escalation: Arc<Escalation>,
    pins: Arc<PinProtocol>,
    events: EventBus,
}

impl SafetyCore {
    pub fn new(config: SafetyConfig, providers: Providers) -> Result<Self, SafetyError> {
        config.validate()?;
        let events = EventBus::new();
        let escalation = Arc::new(Escalation::new(&config, &providers, events.clone()));
        let engine = Arc::new(EmergencyEngine::new(
            config.clone(),
            &providers,
            escalation.clone(),
            events.clone(),
        ));
        let pins = Arc::new(PinProtocol::new(config.pin_cache_capacity, &providers));
        info!(
            countdown_seconds = config.countdown_seconds,
            "safety core ready"
        );
        Ok(Self {
            config,
            engine,
            escalation,
            pins,
            events,
        })
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    // --- Session ---

    pub async fn set_session(&self, user: Option<UserId>) {
        self.engine.set_session(user).await;
    }

    pub async fn restore(&self) -> Result<Option<EmergencyAlert>, SafetyError> {
        self.engine.restore().await
    }

    // --- Emergency ---

    pub async fn start_countdown(&self, emergency_type: EmergencyType) -> Result<(), SafetyError> {
        self.engine.start_countdown(emergency_type).await
    }

    pub async fn cancel_countdown(&self) -> Result<(), SafetyError> {
        self.engine.cancel_countdown().await
    }

    pub async fn trigger_now(
        &self,
        emergency_type: EmergencyType,
    ) -> Result<EmergencyAlert, SafetyError> {
        self.engine.trigger_now(emergency_type).await
    }

    pub fn has_active_emergency(&self) -> bool {
        self.engine.has_active_emergency()
    }

    pub fn current_emergency(&self) -> Option<EmergencyAlert> {
        self.engine.current_emergency()
    }

    pub fn emergency_state(&self) -> EmergencyState {
        self.engine.state()
    }

    pub async fn resolve_emergency(&self) -> Result<Option<EmergencyAlert>, SafetyError> {
        self.engine.resolve_emergency().await
    }

    pub async fn call_emergency_services(&self) -> Result<(), SafetyError> {
        self.escalation.call_emergency_services().await
    }

    pub async fn call_primary_contact(&self) -> Result<EmergencyContact, SafetyError> {
        self.escalation.call_primary_contact().await
    }

    pub fn notification_status(&self, alert_id: &AlertId) -> Option<NotificationStatus> {
        self.escalation.notification_status(alert_id)
    }

    /// Normalizes a number typed into the contacts form to E.164 using the
    /// configured country dial code.
    pub fn normalize_phone_number(&self, raw: &str) -> Result<PhoneNumber, ValidationError> {
        PhoneNumber::normalize(raw, &self.config.default_dial_code)
    }

    // --- Pickup pin ---

    pub async fn get_pin_for_ride(&self, ride_id: &RideId) -> Result<Option<Pin>, SafetyError> {
        self.pins.get_pin_for_ride(ride_id).await
    }

    pub async fn create_pin_for_ride(&self, ride_id: &RideId) -> Result<Pin, SafetyError> {
        self.pins.create_pin_for_ride(ride_id).await
    }

    pub async fn verify_pin(&self, ride_id: &RideId, candidate: &str) -> Result<bool, SafetyError> {
        self.pins.verify_pin(ride_id, candidate).await
    }

    /// Opens the driver's entry modal for `ride_id`.
    pub fn open_pin_entry(&self, ride_id: RideId) -> PinEntrySession {
        PinEntrySession::new(ride_id, self.pins.clone(), self.events.clone())
    }

    // --- Observation ---

    pub fn subscribe(&self) -> watch::Receiver<EmergencyState> {
        self.engine.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SafetyEvent> {
        self.events.subscribe()
    }

    /// Drops local state: engine state, timers, notification statuses and
    /// the pin cache. The session and the store are left alone, so an alert
    /// still active there is reported again by `restore` or the next trigger.
    pub async fn reset(&self) {
        self.engine.reset().await;
        self.pins.reset();
    }
}

//! Emergency Alert Engine.
//!
//! Owns the single "is there an active emergency" answer. Transitions are
//! serialized through one async mutex; the latest state is mirrored into a
//! `watch` channel so queries never wait on an in-flight trigger.
//!
//! ```text
//! Idle ──start──▶ CountdownPending ──expiry──▶ Triggering ──▶ Active ──resolve──▶ Idle
//!   │                 │      └──cancel──▶ Idle      │
//!   └──trigger_now────┴──trigger_now──▶ Triggering  └──failure──▶ Idle
//! ```
//!
//! A trigger runs on its own task once started, so dropping the caller's
//! future never leaves the engine half way through a transition.

use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::capabilities::{AlertStore, LocationProvider, Providers, StoreError};
use crate::config::SafetyConfig;
use crate::error::{AppError, SafetyError};
use crate::escalation::Escalation;
use crate::event::{EventBus, SafetyEvent};
use crate::model::{Coordinates, EmergencyAlert, EmergencyType, UserId};
use crate::timer::{self, Clock, Generation, GenerationToken, TickControl, TimerHandle};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EmergencyState {
    Idle,
    CountdownPending {
        emergency_type: EmergencyType,
        seconds_remaining: u32,
    },
    /// Reading location and recording the alert.
    Triggering {
        emergency_type: EmergencyType,
    },
    Active(EmergencyAlert),
}

impl EmergencyState {
    pub fn name(&self) -> &'static str {
        match self {
            EmergencyState::Idle => "idle",
            EmergencyState::CountdownPending { .. } => "countdown_pending",
            EmergencyState::Triggering { .. } => "triggering",
            EmergencyState::Active(_) => "active",
        }
    }

    pub fn active_alert(&self) -> Option<&EmergencyAlert> {
        match self {
            EmergencyState::Active(alert) => Some(alert),
            _ => None,
        }
    }
}

struct Core {
    session: Option<UserId>,
    generation: Generation,
    countdown: Option<TimerHandle>,
}

impl Core {
    /// Invalidates any scheduled tick and stops its task.
    fn stop_countdown(&mut self) {
        self.generation.advance();
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
    }
}

pub struct EmergencyEngine {
    core: Mutex<Core>,
    state: watch::Sender<EmergencyState>,
    config: SafetyConfig,
    location: Arc<dyn LocationProvider>,
    alerts: Arc<dyn AlertStore>,
    clock: Arc<dyn Clock>,
    escalation: Arc<Escalation>,
    events: EventBus,
}

impl EmergencyEngine {
    pub fn new(
        config: SafetyConfig,
        providers: &Providers,
        escalation: Arc<Escalation>,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(EmergencyState::Idle);
        Self {
            core: Mutex::new(Core {
                session: None,
                generation: Generation::new(),
                countdown: None,
            }),
            state,
            config,
            location: providers.location.clone(),
            alerts: providers.alerts.clone(),
            clock: providers.clock.clone(),
            escalation,
            events,
        }
    }

    // --- Queries ---

    pub fn state(&self) -> EmergencyState {
        self.state.borrow().clone()
    }

    pub fn has_active_emergency(&self) -> bool {
        matches!(*self.state.borrow(), EmergencyState::Active(_))
    }

    pub fn current_emergency(&self) -> Option<EmergencyAlert> {
        self.state.borrow().active_alert().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<EmergencyState> {
        self.state.subscribe()
    }

    // --- Session ---

    pub async fn set_session(&self, user: Option<UserId>) {
        let mut core = self.core.lock().await;
        info!(signed_in = user.is_some(), "safety session changed");
        core.session = user;
    }

    /// Re-enters `Active` if the store still holds an active alert for the
    /// session user. Used once at launch.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<Option<EmergencyAlert>, SafetyError> {
        let core = self.core.lock().await;
        match self.state() {
            EmergencyState::Active(alert) => return Ok(Some(alert)),
            EmergencyState::Idle => {}
            other => {
                return Err(SafetyError::InvalidTransition {
                    operation: "restore",
                    state: other.name(),
                })
            }
        }
        let user = core.session.clone().ok_or(SafetyError::NoSession)?;

        match self.alerts.current_alert(&user).await? {
            Some(alert) if alert.is_active() => {
                info!(alert_id = %alert.id(), "restored active emergency");
                self.set_state(EmergencyState::Active(alert.clone()));
                Ok(Some(alert))
            }
            _ => Ok(None),
        }
    }

    // --- Countdown ---

    #[instrument(skip(self))]
    pub async fn start_countdown(
        self: &Arc<Self>,
        emergency_type: EmergencyType,
    ) -> Result<(), SafetyError> {
        let mut core = self.core.lock().await;
        match self.state() {
            EmergencyState::Active(existing) => {
                warn!(alert_id = %existing.id(), "countdown rejected, alert already active");
                return Err(SafetyError::AlreadyActive {
                    existing: Box::new(existing),
                });
            }
            EmergencyState::Idle => {}
            other => {
                return Err(SafetyError::InvalidTransition {
                    operation: "start countdown",
                    state: other.name(),
                });
            }
        }

        core.stop_countdown();
        let token = core.generation.current();
        let seconds = self.config.countdown_seconds;

        self.set_state(EmergencyState::CountdownPending {
            emergency_type,
            seconds_remaining: seconds,
        });
        self.events.publish(SafetyEvent::CountdownStarted {
            emergency_type,
            seconds_remaining: seconds,
        });
        info!(seconds, "emergency countdown started");

        let engine = Arc::downgrade(self);
        core.countdown = Some(timer::repeating(
            self.config.tick_interval(),
            seconds,
            move |remaining| tick(engine.clone(), token, emergency_type, remaining),
        ));
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn cancel_countdown(&self) -> Result<(), SafetyError> {
        let mut core = self.core.lock().await;
        let emergency_type = match self.state() {
            EmergencyState::CountdownPending { emergency_type, .. } => emergency_type,
            other => {
                return Err(SafetyError::InvalidTransition {
                    operation: "cancel countdown",
                    state: other.name(),
                })
            }
        };

        core.stop_countdown();
        self.set_state(EmergencyState::Idle);
        self.events
            .publish(SafetyEvent::CountdownCancelled { emergency_type });
        info!("emergency countdown cancelled");
        Ok(())
    }

    async fn on_tick(
        &self,
        token: GenerationToken,
        emergency_type: EmergencyType,
        remaining: u32,
    ) -> TickControl {
        let mut core = self.core.lock().await;
        if !core.generation.is_current(token) {
            debug!("stale countdown tick ignored");
            return TickControl::Stop;
        }

        if remaining > 0 {
            self.set_state(EmergencyState::CountdownPending {
                emergency_type,
                seconds_remaining: remaining,
            });
            self.events.publish(SafetyEvent::CountdownTick {
                emergency_type,
                seconds_remaining: remaining,
            });
            return TickControl::Continue;
        }

        // This tick runs inside the countdown task; detach rather than abort it.
        core.countdown = None;
        info!("emergency countdown expired");
        if let Err(e) = self.trigger_locked(&mut core, emergency_type).await {
            self.events
                .publish(SafetyEvent::TriggerFailed(Box::new(AppError::from(e))));
        }
        TickControl::Stop
    }

    // --- Trigger ---

    /// Raises an alert immediately, skipping or pre-empting any countdown.
    /// The work continues to completion even if this future is dropped.
    #[instrument(skip(self))]
    pub async fn trigger_now(
        self: &Arc<Self>,
        emergency_type: EmergencyType,
    ) -> Result<EmergencyAlert, SafetyError> {
        let engine = Arc::clone(self);
        let commit = tokio::spawn(
            async move {
                let mut core = engine.core.lock().await;
                engine.trigger_locked(&mut core, emergency_type).await
            }
            .in_current_span(),
        );

        match commit.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "trigger task did not finish");
                self.settle_interrupted().await;
                Err(SafetyError::Interrupted {
                    operation: "trigger",
                })
            }
        }
    }

    async fn trigger_locked(
        &self,
        core: &mut Core,
        emergency_type: EmergencyType,
    ) -> Result<EmergencyAlert, SafetyError> {
        if let EmergencyState::Active(existing) = self.state() {
            warn!(alert_id = %existing.id(), "trigger rejected, alert already active");
            return Err(SafetyError::AlreadyActive {
                existing: Box::new(existing),
            });
        }
        core.stop_countdown();

        let Some(user) = core.session.clone() else {
            error!("trigger without a session");
            self.set_state(EmergencyState::Idle);
            return Err(SafetyError::NoSession);
        };
        self.set_state(EmergencyState::Triggering { emergency_type });

        let location = self.read_location().await;
        let alert = EmergencyAlert::new(user, emergency_type, self.clock.now(), location);

        if let Err(e) = self.alerts.create_alert(&alert).await {
            return Err(self.record_failed(alert.user_id(), e).await);
        }

        info!(
            alert_id = %alert.id(),
            has_location = alert.location().is_some(),
            "emergency alert active"
        );
        self.set_state(EmergencyState::Active(alert.clone()));
        self.events
            .publish(SafetyEvent::AlertTriggered(Box::new(alert.clone())));
        self.escalation.spawn_notify(alert.clone());
        Ok(alert)
    }

    /// A conflict means the store already holds an active alert this engine
    /// never loaded (another device, or a relaunch without `restore`). That
    /// alert is adopted and reported as the one already active.
    async fn record_failed(&self, user: &UserId, cause: StoreError) -> SafetyError {
        if matches!(cause, StoreError::Conflict(_)) {
            match self.alerts.current_alert(user).await {
                Ok(Some(existing)) if existing.is_active() => {
                    warn!(
                        alert_id = %existing.id(),
                        "store already holds an active alert, adopting it"
                    );
                    self.set_state(EmergencyState::Active(existing.clone()));
                    return SafetyError::AlreadyActive {
                        existing: Box::new(existing),
                    };
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not load the conflicting alert"),
            }
        }

        error!(error = %cause, "failed to record emergency alert");
        self.set_state(EmergencyState::Idle);
        SafetyError::Persistence(cause)
    }

    /// Only reachable if the trigger task panicked.
    async fn settle_interrupted(&self) {
        let _core = self.core.lock().await;
        if let EmergencyState::Triggering { .. } = self.state() {
            self.set_state(EmergencyState::Idle);
        }
    }

    async fn read_location(&self) -> Option<Coordinates> {
        let timeout = self.config.location_timeout();
        match tokio::time::timeout(timeout, self.location.current_location()).await {
            Ok(Ok(fix)) => Some(fix),
            Ok(Err(e)) => {
                warn!(error = %e, "location unavailable, raising alert without it");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.location_timeout_ms,
                    "location read timed out, raising alert without it"
                );
                None
            }
        }
    }

    // --- Resolution ---

    /// Resolves the active alert. Outside `Active` this is a no-op and
    /// returns `Ok(None)`. A store failure leaves the alert active.
    #[instrument(skip(self))]
    pub async fn resolve_emergency(&self) -> Result<Option<EmergencyAlert>, SafetyError> {
        let _core = self.core.lock().await;
        let EmergencyState::Active(alert) = self.state() else {
            debug!("resolve with no active alert, nothing to do");
            return Ok(None);
        };

        let resolved = match self.alerts.resolve_alert(alert.id(), self.clock.now()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(alert_id = %alert.id(), error = %e, "failed to resolve emergency alert");
                return Err(SafetyError::Persistence(e));
            }
        };

        info!(alert_id = %resolved.id(), "emergency alert resolved");
        self.set_state(EmergencyState::Idle);
        self.events
            .publish(SafetyEvent::AlertResolved(Box::new(resolved.clone())));
        Ok(Some(resolved))
    }

    /// Back to `Idle` with every timer invalidated. The session is kept, and
    /// so is anything already in the store: an alert that is still active
    /// there comes back through `restore` or the next trigger.
    pub async fn reset(&self) {
        let mut core = self.core.lock().await;
        core.stop_countdown();
        self.set_state(EmergencyState::Idle);
        self.escalation.reset();
        debug!("emergency engine reset");
    }

    fn set_state(&self, state: EmergencyState) {
        self.state.send_replace(state);
    }
}

async fn tick(
    engine: Weak<EmergencyEngine>,
    token: GenerationToken,
    emergency_type: EmergencyType,
    remaining: u32,
) -> TickControl {
    match engine.upgrade() {
        Some(engine) => engine.on_tick(token, emergency_type, remaining).await,
        None => TickControl::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{Doubles, TEST_EPOCH_MS};
    use crate::capabilities::LocationError;
    use crate::escalation::NotificationStatus;
    use crate::model::{AlertStatus, UnixTimeMs};
    use std::time::Duration;

    fn engine_with(doubles: &Doubles, config: SafetyConfig) -> Arc<EmergencyEngine> {
        let providers = doubles.providers();
        let events = EventBus::new();
        let escalation = Arc::new(Escalation::new(&config, &providers, events.clone()));
        Arc::new(EmergencyEngine::new(config, &providers, escalation, events))
    }

    async fn signed_in(doubles: &Doubles) -> Arc<EmergencyEngine> {
        let engine = engine_with(doubles, SafetyConfig::default());
        engine
            .set_session(Some(UserId::new("rider-1").unwrap()))
            .await;
        engine
    }

    async fn stored_current(doubles: &Doubles) -> Option<EmergencyAlert> {
        doubles
            .store
            .inner()
            .current_alert(&UserId::new("rider-1").unwrap())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_countdown_never_fires() {
        for emergency_type in EmergencyType::ALL {
            let doubles = Doubles::new();
            let engine = signed_in(&doubles).await;

            engine.start_countdown(emergency_type).await.unwrap();
            engine.cancel_countdown().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;

            assert_eq!(engine.state(), EmergencyState::Idle);
            assert!(!engine.has_active_emergency());
            assert!(stored_current(&doubles).await.is_none());
            assert_eq!(doubles.location.calls(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_countdown_stops_ticks() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;
        let mut states = engine.subscribe();

        engine.start_countdown(EmergencyType::Panic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(
            engine.state(),
            EmergencyState::CountdownPending {
                emergency_type: EmergencyType::Panic,
                seconds_remaining: 3
            }
        );

        engine.cancel_countdown().await.unwrap();
        states.borrow_and_update();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!states.has_changed().unwrap());
        assert_eq!(engine.state(), EmergencyState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_countdown_triggers_alert() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;

        engine.start_countdown(EmergencyType::Medical).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(!engine.has_active_emergency());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let alert = engine.current_emergency().expect("alert after expiry");
        assert_eq!(alert.emergency_type(), EmergencyType::Medical);
        assert_eq!(alert.status(), AlertStatus::Active);
        assert_eq!(stored_current(&doubles).await, Some(alert));
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_publishes_ticks() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;
        let mut events = engine.events.subscribe();

        engine.start_countdown(EmergencyType::Accident).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SafetyEvent::CountdownStarted {
                    seconds_remaining, ..
                }
                | SafetyEvent::CountdownTick {
                    seconds_remaining, ..
                } => seen.push(seconds_remaining),
                SafetyEvent::AlertTriggered(alert) => {
                    assert_eq!(alert.emergency_type(), EmergencyType::Accident);
                    seen.push(0);
                }
                _ => {}
            }
        }
        assert_eq!(seen, vec![5, 4, 3, 2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_preempts_countdown() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;

        engine.start_countdown(EmergencyType::Panic).await.unwrap();
        let alert = engine.trigger_now(EmergencyType::Harassment).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(engine.current_emergency(), Some(alert.clone()));
        assert_eq!(alert.emergency_type(), EmergencyType::Harassment);
        assert_eq!(doubles.location.calls(), 1);
    }

    #[tokio::test]
    async fn second_trigger_is_rejected_with_existing_alert() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;

        let first = engine.trigger_now(EmergencyType::Panic).await.unwrap();
        let err = engine.trigger_now(EmergencyType::Other).await.unwrap_err();
        assert_eq!(err.existing_alert(), Some(&first));

        let err = engine.start_countdown(EmergencyType::Other).await.unwrap_err();
        assert!(matches!(err, SafetyError::AlreadyActive { .. }));
        assert_eq!(engine.current_emergency(), Some(first));
    }

    #[tokio::test]
    async fn alert_captures_time_and_location() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;

        let alert = engine.trigger_now(EmergencyType::Panic).await.unwrap();
        assert_eq!(alert.timestamp(), UnixTimeMs(TEST_EPOCH_MS));
        let fix = alert.location().unwrap();
        assert!((fix.latitude() - 37.7749).abs() < 1e-9);
        assert_eq!(alert.user_id().as_str(), "rider-1");
    }

    #[tokio::test]
    async fn location_failure_degrades_to_no_location() {
        let doubles = Doubles::new();
        doubles.location.fail_with(LocationError::PermissionDenied);
        let engine = signed_in(&doubles).await;

        let alert = engine.trigger_now(EmergencyType::Accident).await.unwrap();
        assert!(alert.location().is_none());
        assert!(engine.has_active_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_location_read_times_out() {
        let doubles = Doubles::new();
        doubles.location.hang();
        let engine = signed_in(&doubles).await;

        let started = tokio::time::Instant::now();
        let alert = engine.trigger_now(EmergencyType::Panic).await.unwrap();
        assert!(alert.location().is_none());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10), "waited {waited:?}");
        assert!(waited < Duration::from_secs(11), "waited {waited:?}");
    }

    #[tokio::test]
    async fn persistence_failure_returns_to_idle() {
        let doubles = Doubles::new();
        doubles.store.set_fail_writes(true);
        let engine = signed_in(&doubles).await;

        let err = engine.trigger_now(EmergencyType::Panic).await.unwrap_err();
        assert!(matches!(err, SafetyError::Persistence(_)));
        assert!(AppError::from(err).is_retryable());
        assert_eq!(engine.state(), EmergencyState::Idle);

        doubles.store.set_fail_writes(false);
        assert!(engine.trigger_now(EmergencyType::Panic).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_expiry_is_published() {
        let doubles = Doubles::new();
        doubles.store.set_fail_writes(true);
        let engine = signed_in(&doubles).await;
        let mut events = engine.events.subscribe();

        engine.start_countdown(EmergencyType::Medical).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(engine.state(), EmergencyState::Idle);
        let mut failure = None;
        while let Ok(event) = events.try_recv() {
            if let SafetyEvent::TriggerFailed(e) = event {
                failure = Some(e);
            }
        }
        assert_eq!(failure.expect("trigger failure event").code(), "STORAGE_ERROR");
    }

    #[tokio::test]
    async fn trigger_without_session_fails() {
        let doubles = Doubles::new();
        let engine = engine_with(&doubles, SafetyConfig::default());

        let err = engine.trigger_now(EmergencyType::Panic).await.unwrap_err();
        assert!(matches!(err, SafetyError::NoSession));
        assert_eq!(engine.state(), EmergencyState::Idle);
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;
        let alert = engine.trigger_now(EmergencyType::Panic).await.unwrap();

        let resolved = engine.resolve_emergency().await.unwrap().unwrap();
        assert_eq!(resolved.id(), alert.id());
        assert_eq!(resolved.status(), AlertStatus::Resolved);
        assert_eq!(engine.state(), EmergencyState::Idle);

        assert_eq!(engine.resolve_emergency().await.unwrap(), None);
        assert_eq!(engine.state(), EmergencyState::Idle);
        assert!(stored_current(&doubles).await.is_none());
    }

    #[tokio::test]
    async fn resolve_failure_keeps_alert_active() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;
        let alert = engine.trigger_now(EmergencyType::Panic).await.unwrap();

        doubles.store.set_fail_writes(true);
        assert!(engine.resolve_emergency().await.is_err());
        assert_eq!(engine.current_emergency(), Some(alert));
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_during_countdown_is_a_no_op() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;

        engine.start_countdown(EmergencyType::Panic).await.unwrap();
        assert_eq!(engine.resolve_emergency().await.unwrap(), None);
        assert_eq!(engine.state().name(), "countdown_pending");
    }

    #[tokio::test]
    async fn cancel_outside_countdown_is_rejected() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;

        let err = engine.cancel_countdown().await.unwrap_err();
        assert!(matches!(
            err,
            SafetyError::InvalidTransition { state: "idle", .. }
        ));

        engine.trigger_now(EmergencyType::Panic).await.unwrap();
        assert!(engine.cancel_countdown().await.is_err());
        assert!(engine.has_active_emergency());
    }

    #[tokio::test]
    async fn notification_failure_does_not_roll_back() {
        let doubles = Doubles::new();
        doubles.notifier.set_reject(true);
        let engine = signed_in(&doubles).await;

        let alert = engine.trigger_now(EmergencyType::Panic).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            engine.escalation.notification_status(alert.id()),
            Some(NotificationStatus::Failed { .. })
        ));
        assert!(engine.has_active_emergency());
    }

    #[tokio::test]
    async fn restore_reenters_active() {
        let doubles = Doubles::new();
        let first = signed_in(&doubles).await;
        let alert = first.trigger_now(EmergencyType::Medical).await.unwrap();

        let relaunched = signed_in(&doubles).await;
        assert!(!relaunched.has_active_emergency());
        assert_eq!(relaunched.restore().await.unwrap(), Some(alert.clone()));
        assert_eq!(relaunched.current_emergency(), Some(alert));

        let err = relaunched
            .trigger_now(EmergencyType::Panic)
            .await
            .unwrap_err();
        assert!(matches!(err, SafetyError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn restore_with_nothing_stored() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;
        assert_eq!(engine.restore().await.unwrap(), None);

        let anonymous = engine_with(&doubles, SafetyConfig::default());
        assert!(matches!(
            anonymous.restore().await,
            Err(SafetyError::NoSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_invalidates_pending_countdown() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;

        engine.start_countdown(EmergencyType::Panic).await.unwrap();
        engine.reset().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(engine.state(), EmergencyState::Idle);
        assert!(stored_current(&doubles).await.is_none());
        engine.start_countdown(EmergencyType::Panic).await.unwrap();
    }

    #[tokio::test]
    async fn trigger_adopts_alert_already_in_store() {
        let doubles = Doubles::new();
        let first = signed_in(&doubles).await;
        let alert = first.trigger_now(EmergencyType::Medical).await.unwrap();

        // Relaunched without calling restore
        let relaunched = signed_in(&doubles).await;
        let err = relaunched
            .trigger_now(EmergencyType::Panic)
            .await
            .unwrap_err();
        assert_eq!(err.existing_alert(), Some(&alert));
        assert!(!AppError::from(&err).is_retryable());
        assert_eq!(relaunched.current_emergency(), Some(alert.clone()));
        assert_eq!(stored_current(&doubles).await, Some(alert));
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_expiry_adopts_alert_already_in_store() {
        let doubles = Doubles::new();
        let other_device = signed_in(&doubles).await;
        let alert = other_device
            .trigger_now(EmergencyType::Harassment)
            .await
            .unwrap();

        let engine = signed_in(&doubles).await;
        let mut events = engine.events.subscribe();
        engine.start_countdown(EmergencyType::Medical).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(engine.current_emergency(), Some(alert));
        let mut failure = None;
        while let Ok(event) = events.try_recv() {
            if let SafetyEvent::TriggerFailed(e) = event {
                failure = Some(e);
            }
        }
        assert_eq!(
            failure.expect("trigger failure event").code(),
            "EMERGENCY_ALREADY_ACTIVE"
        );
    }

    #[tokio::test]
    async fn reset_then_trigger_reports_stored_alert() {
        let doubles = Doubles::new();
        let engine = signed_in(&doubles).await;
        let alert = engine.trigger_now(EmergencyType::Panic).await.unwrap();

        engine.reset().await;
        assert_eq!(engine.state(), EmergencyState::Idle);

        let err = engine.trigger_now(EmergencyType::Panic).await.unwrap_err();
        assert_eq!(err.existing_alert(), Some(&alert));
        assert!(engine.has_active_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trigger_still_commits() {
        let doubles = Doubles::new();
        doubles.location.hang();
        let engine = signed_in(&doubles).await;

        engine.start_countdown(EmergencyType::Medical).await.unwrap();
        let gave_up =
            tokio::time::timeout(Duration::from_secs(2), engine.trigger_now(EmergencyType::Panic))
                .await;
        assert!(gave_up.is_err());
        assert_eq!(
            engine.state(),
            EmergencyState::Triggering {
                emergency_type: EmergencyType::Panic
            }
        );

        // The location read times out and the alert lands; the countdown stays dead
        tokio::time::sleep(Duration::from_secs(60)).await;
        let alert = engine.current_emergency().expect("alert after dropped trigger");
        assert_eq!(alert.emergency_type(), EmergencyType::Panic);
        assert!(alert.location().is_none());
        assert_eq!(stored_current(&doubles).await, Some(alert));
        assert_eq!(doubles.location.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_shows_triggering_while_locating() {
        let doubles = Doubles::new();
        doubles.location.hang();
        let engine = signed_in(&doubles).await;

        engine.start_countdown(EmergencyType::Accident).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(
            engine.state(),
            EmergencyState::Triggering {
                emergency_type: EmergencyType::Accident
            }
        );

        // Too late to cancel; the call waits for the commit and is turned away
        let err = engine.cancel_countdown().await.unwrap_err();
        assert!(matches!(
            err,
            SafetyError::InvalidTransition { state: "active", .. }
        ));
        assert!(engine.has_active_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_countdown_length() {
        let doubles = Doubles::new();
        let config = SafetyConfig {
            countdown_seconds: 2,
            ..SafetyConfig::default()
        };
        let engine = engine_with(&doubles, config);
        engine
            .set_session(Some(UserId::new("rider-1").unwrap()))
            .await;

        engine.start_countdown(EmergencyType::Other).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(engine.has_active_emergency());
    }
}

//! In-process doubles for every provider, with failure switches.

use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    AlertStore, ContactNotifier, ContactsError, ContactsProvider, LocationError,
    LocationProvider, MemoryStore, NotifyError, PinStore, Providers, RandomError,
    RandomProvider, StoreError, TelephonyError, TelephonyProvider,
};
use crate::model::{
    AlertId, ContactId, Coordinates, EmergencyAlert, EmergencyContact, PhoneNumber, PinRecord,
    RideId, UnixTimeMs, UserId,
};
use crate::timer::Clock;

pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

pub fn contact(id: &str, name: &str, phone: &str, is_primary: bool) -> EmergencyContact {
    EmergencyContact {
        id: ContactId::new(id).unwrap_or_else(|_| panic!("bad contact id {id}")),
        name: name.to_string(),
        phone_number: PhoneNumber::parse(phone).unwrap_or_else(|_| panic!("bad phone {phone}")),
        relationship: "friend".to_string(),
        is_primary,
    }
}

// --- Location ---

enum LocationBehaviour {
    Fix(Coordinates),
    Fail(LocationError),
    Hang,
}

pub struct StubLocation {
    behaviour: Mutex<LocationBehaviour>,
    calls: AtomicUsize,
}

impl StubLocation {
    pub fn at(latitude: f64, longitude: f64) -> Self {
        let fix = Coordinates::new(latitude, longitude)
            .unwrap_or_else(|_| panic!("bad coordinates {latitude},{longitude}"));
        Self {
            behaviour: Mutex::new(LocationBehaviour::Fix(fix)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_with(&self, error: LocationError) {
        *self.behaviour.lock().unwrap_or_else(|e| e.into_inner()) = LocationBehaviour::Fail(error);
    }

    /// Never answers; exercises the caller's timeout.
    pub fn hang(&self) {
        *self.behaviour.lock().unwrap_or_else(|e| e.into_inner()) = LocationBehaviour::Hang;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LocationProvider for StubLocation {
    async fn current_location(&self) -> Result<Coordinates, LocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match &*self.behaviour.lock().unwrap_or_else(|e| e.into_inner()) {
            LocationBehaviour::Fix(fix) => Some(Ok(*fix)),
            LocationBehaviour::Fail(error) => Some(Err(error.clone())),
            LocationBehaviour::Hang => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(LocationError::Provider("hung".into()))
            }
        }
    }
}

// --- Contacts ---

#[derive(Default)]
pub struct StaticContacts {
    contacts: Mutex<Vec<EmergencyContact>>,
    fail: AtomicBool,
}

impl StaticContacts {
    pub fn new(contacts: Vec<EmergencyContact>) -> Self {
        Self {
            contacts: Mutex::new(contacts),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set(&self, contacts: Vec<EmergencyContact>) {
        *self.contacts.lock().unwrap_or_else(|e| e.into_inner()) = contacts;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ContactsProvider for StaticContacts {
    async fn emergency_contacts(&self) -> Result<Vec<EmergencyContact>, ContactsError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ContactsError::Unavailable("injected failure".into()));
        }
        Ok(self.contacts.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

// --- Telephony ---

#[derive(Default)]
pub struct RecordingTelephony {
    dialed: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingTelephony {
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TelephonyProvider for RecordingTelephony {
    async fn dial(&self, number: &str) -> Result<(), TelephonyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TelephonyError::DialFailed("injected failure".into()));
        }
        self.dialed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(number.to_string());
        Ok(())
    }
}

// --- Notifier ---

/// Fails the first `n` calls with a retryable network error, then succeeds.
#[derive(Default)]
pub struct FlakyNotifier {
    failures_remaining: AtomicU32,
    reject: AtomicBool,
    calls: AtomicU32,
    delivered: Mutex<Vec<(AlertId, usize)>>,
}

impl FlakyNotifier {
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(alert, recipient count)` per successful delivery.
    pub fn delivered(&self) -> Vec<(AlertId, usize)> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl ContactNotifier for FlakyNotifier {
    async fn notify(
        &self,
        alert: &EmergencyAlert,
        contacts: &[EmergencyContact],
    ) -> Result<(), NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected("injected rejection".into()));
        }
        let pending = self.failures_remaining.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_remaining.store(pending - 1, Ordering::SeqCst);
            return Err(NotifyError::Network("injected failure".into()));
        }
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((alert.id().clone(), contacts.len()));
        Ok(())
    }
}

// --- Store ---

/// Failure-injectable wrapper around [`MemoryStore`].
#[derive(Default)]
pub struct FailableStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl FailableStore {
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Every read sleeps this long first. `Duration::ZERO` turns it off.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected write failure"));
        }
        Ok(())
    }

    async fn check_read(&self) -> Result<(), StoreError> {
        let delay_ms = self.read_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected read failure"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AlertStore for FailableStore {
    async fn create_alert(&self, alert: &EmergencyAlert) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.create_alert(alert).await
    }

    async fn current_alert(&self, user_id: &UserId) -> Result<Option<EmergencyAlert>, StoreError> {
        self.check_read().await?;
        self.inner.current_alert(user_id).await
    }

    async fn resolve_alert(
        &self,
        alert_id: &AlertId,
        at: UnixTimeMs,
    ) -> Result<EmergencyAlert, StoreError> {
        self.check_write()?;
        self.inner.resolve_alert(alert_id, at).await
    }
}

#[async_trait::async_trait]
impl PinStore for FailableStore {
    async fn get_pin(&self, ride_id: &RideId) -> Result<Option<PinRecord>, StoreError> {
        self.check_read().await?;
        self.inner.get_pin(ride_id).await
    }

    async fn insert_pin_if_absent(&self, record: &PinRecord) -> Result<PinRecord, StoreError> {
        self.check_write()?;
        self.inner.insert_pin_if_absent(record).await
    }
}

// --- Random ---

/// Replays a fixed byte script, cycling when exhausted.
pub struct ScriptedRandom {
    script: Vec<u8>,
    cursor: AtomicUsize,
}

impl ScriptedRandom {
    pub fn new(script: Vec<u8>) -> Self {
        assert!(!script.is_empty(), "script cannot be empty");
        Self {
            script,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl RandomProvider for ScriptedRandom {
    fn fill(&self, out: &mut [u8]) -> Result<(), RandomError> {
        for byte in out.iter_mut() {
            let at = self.cursor.fetch_add(1, Ordering::SeqCst);
            *byte = self.script[at % self.script.len()];
        }
        Ok(())
    }
}

pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomProvider for SeededRandom {
    fn fill(&self, out: &mut [u8]) -> Result<(), RandomError> {
        self.rng
            .lock()
            .map_err(|_| RandomError::Unavailable)?
            .fill_bytes(out);
        Ok(())
    }
}

// --- Clock ---

pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

// --- Bundle ---

/// Concrete handles to every double, so tests can flip failure switches
/// after handing [`Providers`] to the core.
pub struct Doubles {
    pub location: Arc<StubLocation>,
    pub contacts: Arc<StaticContacts>,
    pub telephony: Arc<RecordingTelephony>,
    pub notifier: Arc<FlakyNotifier>,
    pub store: Arc<FailableStore>,
    pub random: Arc<SeededRandom>,
    pub clock: Arc<ManualClock>,
}

impl Doubles {
    pub fn new() -> Self {
        Self {
            location: Arc::new(StubLocation::at(37.7749, -122.4194)),
            contacts: Arc::new(StaticContacts::new(vec![
                contact("c1", "Sam", "+14155550101", true),
                contact("c2", "Robin", "+14155550102", false),
            ])),
            telephony: Arc::new(RecordingTelephony::default()),
            notifier: Arc::new(FlakyNotifier::default()),
            store: Arc::new(FailableStore::default()),
            random: Arc::new(SeededRandom::new(7)),
            clock: Arc::new(ManualClock::new(UnixTimeMs(TEST_EPOCH_MS))),
        }
    }

    pub fn providers(&self) -> Providers {
        Providers {
            location: self.location.clone(),
            contacts: self.contacts.clone(),
            telephony: self.telephony.clone(),
            notifier: self.notifier.clone(),
            alerts: self.store.clone(),
            pins: self.store.clone(),
            random: self.random.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Same as [`Doubles::providers`] with a different random source.
    pub fn providers_with_random(&self, random: Arc<dyn RandomProvider>) -> Providers {
        Providers {
            random,
            ..self.providers()
        }
    }
}

impl Default for Doubles {
    fn default() -> Self {
        Self::new()
    }
}

mod contacts;
mod kv;
mod location;
mod notify;
mod random;
mod telephony;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::sync::Arc;

pub use self::contacts::{ContactsError, ContactsProvider};
pub use self::kv::{
    AlertStore, KeyNamespace, KvKey, KvValue, MemoryStore, PinStore, StoreError, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};
pub use self::location::{LocationError, LocationProvider};
pub use self::notify::{ContactNotifier, NotifyError};
pub use self::random::{OsRng, RandomError, RandomProvider};
pub use self::telephony::{TelephonyError, TelephonyProvider};

use crate::timer::{Clock, SystemClock};

/// Everything the safety core consumes from the host shell.
#[derive(Clone)]
pub struct Providers {
    pub location: Arc<dyn LocationProvider>,
    pub contacts: Arc<dyn ContactsProvider>,
    pub telephony: Arc<dyn TelephonyProvider>,
    pub notifier: Arc<dyn ContactNotifier>,
    pub alerts: Arc<dyn AlertStore>,
    pub pins: Arc<dyn PinStore>,
    pub random: Arc<dyn RandomProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Providers {
    /// Shell-provided device capabilities backed by an in-process store,
    /// OS randomness and the system clock.
    pub fn with_memory_store(
        location: Arc<dyn LocationProvider>,
        contacts: Arc<dyn ContactsProvider>,
        telephony: Arc<dyn TelephonyProvider>,
        notifier: Arc<dyn ContactNotifier>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            location,
            contacts,
            telephony,
            notifier,
            alerts: store.clone(),
            pins: store,
            random: Arc::new(OsRng),
            clock: Arc::new(SystemClock),
        }
    }
}

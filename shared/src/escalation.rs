//! What happens once an alert is active: telling contacts, and placing calls.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{ContactNotifier, ContactsProvider, Providers, TelephonyProvider};
use crate::config::{RetryPolicy, SafetyConfig};
use crate::error::SafetyError;
use crate::event::{EventBus, SafetyEvent};
use crate::model::{AlertId, EmergencyAlert, EmergencyContact};
use crate::timer::{Generation, GenerationToken};

/// How many alerts keep a queryable notification status.
const STATUS_HISTORY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent { attempts: u32, recipients: usize },
    NoContacts,
    Failed { attempts: u32, reason: String },
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationStatus::Pending)
    }
}

/// Statuses recorded since the last reset. Runs started before a reset
/// carry a stale token and no longer write here.
struct Ledger {
    generation: Generation,
    statuses: LruCache<AlertId, NotificationStatus>,
}

pub struct Escalation {
    contacts: Arc<dyn ContactsProvider>,
    notifier: Arc<dyn ContactNotifier>,
    telephony: Arc<dyn TelephonyProvider>,
    policy: RetryPolicy,
    emergency_number: String,
    ledger: Mutex<Ledger>,
    events: EventBus,
}

impl Escalation {
    pub fn new(config: &SafetyConfig, providers: &Providers, events: EventBus) -> Self {
        Self {
            contacts: providers.contacts.clone(),
            notifier: providers.notifier.clone(),
            telephony: providers.telephony.clone(),
            policy: config.notification_retry.clone(),
            emergency_number: config.emergency_services_number.clone(),
            ledger: Mutex::new(Ledger {
                generation: Generation::new(),
                statuses: LruCache::new(
                    NonZeroUsize::new(STATUS_HISTORY).unwrap_or(NonZeroUsize::MIN),
                ),
            }),
            events,
        }
    }

    /// Starts contact notification in the background. The caller does not
    /// wait; the outcome shows up in [`Escalation::notification_status`] and
    /// on the event bus. The task has no cancellation path; a [`reset`]
    /// only stops it from recording its outcome.
    ///
    /// [`reset`]: Escalation::reset
    pub fn spawn_notify(self: &Arc<Self>, alert: EmergencyAlert) -> JoinHandle<NotificationStatus> {
        let token = self.current_token();
        self.set_status(token, alert.id(), NotificationStatus::Pending);
        let escalation = Arc::clone(self);
        tokio::spawn(async move { escalation.run_notify(&alert, token).await })
    }

    pub async fn notify_contacts(&self, alert: &EmergencyAlert) -> NotificationStatus {
        self.run_notify(alert, self.current_token()).await
    }

    #[instrument(skip(self, alert, token), fields(alert_id = %alert.id()))]
    async fn run_notify(&self, alert: &EmergencyAlert, token: GenerationToken) -> NotificationStatus {
        let max_attempts = self.policy.max_attempts;
        let mut last_reason = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt - 1, self.policy.jitter());
                warn!(attempt, ?delay, reason = %last_reason, "retrying contact notification");
                tokio::time::sleep(delay).await;
            }

            let contacts = match self.contacts.emergency_contacts().await {
                Ok(contacts) => contacts,
                Err(e) => {
                    last_reason = e.to_string();
                    continue;
                }
            };

            if contacts.is_empty() {
                info!("no emergency contacts to notify");
                return self.finish(token, alert.id(), NotificationStatus::NoContacts);
            }

            match self.notifier.notify(alert, &contacts).await {
                Ok(()) => {
                    info!(recipients = contacts.len(), "emergency contacts notified");
                    return self.finish(
                        token,
                        alert.id(),
                        NotificationStatus::Sent {
                            attempts: attempt + 1,
                            recipients: contacts.len(),
                        },
                    );
                }
                Err(e) if e.is_retryable() => {
                    last_reason = e.to_string();
                }
                Err(e) => {
                    error!(error = %e, "contact notification rejected");
                    return self.finish(
                        token,
                        alert.id(),
                        NotificationStatus::Failed {
                            attempts: attempt + 1,
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        error!(attempts = max_attempts, reason = %last_reason, "contact notification gave up");
        self.finish(
            token,
            alert.id(),
            NotificationStatus::Failed {
                attempts: max_attempts,
                reason: last_reason,
            },
        )
    }

    /// Only the most recent alerts are kept; older ones read as `None`.
    pub fn notification_status(&self, alert_id: &AlertId) -> Option<NotificationStatus> {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .statuses
            .peek(alert_id)
            .cloned()
    }

    /// Works in any engine state, alert or not.
    #[instrument(skip(self))]
    pub async fn call_emergency_services(&self) -> Result<(), SafetyError> {
        info!(number = %self.emergency_number, "dialling emergency services");
        self.telephony.dial(&self.emergency_number).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn call_primary_contact(&self) -> Result<EmergencyContact, SafetyError> {
        let contacts = self.contacts.emergency_contacts().await?;
        let primary = contacts
            .into_iter()
            .find(|c| c.is_primary)
            .ok_or(SafetyError::NoPrimaryContact)?;
        info!(contact_id = %primary.id, "dialling primary contact");
        self.telephony.dial(primary.phone_number.as_str()).await?;
        Ok(primary)
    }

    /// Forgets every status. Deliveries already in flight keep going but
    /// report nothing afterwards.
    pub fn reset(&self) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.generation.advance();
        ledger.statuses.clear();
    }

    fn current_token(&self) -> GenerationToken {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generation
            .current()
    }

    fn finish(
        &self,
        token: GenerationToken,
        alert_id: &AlertId,
        status: NotificationStatus,
    ) -> NotificationStatus {
        self.set_status(token, alert_id, status.clone());
        status
    }

    fn set_status(&self, token: GenerationToken, alert_id: &AlertId, status: NotificationStatus) {
        {
            let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            if !ledger.generation.is_current(token) {
                debug!(%alert_id, "notification outcome from before reset dropped");
                return;
            }
            ledger.statuses.put(alert_id.clone(), status.clone());
        }
        self.events.publish(SafetyEvent::NotificationStatusChanged {
            alert_id: alert_id.clone(),
            status,
        });
    }
}

//! Driver-side pin entry surface.
//!
//! [`PinEntry`] is the pure four-slot buffer the entry modal renders.
//! [`PinEntrySession`] wires it to [`PinProtocol::verify_pin`] so a filled
//! buffer is checked without an explicit submit.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::AppError;
use crate::event::{EventBus, SafetyEvent};
use crate::model::{RideId, PIN_LENGTH};
use crate::pin::PinProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Unchecked,
    Match,
    Mismatch,
}

#[derive(Debug)]
pub struct PinEntry {
    slots: [Option<u8>; PIN_LENGTH],
    focus: usize,
    last_result: AttemptResult,
    awaiting_result: bool,
    closed: bool,
}

impl Default for PinEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl PinEntry {
    pub fn new() -> Self {
        Self {
            slots: [None; PIN_LENGTH],
            focus: 0,
            last_result: AttemptResult::Unchecked,
            awaiting_result: false,
            closed: false,
        }
    }

    pub fn slots(&self) -> [Option<char>; PIN_LENGTH] {
        self.slots.map(|slot| slot.map(|d| char::from(b'0' + d)))
    }

    pub fn digits_entered(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn focus(&self) -> usize {
        self.focus
    }

    pub fn last_result(&self) -> AttemptResult {
        self.last_result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_awaiting_result(&self) -> bool {
        self.awaiting_result
    }

    fn accepts_input(&self) -> bool {
        !self.closed && !self.awaiting_result
    }

    /// Moves focus to a tapped slot. Out-of-range taps are ignored.
    pub fn focus_slot(&mut self, index: usize) {
        if self.accepts_input() && index < PIN_LENGTH {
            self.focus = index;
        }
    }

    /// Types or pastes `input` starting at the focused slot. Non-digits are
    /// dropped; digits past the last slot are discarded. Returns the code to
    /// verify as soon as every slot holds a digit.
    pub fn enter(&mut self, input: &str) -> Option<Zeroizing<String>> {
        if !self.accepts_input() {
            return None;
        }

        let mut typed = false;
        for digit in input.chars().filter_map(|c| c.to_digit(10)) {
            typed = true;
            self.slots[self.focus] = Some(digit as u8);
            if self.focus + 1 == PIN_LENGTH {
                break;
            }
            self.focus += 1;
        }
        if !typed {
            return None;
        }
        self.last_result = AttemptResult::Unchecked;

        if self.slots.iter().all(Option::is_some) {
            self.awaiting_result = true;
            let code: String = self.slots().iter().flatten().collect();
            return Some(Zeroizing::new(code));
        }
        None
    }

    /// Clears the focused slot, or retreats and clears the previous one when
    /// the focused slot is already empty.
    pub fn backspace(&mut self) {
        if !self.accepts_input() {
            return;
        }
        if self.slots[self.focus].is_some() {
            self.slots[self.focus] = None;
        } else if self.focus > 0 {
            self.focus -= 1;
            self.slots[self.focus] = None;
        }
    }

    /// Match closes the surface for good. Mismatch wipes every slot and sends
    /// focus back to the first one.
    pub fn apply_result(&mut self, matched: bool) {
        self.awaiting_result = false;
        self.wipe();
        if matched {
            self.last_result = AttemptResult::Match;
            self.closed = true;
        } else {
            self.last_result = AttemptResult::Mismatch;
        }
    }

    /// The submitted code could not be checked; start over without a verdict.
    pub fn abandon_attempt(&mut self) {
        self.awaiting_result = false;
        self.wipe();
        self.last_result = AttemptResult::Unchecked;
    }

    fn wipe(&mut self) {
        self.slots.zeroize();
        self.focus = 0;
    }
}

impl Drop for PinEntry {
    fn drop(&mut self) {
        self.slots.zeroize();
    }
}

/// A submitted code whose verdict has not landed. Dropped without one (the
/// verifying future was cancelled), it abandons the attempt so the surface
/// takes input again.
struct PendingAttempt<'a> {
    entry: &'a mut PinEntry,
}

impl PendingAttempt<'_> {
    fn settle(self, matched: bool) {
        self.entry.apply_result(matched);
    }

    fn abandon(self) {
        self.entry.abandon_attempt();
    }
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        if self.entry.awaiting_result {
            debug!("pin verification dropped before a verdict");
            self.entry.abandon_attempt();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Nothing was submitted (buffer not full, or input ignored).
    Pending,
    Verified,
    Incorrect,
    /// The pin could not be checked; the surface has been reset.
    Unavailable(AppError),
}

/// One open entry modal for one ride. Dropping it discards the attempt.
pub struct PinEntrySession {
    ride_id: RideId,
    entry: PinEntry,
    pins: Arc<PinProtocol>,
    events: EventBus,
}

impl PinEntrySession {
    pub fn new(ride_id: RideId, pins: Arc<PinProtocol>, events: EventBus) -> Self {
        Self {
            ride_id,
            entry: PinEntry::new(),
            pins,
            events,
        }
    }

    pub fn ride_id(&self) -> &RideId {
        &self.ride_id
    }

    pub fn entry(&self) -> &PinEntry {
        &self.entry
    }

    pub fn focus_slot(&mut self, index: usize) {
        self.entry.focus_slot(index);
    }

    pub fn backspace(&mut self) {
        self.entry.backspace();
    }

    #[instrument(skip(self, input), fields(ride_id = %self.ride_id))]
    pub async fn enter(&mut self, input: &str) -> EntryOutcome {
        let Some(code) = self.entry.enter(input) else {
            return EntryOutcome::Pending;
        };
        debug!("pin entry full, verifying");
        let attempt = PendingAttempt {
            entry: &mut self.entry,
        };

        match self.pins.verify_pin(&self.ride_id, &code).await {
            Ok(true) => {
                attempt.settle(true);
                info!("pickup verified");
                self.events.publish(SafetyEvent::PinVerified {
                    ride_id: self.ride_id.clone(),
                });
                EntryOutcome::Verified
            }
            Ok(false) => {
                attempt.settle(false);
                info!("pickup pin incorrect");
                self.events.publish(SafetyEvent::PinIncorrect {
                    ride_id: self.ride_id.clone(),
                });
                EntryOutcome::Incorrect
            }
            Err(e) => {
                warn!(error = %e, "pin verification unavailable");
                attempt.abandon();
                EntryOutcome::Unavailable(AppError::from(e))
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use trip_safety::capabilities::testing::{Doubles, ScriptedRandom};
use trip_safety::{
    AttemptResult, EntryOutcome, RideId, SafetyConfig, SafetyCore, SafetyEvent, PIN_LENGTH,
};

fn core_with_digits(doubles: &Doubles, digits: Vec<u8>) -> SafetyCore {
    let providers = doubles.providers_with_random(Arc::new(ScriptedRandom::new(digits)));
    SafetyCore::new(SafetyConfig::default(), providers).unwrap()
}

#[tokio::test]
async fn driver_enters_correct_pin_one_digit_at_a_time() {
    let doubles = Doubles::new();
    let core = core_with_digits(&doubles, vec![4, 8, 2, 1]);
    let r1 = RideId::new("R1").unwrap();
    let mut events = core.events();

    // 1. Passenger opens the pickup screen: read, then create
    assert_eq!(core.get_pin_for_ride(&r1).await.unwrap(), None);
    let pin = core.create_pin_for_ride(&r1).await.unwrap();
    assert_eq!(pin.expose(), "4821");
    assert_eq!(core.get_pin_for_ride(&r1).await.unwrap(), Some(pin));

    // 2. Driver types the digits; the fourth one submits
    let mut entry = core.open_pin_entry(r1.clone());
    for digit in ["4", "8", "2"] {
        assert_eq!(entry.enter(digit).await, EntryOutcome::Pending);
    }
    assert_eq!(entry.enter("1").await, EntryOutcome::Verified);

    // 3. Surface closes and the verified event goes out
    assert!(entry.entry().is_closed());
    assert_eq!(entry.entry().last_result(), AttemptResult::Match);
    assert!(matches!(
        events.try_recv().unwrap(),
        SafetyEvent::PinVerified { ride_id } if ride_id == r1
    ));
}

#[tokio::test]
async fn wrong_pin_resets_entry_without_lockout() {
    let doubles = Doubles::new();
    let core = core_with_digits(&doubles, vec![4, 8, 2, 1]);
    let r1 = RideId::new("R1").unwrap();
    core.create_pin_for_ride(&r1).await.unwrap();

    let mut entry = core.open_pin_entry(r1.clone());

    // 1. Wrong code, many times over
    for _ in 0..20 {
        for digit in ["1", "2", "3"] {
            entry.enter(digit).await;
        }
        assert_eq!(entry.enter("4").await, EntryOutcome::Incorrect);

        // 2. Four empty slots, focus back on the first
        assert_eq!(entry.entry().slots(), [None; PIN_LENGTH]);
        assert_eq!(entry.entry().focus(), 0);
        assert_eq!(entry.entry().last_result(), AttemptResult::Mismatch);
    }

    // 3. The stored pin never changed and still verifies
    assert_eq!(entry.enter("4821").await, EntryOutcome::Verified);
    assert!(core.verify_pin(&r1, "4821").await.unwrap());
}

#[tokio::test]
async fn unissued_ride_fails_closed() {
    let doubles = Doubles::new();
    let core = core_with_digits(&doubles, vec![4, 8, 2, 1]);
    let ride = RideId::new("never-issued").unwrap();

    for candidate in ["0000", "4821", "9999", "", "abcd"] {
        assert!(!core.verify_pin(&ride, candidate).await.unwrap());
    }
    assert_eq!(core.get_pin_for_ride(&ride).await.unwrap(), None);
}

#[tokio::test]
async fn rides_get_independent_fixed_width_pins() {
    let doubles = Doubles::new();
    // Each pin draws eight bytes, so the second ride starts at the 7s
    let core = core_with_digits(&doubles, vec![0, 0, 4, 2, 9, 9, 9, 9, 7, 7, 0, 1]);

    let first = core
        .create_pin_for_ride(&RideId::new("R1").unwrap())
        .await
        .unwrap();
    let second = core
        .create_pin_for_ride(&RideId::new("R2").unwrap())
        .await
        .unwrap();

    assert_eq!(first.expose(), "0042");
    assert_eq!(second.expose(), "7701");
    assert!(core
        .verify_pin(&RideId::new("R1").unwrap(), "0042")
        .await
        .unwrap());
    assert!(!core
        .verify_pin(&RideId::new("R1").unwrap(), "42")
        .await
        .unwrap());
}

#[tokio::test]
async fn passenger_and_driver_devices_agree() {
    let doubles = Doubles::new();
    // Two cores sharing one backing store, as two phones share the backend
    let passenger = core_with_digits(&doubles, vec![3, 1, 4, 1]);
    let driver = core_with_digits(&doubles, vec![9, 9, 9, 9]);
    let ride = RideId::new("R7").unwrap();

    // The driver side never generates when the passenger already issued
    let issued = passenger.create_pin_for_ride(&ride).await.unwrap();
    assert_eq!(driver.create_pin_for_ride(&ride).await.unwrap(), issued);
    assert!(driver.verify_pin(&ride, "3141").await.unwrap());
}

#[tokio::test]
async fn store_outage_during_entry_is_reported() {
    let doubles = Doubles::new();
    let core = core_with_digits(&doubles, vec![4, 8, 2, 1]);
    let ride = RideId::new("R3").unwrap();
    doubles.store.set_fail_reads(true);

    let mut entry = core.open_pin_entry(ride);
    let EntryOutcome::Unavailable(error) = entry.enter("4821").await else {
        panic!("expected the store outage to surface");
    };
    assert_eq!(error.code(), "STORAGE_ERROR");
    assert_eq!(entry.entry().digits_entered(), 0);
    assert_eq!(entry.entry().last_result(), AttemptResult::Unchecked);
}

#[tokio::test(start_paused = true)]
async fn abandoned_check_leaves_entry_usable() {
    let doubles = Doubles::new();
    let passenger = core_with_digits(&doubles, vec![4, 8, 2, 1]);
    let driver = core_with_digits(&doubles, vec![9, 9, 9, 9]);
    let ride = RideId::new("R5").unwrap();
    passenger.create_pin_for_ride(&ride).await.unwrap();

    // 1. The driver's check hangs on a slow backend and the UI gives up
    doubles.store.set_read_delay(Duration::from_secs(60));
    let mut entry = driver.open_pin_entry(ride);
    let gave_up = tokio::time::timeout(Duration::from_secs(3), entry.enter("4821")).await;
    assert!(gave_up.is_err());

    // 2. Empty slots, ready for another try
    assert!(!entry.entry().is_awaiting_result());
    assert_eq!(entry.entry().slots(), [None; PIN_LENGTH]);
    doubles.store.set_read_delay(Duration::ZERO);
    assert_eq!(entry.enter("4821").await, EntryOutcome::Verified);
}

use std::time::Duration;

use nebula_watch::alert::{AlertPhase, AlertPolicy, AlertState};
use nebula_watch::types::Status;
use tokio::time::Instant;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn threshold_then_cooldown_suppresses_second_alert() {
    let t0 = Instant::now();
    let mut s = AlertState::new(AlertPolicy {
        failure_threshold: 3,
        alert_cooldown_ms: 300_000,
        recovery_cooldown_ms: 60_000,
    });

    s.update(Status::Down, 0, t0);
    assert!(!s.should_alert(t0));
    s.update(Status::Down, 0, t0 + ms(1));
    assert!(!s.should_alert(t0 + ms(1)));
    s.update(Status::Down, 0, t0 + ms(2));
    assert!(s.should_alert(t0 + ms(2)));
    s.mark_alert_sent(t0 + ms(2));

    s.update(Status::Down, 0, t0 + ms(3));
    assert!(!s.should_alert(t0 + ms(3)));
    assert!(!s.should_alert(t0 + ms(299_999)));
    assert!(s.should_alert(t0 + ms(300_002)));
}

#[test]
fn quick_recovery_resets_silently() {
    let t0 = Instant::now();
    let mut s = AlertState::default();
    s.update(Status::Down, 0, t0);
    s.update(Status::Down, 0, t0 + ms(10));
    assert!(s.downtime_start().is_some());

    s.update(Status::Up, 25, t0 + ms(20));
    assert_eq!(s.failures(), 0);
    assert!(s.downtime_start().is_none());
    assert!(!s.alert_sent());
    assert!(!s.should_alert(t0 + ms(20)));
    assert!(!s.should_recover(t0 + ms(3_600_000)));
    assert_eq!(s.phase(t0 + ms(20)), AlertPhase::Healthy);
}

#[test]
fn counter_only_grows_while_failing() {
    let t0 = Instant::now();
    let mut s = AlertState::default();
    let mut last = 0;
    let seq = [
        Status::Down,
        Status::Unknown,
        Status::Down,
        Status::Down,
        Status::Unknown,
    ];
    for (i, status) in seq.into_iter().enumerate() {
        s.update(status, 0, t0 + ms(i as u64));
        assert!(s.failures() > last);
        last = s.failures();
    }
    assert_eq!(s.failures(), 5);
}

#[test]
fn should_alert_false_below_threshold_for_any_status() {
    let t0 = Instant::now();
    for threshold in 1..=5u32 {
        let mut s = AlertState::new(AlertPolicy {
            failure_threshold: threshold,
            ..AlertPolicy::default()
        });
        for i in 0..threshold - 1 {
            s.update(Status::Down, 0, t0 + ms(u64::from(i)));
            assert!(!s.should_alert(t0 + ms(10_000_000)));
        }
        s.update(Status::Up, 5, t0 + ms(100));
        assert!(!s.should_alert(t0 + ms(10_000_000)));
    }
}

#[test]
fn full_outage_lifecycle() {
    let t0 = Instant::now();
    let mut s = AlertState::default();
    let at = |secs: u64| t0 + Duration::from_secs(secs);

    for i in 0..3 {
        s.update(Status::Down, 0, at(i * 30));
    }
    assert_eq!(s.phase(at(60)), AlertPhase::AlertPending);
    s.mark_alert_sent(at(60));
    assert_eq!(s.escalation_start(), Some(t0));

    s.update(Status::Up, 40, at(90));
    assert_eq!(s.phase(at(90)), AlertPhase::RecoveringPending);
    assert!(!s.should_recover(at(90)));

    // Flaps back down before the recovery is due: still the same outage.
    s.update(Status::Down, 0, at(100));
    assert_eq!(s.phase(at(100)), AlertPhase::AlertActive);
    assert_eq!(s.downtime_start(), Some(t0));

    s.update(Status::Up, 40, at(130));
    assert!(s.should_recover(at(130)));
    let total = s.mark_recovered(at(130));
    assert_eq!(total, Duration::from_secs(130));

    assert_eq!(s.failures(), 0);
    assert!(!s.alert_sent());
    assert!(s.downtime_start().is_none());
    assert_eq!(s.downtime(at(10_000)), Duration::from_secs(130));

    // A new outage starts a fresh debounce with no cooldown left over.
    for i in 0..3 {
        s.update(Status::Down, 0, at(200 + i));
    }
    assert!(s.should_alert(at(202)));
}

//! Per-target alert state machine.
//!
//! Outages are debounced by `failure_threshold` consecutive failed checks, and
//! both the outage and the recovery notification have their own cooldown so a
//! flapping target cannot flood the alert channel. Nothing here sends anything;
//! the caller asks [`AlertState::should_alert`] / [`AlertState::should_recover`]
//! and reports a delivered message back with `mark_*`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::Status;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlertPolicy {
    /// Consecutive failed checks before an outage alert is due.
    pub failure_threshold: u32,
    /// Minimum spacing between two outage alerts for one target.
    pub alert_cooldown_ms: u64,
    /// Minimum time after the outage alert before a recovery is sent.
    pub recovery_cooldown_ms: u64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            alert_cooldown_ms: 300_000,
            recovery_cooldown_ms: 60_000,
        }
    }
}

impl AlertPolicy {
    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_millis(self.alert_cooldown_ms)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_millis(self.recovery_cooldown_ms)
    }
}

/// Observable phase of one target, derived from its [`AlertState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPhase {
    /// Up, no outstanding alert.
    Healthy,
    /// Failing, below the threshold.
    Degrading,
    /// Threshold reached, no alert delivered yet.
    AlertPending,
    /// Outage alert delivered, target still failing.
    AlertActive,
    /// Back up after an alert, recovery cooldown still running.
    RecoveringPending,
    /// Recovery due, waiting for delivery.
    Recovered,
}

#[derive(Debug, Clone)]
pub struct AlertState {
    policy: AlertPolicy,
    status: Status,
    previous: Status,
    failures: u32,
    /// Set on the first consecutive failure.
    downtime_start: Option<Instant>,
    last_alert_at: Option<Instant>,
    alert_sent: bool,
    /// Escalation window start; always `Some` while `alert_sent`.
    escalation_start: Option<Instant>,
    /// Whole seconds, snapshotted once on a delivered recovery.
    total_downtime: Duration,
    last_latency_ms: u64,
}

impl AlertState {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            status: Status::Unknown,
            previous: Status::Unknown,
            failures: 0,
            downtime_start: None,
            last_alert_at: None,
            alert_sent: false,
            escalation_start: None,
            total_downtime: Duration::ZERO,
            last_latency_ms: 0,
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn previous_status(&self) -> Status {
        self.previous
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn alert_sent(&self) -> bool {
        self.alert_sent
    }

    pub fn downtime_start(&self) -> Option<Instant> {
        self.downtime_start
    }

    pub fn escalation_start(&self) -> Option<Instant> {
        self.escalation_start
    }

    pub fn last_alert_at(&self) -> Option<Instant> {
        self.last_alert_at
    }

    pub fn last_latency_ms(&self) -> u64 {
        self.last_latency_ms
    }

    /// Record the result of one check.
    ///
    /// Every failed check counts, even when the status did not change; that is
    /// how the threshold accumulates across scan passes.
    pub fn update(&mut self, status: Status, latency_ms: u64, now: Instant) {
        self.previous = self.status;
        self.status = status;
        self.last_latency_ms = latency_ms;

        if status.is_failure() {
            self.failures = self.failures.saturating_add(1);
            if self.failures == 1 {
                self.downtime_start = Some(now);
            }
        } else if !self.alert_sent && self.failures > 0 {
            tracing::debug!(failures = self.failures, "quick recovery, no alert was sent");
            self.failures = 0;
            self.downtime_start = None;
        }
    }

    pub fn should_alert(&self, now: Instant) -> bool {
        if !self.status.is_failure() || self.failures < self.policy.failure_threshold {
            return false;
        }
        match self.last_alert_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.policy.alert_cooldown(),
        }
    }

    pub fn should_recover(&self, now: Instant) -> bool {
        if self.status != Status::Up || !self.alert_sent || self.escalation_start.is_none() {
            return false;
        }
        match self.last_alert_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.policy.recovery_cooldown(),
        }
    }

    /// Call only after the outage message was delivered.
    pub fn mark_alert_sent(&mut self, now: Instant) {
        self.alert_sent = true;
        self.last_alert_at = Some(now);
        if self.escalation_start.is_none() {
            self.escalation_start = Some(self.downtime_start.unwrap_or(now));
        }
    }

    /// Call only after the recovery message was delivered. Returns the total
    /// downtime, which [`downtime`](Self::downtime) keeps reporting afterwards.
    pub fn mark_recovered(&mut self, now: Instant) -> Duration {
        let start = self.downtime_start.or(self.escalation_start).unwrap_or(now);
        self.total_downtime = Duration::from_secs(now.saturating_duration_since(start).as_secs());

        self.failures = 0;
        self.alert_sent = false;
        self.downtime_start = None;
        self.escalation_start = None;
        self.last_alert_at = None;
        self.previous = self.status;
        self.status = Status::Up;
        self.total_downtime
    }

    /// Live downtime while an outage is open, otherwise the last snapshot.
    pub fn downtime(&self, now: Instant) -> Duration {
        match self.downtime_start {
            Some(start) => now.saturating_duration_since(start),
            None => self.total_downtime,
        }
    }

    /// Back to a fresh instance, keeping the policy.
    pub fn reset(&mut self) {
        *self = Self::new(self.policy.clone());
    }

    pub fn phase(&self, now: Instant) -> AlertPhase {
        if self.alert_sent {
            if self.status.is_failure() {
                AlertPhase::AlertActive
            } else if self.should_recover(now) {
                AlertPhase::Recovered
            } else {
                AlertPhase::RecoveringPending
            }
        } else if !self.status.is_failure() || self.failures == 0 {
            AlertPhase::Healthy
        } else if self.failures >= self.policy.failure_threshold {
            AlertPhase::AlertPending
        } else {
            AlertPhase::Degrading
        }
    }
}

impl Default for AlertState {
    fn default() -> Self {
        Self::new(AlertPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn below_threshold_never_alerts() {
        let t0 = Instant::now();
        let mut s = AlertState::default();
        for status in [Status::Down, Status::Unknown] {
            s.update(status, 0, t0);
            assert!(!s.should_alert(t0 + secs(3600)));
        }
        assert_eq!(s.failures(), 2);
        assert_eq!(s.phase(t0), AlertPhase::Degrading);
    }

    #[test]
    fn downtime_start_is_first_failure() {
        let t0 = Instant::now();
        let mut s = AlertState::default();
        s.update(Status::Down, 0, t0);
        s.update(Status::Down, 0, t0 + secs(30));
        assert_eq!(s.downtime_start(), Some(t0));
        assert_eq!(s.downtime(t0 + secs(45)), secs(45));
    }

    #[test]
    fn alert_sent_implies_escalation_start() {
        let t0 = Instant::now();
        let mut s = AlertState::default();
        s.mark_alert_sent(t0);
        assert!(s.alert_sent());
        assert_eq!(s.escalation_start(), Some(t0));
    }

    #[test]
    fn recovery_needs_prior_alert_and_cooldown() {
        let t0 = Instant::now();
        let mut s = AlertState::default();
        for i in 0..3 {
            s.update(Status::Down, 0, t0 + secs(i));
        }
        assert_eq!(s.phase(t0 + secs(2)), AlertPhase::AlertPending);
        s.mark_alert_sent(t0 + secs(2));
        assert_eq!(s.phase(t0 + secs(2)), AlertPhase::AlertActive);

        s.update(Status::Up, 12, t0 + secs(10));
        // Still counting: failures reset only on a delivered recovery.
        assert_eq!(s.failures(), 3);
        assert!(!s.should_recover(t0 + secs(10)));
        assert_eq!(s.phase(t0 + secs(10)), AlertPhase::RecoveringPending);
        assert!(s.should_recover(t0 + secs(62)));
        assert_eq!(s.phase(t0 + secs(62)), AlertPhase::Recovered);
    }

    #[test]
    fn mark_recovered_resets_and_keeps_snapshot() {
        let t0 = Instant::now();
        let mut s = AlertState::default();
        for i in 0..3 {
            s.update(Status::Down, 0, t0 + secs(i * 30));
        }
        s.mark_alert_sent(t0 + secs(60));
        s.update(Status::Up, 8, t0 + secs(90));
        let total = s.mark_recovered(t0 + secs(125));

        assert_eq!(total, secs(125));
        assert_eq!(s.failures(), 0);
        assert!(!s.alert_sent());
        assert!(s.downtime_start().is_none());
        assert!(s.last_alert_at().is_none());
        assert_eq!(s.downtime(t0 + secs(9999)), secs(125));
        assert_eq!(s.phase(t0 + secs(200)), AlertPhase::Healthy);
    }

    #[test]
    fn unknown_counts_as_failure() {
        let t0 = Instant::now();
        let mut s = AlertState::new(AlertPolicy {
            failure_threshold: 2,
            ..AlertPolicy::default()
        });
        s.update(Status::Unknown, 0, t0);
        s.update(Status::Unknown, 0, t0 + secs(1));
        assert!(s.should_alert(t0 + secs(1)));
    }

    #[test]
    fn reset_keeps_policy() {
        let policy = AlertPolicy {
            failure_threshold: 5,
            ..AlertPolicy::default()
        };
        let mut s = AlertState::new(policy.clone());
        s.update(Status::Down, 0, Instant::now());
        s.reset();
        assert_eq!(s.failures(), 0);
        assert_eq!(s.policy(), &policy);
        assert_eq!(s.status(), Status::Unknown);
    }
}

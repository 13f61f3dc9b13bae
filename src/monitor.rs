//! Scan orchestration: one pass over the targets, in order, under a wall-clock
//! budget and the Resource Guard's critical-memory check.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::error::ErrorCategory;
use crate::notify::{AlertManager, Notice};
use crate::resource::ResourceGuard;
use crate::scheduler::EventSender;
use crate::transport::{ProbeResult, Prober};
use crate::types::{ScanEvent, Status, Target, TargetSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanLimits {
    pub interval_ms: u64,
    /// Per-request timeout handed to the prober (still capped by the transport).
    pub request_timeout_ms: u64,
    /// Whole-pass budget; targets not reached in time are skipped.
    pub scan_budget_ms: u64,
    /// A failed check that took longer than this is reported as a timeout.
    pub target_budget_ms: u64,
    /// Delay after each target.
    pub pacing_ms: u64,
    /// Delay before each probe.
    pub settle_ms: u64,
    /// A pass running longer than this is force-stopped by the supervisor.
    pub stuck_after_ms: u64,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            request_timeout_ms: 10_000,
            scan_budget_ms: 30_000,
            target_budget_ms: 11_000,
            pacing_ms: 200,
            settle_ms: 50,
            stuck_after_ms: 60_000,
        }
    }
}

/// Why a pass stopped before the last target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    BudgetExceeded,
    ResourceExhausted,
    ForceStopped,
}

/// Why a target was marked down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownReason {
    /// The check outlived the per-target budget.
    Timeout,
    Failed(Option<ErrorCategory>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub checked: usize,
    pub skipped: usize,
    pub up: usize,
    pub down: usize,
    pub aborted: Option<AbortReason>,
    pub duration_ms: u64,
    pub alerts_sent: usize,
    pub recoveries_sent: usize,
}

/// Map a probe outcome to a status. Never yields `Unknown`: a timeout has to
/// be able to alert.
pub fn classify(
    result: &ProbeResult,
    elapsed: Duration,
    target_budget: Duration,
) -> (Status, Option<DownReason>) {
    if result.is_success() {
        (Status::Up, None)
    } else if elapsed > target_budget {
        (Status::Down, Some(DownReason::Timeout))
    } else {
        (Status::Down, Some(DownReason::Failed(result.error)))
    }
}

/// Scan state shared between the scan context, the supervisor and the API.
///
/// The scanning flag is the only `Idle`/`Scanning` state. Whoever clears it
/// emits `ScanCompleted`, so a pass ends with exactly one completion event
/// even when it is force-stopped.
#[derive(Debug)]
pub struct ScanControl {
    scanning: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    interval_ms: AtomicU64,
    stuck_after: Duration,
    scan_requested: AtomicBool,
    wake: Notify,
    passes: AtomicU64,
    forced_stops: AtomicU64,
    events: EventSender,
}

impl ScanControl {
    pub fn new(limits: &ScanLimits, events: EventSender) -> Self {
        Self {
            scanning: AtomicBool::new(false),
            started_at: Mutex::new(None),
            interval_ms: AtomicU64::new(limits.interval_ms.max(1)),
            stuck_after: Duration::from_millis(limits.stuck_after_ms),
            scan_requested: AtomicBool::new(false),
            wake: Notify::new(),
            passes: AtomicU64::new(0),
            forced_stops: AtomicU64::new(0),
            events,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Zero is ignored.
    pub fn set_interval(&self, interval: Duration) {
        let ms = interval.as_millis() as u64;
        if ms == 0 {
            tracing::warn!("ignoring zero scan interval");
            return;
        }
        self.interval_ms.store(ms, Ordering::Relaxed);
        tracing::info!(interval_ms = ms, "scan interval changed");
    }

    /// Ask for a pass as soon as the scan context is free.
    pub fn request_scan(&self) {
        self.scan_requested.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn take_scan_request(&self) -> bool {
        self.scan_requested.swap(false, Ordering::AcqRel)
    }

    /// Resolves when a scan is requested.
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    pub fn scan_age(&self) -> Option<Duration> {
        if !self.is_scanning() {
            return None;
        }
        self.started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed())
    }

    pub fn is_stuck(&self) -> bool {
        matches!(self.scan_age(), Some(age) if age > self.stuck_after)
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn forced_stops(&self) -> u64 {
        self.forced_stops.load(Ordering::Relaxed)
    }

    /// Clear the scanning flag and tell presentation the pass is over. The
    /// request in flight is not cancelled; the pass stops at the next target.
    pub fn force_stop(&self) -> bool {
        if !self.finish_pass() {
            return false;
        }
        self.forced_stops.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("scan force-stopped");
        self.events.emit(ScanEvent::ScanCompleted);
        true
    }

    /// Force-stop when the pass has outlived `stuck_after_ms`.
    pub fn supervise(&self) -> bool {
        if self.is_stuck() {
            tracing::warn!(age = ?self.scan_age(), "scan considered stuck");
            return self.force_stop();
        }
        false
    }

    pub(crate) fn emit(&self, event: ScanEvent) -> bool {
        self.events.emit(event)
    }

    fn begin_pass(&self) -> bool {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.passes.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn finish_pass(&self) -> bool {
        self.scanning
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Owns the targets and their alert states. Only the scan context mutates them.
pub struct ScanOrchestrator {
    targets: Vec<Target>,
    alerts: AlertManager,
    prober: Arc<dyn Prober>,
    guard: Arc<ResourceGuard>,
    control: Arc<ScanControl>,
    limits: ScanLimits,
    last_pass: Option<Instant>,
    last_summary: Option<ScanSummary>,
}

impl ScanOrchestrator {
    pub fn new(
        targets: Vec<Target>,
        alerts: AlertManager,
        prober: Arc<dyn Prober>,
        guard: Arc<ResourceGuard>,
        control: Arc<ScanControl>,
        limits: ScanLimits,
    ) -> Self {
        let mut alerts = alerts;
        alerts.resize(targets.len());
        if targets.is_empty() {
            tracing::warn!("no targets configured");
        }
        Self {
            targets,
            alerts,
            prober,
            guard,
            control,
            limits,
            last_pass: None,
            last_summary: None,
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn snapshots(&self) -> Vec<TargetSnapshot> {
        self.targets.iter().map(Target::snapshot).collect()
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn control(&self) -> &Arc<ScanControl> {
        &self.control
    }

    pub fn last_summary(&self) -> Option<&ScanSummary> {
        self.last_summary.as_ref()
    }

    /// Time until the next scheduled pass; zero when due.
    pub fn until_due(&self) -> Duration {
        match self.last_pass {
            None => Duration::ZERO,
            Some(at) => self.control.interval().saturating_sub(at.elapsed()),
        }
    }

    /// Run a pass when the interval has elapsed or one was requested.
    pub async fn tick(&mut self) -> Option<ScanSummary> {
        let requested = self.control.take_scan_request();
        if requested || self.until_due().is_zero() {
            self.run_pass().await
        } else {
            None
        }
    }

    /// One pass over every target. `None` if a pass is already running.
    pub async fn run_pass(&mut self) -> Option<ScanSummary> {
        if !self.control.begin_pass() {
            tracing::debug!("scan already in progress");
            return None;
        }
        let started = Instant::now();
        let budget = Duration::from_millis(self.limits.scan_budget_ms);
        let pacing = Duration::from_millis(self.limits.pacing_ms);
        let total = self.targets.len();
        tracing::info!(targets = total, "scan started");
        self.control.emit(ScanEvent::ScanStarted);

        let mut summary = ScanSummary {
            checked: 0,
            skipped: 0,
            up: 0,
            down: 0,
            aborted: None,
            duration_ms: 0,
            alerts_sent: 0,
            recoveries_sent: 0,
        };

        for index in 0..total {
            self.guard.feed_liveness();
            if !self.control.is_scanning() {
                summary.aborted = Some(AbortReason::ForceStopped);
                break;
            }
            if started.elapsed() > budget {
                tracing::warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    remaining = total - index,
                    "scan budget exceeded, skipping remaining targets"
                );
                summary.aborted = Some(AbortReason::BudgetExceeded);
                break;
            }
            if self.guard.is_critical() {
                tracing::warn!(
                    free_bytes = ?self.guard.free_bytes(),
                    remaining = total - index,
                    "critical memory, aborting scan"
                );
                summary.aborted = Some(AbortReason::ResourceExhausted);
                break;
            }

            let (status, notice) = self.check_target(index).await;
            summary.checked += 1;
            match status {
                Status::Up => summary.up += 1,
                _ => summary.down += 1,
            }
            match notice {
                Some(Notice::Outage) => summary.alerts_sent += 1,
                Some(Notice::Recovery) => summary.recoveries_sent += 1,
                None => {}
            }
            time::sleep(pacing).await;
        }

        summary.skipped = total - summary.checked;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        if self.control.finish_pass() {
            self.control.emit(ScanEvent::ScanCompleted);
        }
        tracing::info!(
            checked = summary.checked,
            skipped = summary.skipped,
            up = summary.up,
            down = summary.down,
            aborted = ?summary.aborted,
            duration_ms = summary.duration_ms,
            "scan completed"
        );
        self.last_pass = Some(Instant::now());
        self.last_summary = Some(summary.clone());
        Some(summary)
    }

    async fn check_target(&mut self, index: usize) -> (Status, Option<Notice>) {
        time::sleep(Duration::from_millis(self.limits.settle_ms)).await;

        let timeout = Duration::from_millis(self.limits.request_timeout_ms);
        let start = Instant::now();
        let result = self.prober.check(&self.targets[index], Some(timeout)).await;
        let elapsed = start.elapsed();
        self.guard.feed_liveness();

        let target_budget = Duration::from_millis(self.limits.target_budget_ms);
        let (status, reason) = classify(&result, elapsed, target_budget);
        let target = &mut self.targets[index];
        target.status = status;
        target.latency_ms = result.latency_ms;
        match reason {
            None => {
                tracing::debug!(name = %target.name, latency_ms = result.latency_ms, "target up")
            }
            Some(DownReason::Timeout) => tracing::warn!(
                name = %target.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "target timed out"
            ),
            Some(DownReason::Failed(category)) => tracing::info!(
                name = %target.name,
                category = ?category,
                code = ?result.http_code,
                "target down"
            ),
        }

        let name = target.name.clone();
        let notice = self
            .alerts
            .on_status(index, &name, status, result.latency_ms, Instant::now())
            .await;
        self.control.emit(ScanEvent::TargetUpdated {
            index,
            status,
            latency_ms: result.latency_ms,
        });
        (status, notice)
    }
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("targets", &self.targets.len())
            .field("limits", &self.limits)
            .field("last_summary", &self.last_summary)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::event_queue;

    #[test]
    fn classification() {
        let budget = Duration::from_secs(11);
        let up = ProbeResult::up(30, 200, 1);
        assert_eq!(classify(&up, Duration::from_secs(20), budget), (Status::Up, None));

        let failed = ProbeResult::failed(Some(404), ErrorCategory::Permanent, 1);
        assert_eq!(
            classify(&failed, Duration::from_secs(12), budget),
            (Status::Down, Some(DownReason::Timeout))
        );
        assert_eq!(
            classify(&failed, Duration::from_secs(1), budget),
            (Status::Down, Some(DownReason::Failed(Some(ErrorCategory::Permanent))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_scan_is_force_stopped_once() {
        let (tx, mut rx) = event_queue(8).unwrap();
        let control = ScanControl::new(&ScanLimits::default(), tx);
        assert!(control.begin_pass());
        assert!(!control.begin_pass());
        assert!(!control.supervise());

        time::advance(Duration::from_secs(61)).await;
        assert!(control.is_stuck());
        assert!(control.supervise());
        assert!(!control.is_scanning());
        assert!(!control.force_stop());
        assert!(!control.finish_pass());

        assert_eq!(rx.try_next(), Some(ScanEvent::ScanCompleted));
        assert_eq!(rx.try_next(), None);
        assert_eq!(control.forced_stops(), 1);
    }

    #[test]
    fn interval_setter_rejects_zero() {
        let (tx, _rx) = event_queue(1).unwrap();
        let control = ScanControl::new(&ScanLimits::default(), tx);
        control.set_interval(Duration::ZERO);
        assert_eq!(control.interval(), Duration::from_secs(30));
        control.set_interval(Duration::from_secs(10));
        assert_eq!(control.interval(), Duration::from_secs(10));
    }

    #[test]
    fn scan_request_is_consumed() {
        let (tx, _rx) = event_queue(1).unwrap();
        let control = ScanControl::new(&ScanLimits::default(), tx);
        control.request_scan();
        assert!(control.take_scan_request());
        assert!(!control.take_scan_request());
    }
}

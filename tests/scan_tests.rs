use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nebula_watch::alert::AlertPolicy;
use nebula_watch::error::ErrorCategory;
use nebula_watch::monitor::{AbortReason, ScanControl, ScanLimits, ScanOrchestrator};
use nebula_watch::notify::{AlertChannel, AlertManager};
use nebula_watch::resource::{FixedHeap, ResourceGuard, ResourceSettings};
use nebula_watch::scheduler::{event_queue, EventReceiver};
use nebula_watch::transport::{ProbeResult, Prober};
use nebula_watch::types::{CheckKind, ScanEvent, Status, Target};

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy)]
struct Step {
    delay: Duration,
    up: bool,
}

/// Answers per target name; unknown names are up immediately.
#[derive(Default)]
struct ScriptedProber {
    steps: HashMap<String, Step>,
    calls: Mutex<Vec<String>>,
    hooks: HashMap<usize, Hook>,
}

impl ScriptedProber {
    fn step(mut self, name: &str, delay_ms: u64, up: bool) -> Self {
        self.steps.insert(
            name.into(),
            Step {
                delay: Duration::from_millis(delay_ms),
                up,
            },
        );
        self
    }

    /// Run `hook` right after the `n`th call (1-based).
    fn after_call(mut self, n: usize, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.insert(n, Box::new(hook));
        self
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn check(&self, target: &Target, _timeout: Option<Duration>) -> ProbeResult {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(target.name.clone());
            calls.len()
        };
        let step = self.steps.get(&target.name).copied().unwrap_or(Step {
            delay: Duration::ZERO,
            up: true,
        });
        tokio::time::sleep(step.delay).await;
        if let Some(hook) = self.hooks.get(&n) {
            hook();
        }
        if step.up {
            ProbeResult::up(20, 200, 1)
        } else {
            ProbeResult::failed(None, ErrorCategory::Temporary, 1)
        }
    }
}

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl AlertChannel for RecordingChannel {
    async fn send(&self, message: &str) -> bool {
        self.sent.lock().unwrap().push(message.to_string());
        true
    }
}

fn targets(n: usize) -> Vec<Target> {
    (1..=n)
        .map(|i| {
            Target::new(format!("t{i}"), format!("http://10.0.0.{i}"), CheckKind::Reachability)
        })
        .collect()
}

struct Harness {
    orchestrator: ScanOrchestrator,
    prober: Arc<ScriptedProber>,
    control: Arc<ScanControl>,
    events: EventReceiver,
    heap: Arc<FixedHeap>,
    guard: Arc<ResourceGuard>,
}

fn harness(
    count: usize,
    prober: ScriptedProber,
    channel: Option<Arc<dyn AlertChannel>>,
) -> Harness {
    harness_with(count, prober, channel, Arc::new(FixedHeap::new(10_000_000)))
}

fn harness_with(
    count: usize,
    prober: ScriptedProber,
    channel: Option<Arc<dyn AlertChannel>>,
    heap: Arc<FixedHeap>,
) -> Harness {
    let guard = Arc::new(ResourceGuard::new(ResourceSettings::default(), heap.clone()));
    let (tx, events) = event_queue(64).unwrap();
    let limits = ScanLimits::default();
    let control = Arc::new(ScanControl::new(&limits, tx));
    let prober = Arc::new(prober);
    let alerts = AlertManager::new(count, AlertPolicy::default(), channel, 0);
    let orchestrator = ScanOrchestrator::new(
        targets(count),
        alerts,
        prober.clone(),
        guard.clone(),
        control.clone(),
        limits,
    );
    Harness {
        orchestrator,
        prober,
        control,
        events,
        heap,
        guard,
    }
}

fn drain(events: &mut EventReceiver) -> Vec<ScanEvent> {
    std::iter::from_fn(|| events.try_next()).collect()
}

fn completions(events: &[ScanEvent]) -> usize {
    events.iter().filter(|e| **e == ScanEvent::ScanCompleted).count()
}

#[tokio::test(start_paused = true)]
async fn slow_target_is_down_and_scan_continues() {
    let prober = ScriptedProber::default().step("t4", 12_000, false);
    let mut h = harness(6, prober, None);

    let summary = h.orchestrator.run_pass().await.unwrap();
    assert_eq!(summary.checked, 6);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.aborted, None);
    assert_eq!(*h.prober.calls.lock().unwrap(), ["t1", "t2", "t3", "t4", "t5", "t6"]);

    let t = h.orchestrator.targets();
    assert_eq!(t[3].status, Status::Down);
    assert_eq!(t[3].latency_ms, 0);
    assert_eq!(t[4].status, Status::Up);

    let events = drain(&mut h.events);
    assert_eq!(events.first(), Some(&ScanEvent::ScanStarted));
    assert_eq!(events.last(), Some(&ScanEvent::ScanCompleted));
    assert!(events.contains(&ScanEvent::TargetUpdated {
        index: 3,
        status: Status::Down,
        latency_ms: 0
    }));
    assert!(!h.control.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn critical_memory_skips_remaining_targets() {
    let heap = Arc::new(FixedHeap::new(10_000_000));
    let trip = heap.clone();
    let prober = ScriptedProber::default().after_call(3, move || trip.set(5_000));
    let mut h = harness_with(6, prober, None, heap);

    let summary = h.orchestrator.run_pass().await.unwrap();
    assert_eq!(summary.checked, 3);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.aborted, Some(AbortReason::ResourceExhausted));
    assert_eq!(h.prober.calls.lock().unwrap().len(), 3);
    assert!(h.orchestrator.targets()[3..].iter().all(|t| t.status == Status::Unknown));

    let events = drain(&mut h.events);
    assert_eq!(completions(&events), 1);
    assert_eq!(events.last(), Some(&ScanEvent::ScanCompleted));

    // Memory back: the next pass covers everything.
    h.heap.set(10_000_000);
    assert_eq!(h.orchestrator.run_pass().await.unwrap().checked, 6);
}

#[tokio::test(start_paused = true)]
async fn scan_budget_skips_the_tail() {
    let mut prober = ScriptedProber::default();
    for i in 1..=6 {
        prober = prober.step(&format!("t{i}"), 9_000, false);
    }
    let mut h = harness(6, prober, None);

    let summary = h.orchestrator.run_pass().await.unwrap();
    assert_eq!(summary.aborted, Some(AbortReason::BudgetExceeded));
    assert_eq!(summary.checked, 4);
    assert_eq!(summary.skipped, 2);
    assert_eq!(completions(&drain(&mut h.events)), 1);
}

#[tokio::test(start_paused = true)]
async fn force_stop_mid_pass_completes_once() {
    let heap = Arc::new(FixedHeap::new(10_000_000));
    let guard = Arc::new(ResourceGuard::new(ResourceSettings::default(), heap));
    let (tx, mut events) = event_queue(64).unwrap();
    let limits = ScanLimits::default();
    let control = Arc::new(ScanControl::new(&limits, tx));

    let stopper = control.clone();
    let prober = Arc::new(ScriptedProber::default().after_call(2, move || {
        assert!(stopper.force_stop());
    }));
    let mut orchestrator = ScanOrchestrator::new(
        targets(5),
        AlertManager::new(5, AlertPolicy::default(), None, 0),
        prober.clone(),
        guard,
        control.clone(),
        limits,
    );

    let summary = orchestrator.run_pass().await.unwrap();
    assert_eq!(summary.aborted, Some(AbortReason::ForceStopped));
    // The request in flight finishes and is recorded.
    assert_eq!(summary.checked, 2);
    assert_eq!(prober.calls.lock().unwrap().len(), 2);
    assert_eq!(orchestrator.targets()[1].status, Status::Up);

    let all = drain(&mut events);
    assert_eq!(completions(&all), 1);
    assert_eq!(control.forced_stops(), 1);
    assert!(!control.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn sustained_outage_alerts_once_per_cooldown() {
    let channel = Arc::new(RecordingChannel::default());
    let prober = ScriptedProber::default().step("t2", 100, false);
    let mut h = harness(3, prober, Some(channel.clone() as Arc<dyn AlertChannel>));

    for pass in 1..=4 {
        let summary = h.orchestrator.run_pass().await.unwrap();
        let expected = usize::from(pass == 3);
        assert_eq!(summary.alerts_sent, expected, "pass {pass}");
        tokio::time::advance(Duration::from_secs(30)).await;
    }
    assert_eq!(channel.sent.lock().unwrap().len(), 1);
    assert!(channel.sent.lock().unwrap()[0].contains("t2"));
    assert_eq!(h.orchestrator.alerts().state(1).unwrap().failures(), 4);
    assert_eq!(h.orchestrator.alerts().state(0).unwrap().failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn tick_follows_interval_and_requests() {
    let mut h = harness(2, ScriptedProber::default(), None);

    assert!(h.orchestrator.tick().await.is_some());
    assert!(h.orchestrator.tick().await.is_none());

    h.control.request_scan();
    assert!(h.orchestrator.tick().await.is_some());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(h.orchestrator.tick().await.is_some());
    assert_eq!(h.control.passes(), 3);
}

#[tokio::test(start_paused = true)]
async fn empty_target_list_still_brackets_the_pass() {
    let mut h = harness(0, ScriptedProber::default(), None);
    let summary = h.orchestrator.run_pass().await.unwrap();
    assert_eq!(summary.checked, 0);
    assert_eq!(
        drain(&mut h.events),
        vec![ScanEvent::ScanStarted, ScanEvent::ScanCompleted]
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_check_starves_liveness_watchdog() {
    // t2 ignores its timeout and hangs for two minutes.
    let prober = ScriptedProber::default().step("t2", 120_000, true);
    let mut h = harness(3, prober, None);
    let guard = h.guard.clone();

    let watchdog = async {
        let mut seen = Vec::new();
        for _ in 0..14 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            seen.push(guard.watch_liveness());
        }
        seen
    };
    let (summary, seen) = tokio::join!(h.orchestrator.run_pass(), watchdog);

    assert!(summary.is_some());
    // 20 s silent: fine. 40 s to 120 s: starved. After t2 returns: fed again.
    assert!(!seen[1]);
    assert!(seen[3..=11].iter().all(|s| *s));
    assert!(!seen[12] && !seen[13]);
    let snap = h.guard.snapshot();
    assert_eq!(snap.liveness_stalls, 1);
    assert!(!snap.liveness_starved);
}

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nebula_watch::config::MonitorConfig;
use nebula_watch::engine::Engine;
use nebula_watch::link::StaticLink;
use nebula_watch::resource::FixedHeap;
use nebula_watch::scheduler::PresentationSink;
use nebula_watch::transport::{ProbeResult, Prober};
use nebula_watch::types::{CheckKind, Status, Target};

struct AlwaysUp;

#[async_trait]
impl Prober for AlwaysUp {
    async fn check(&self, _target: &Target, _timeout: Option<Duration>) -> ProbeResult {
        ProbeResult::up(7, 200, 1)
    }
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl PresentationSink for Log {
    fn on_scan_started(&mut self) {
        self.0.lock().unwrap().push("started".into());
    }

    fn on_scan_completed(&mut self) {
        self.0.lock().unwrap().push("completed".into());
    }

    fn on_target_updated(&mut self, index: usize, status: Status, _latency_ms: u64) {
        self.0.lock().unwrap().push(format!("{index}:{status}"));
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn engine() -> Engine {
    let mut config = MonitorConfig::default();
    config.targets = vec![
        Target::new("a", "http://10.0.0.1", CheckKind::Reachability),
        Target::new("b", "http://10.0.0.2", CheckKind::Reachability),
    ];
    config.scan.interval_ms = 3_600_000;
    config.scan.pacing_ms = 0;
    config.scan.settle_ms = 0;
    Engine::build_with(
        config,
        Arc::new(StaticLink::new(true)),
        FixedHeap::new(10_000_000),
        None,
        Some(Arc::new(AlwaysUp)),
    )
    .unwrap()
}

#[test]
fn contexts_run_a_pass_and_feed_presentation() {
    let engine = engine();
    let board = engine.board().clone();
    let log = Log::default();
    let handle = engine.start(vec![Box::new(log.clone())]).unwrap();

    wait_for("first pass", || board.completed_passes() >= 1);
    assert!(board.targets().iter().all(|t| t.status == Status::Up && t.latency_ms == 7));
    assert_eq!(
        log.0.lock().unwrap()[..4],
        ["started", "0:UP", "1:UP", "completed"]
    );

    handle.control().request_scan();
    wait_for("requested pass", || board.completed_passes() >= 2);
    assert_eq!(handle.control().passes(), 2);

    handle.stop();
}

#[test]
fn stop_returns_promptly_while_idle() {
    let engine = engine();
    let board = engine.board().clone();
    let handle = engine.start(Vec::new()).unwrap();
    wait_for("first pass", || board.completed_passes() >= 1);

    let start = Instant::now();
    handle.stop();
    assert!(start.elapsed() < Duration::from_secs(2));
}

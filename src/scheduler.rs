//! Dual-context scheduler.
//!
//! Two OS threads, each with its own single-threaded tokio runtime: the scan
//! context owns the [`ScanOrchestrator`] (and so every target and alert state),
//! the presentation context drains the [`ScanEvent`] queue into a
//! [`PresentationSink`]. The queue is the only channel between them. The
//! presentation context also runs the stuck-scan supervisor and the liveness
//! watchdog, so a starved scan context is noticed from outside.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::InitError;
use crate::monitor::{ScanControl, ScanOrchestrator};
use crate::resource::ResourceGuard;
use crate::types::{ScanEvent, Status, TargetSnapshot};

/// The network stack is the deepest call chain, so the scan context gets more.
const SCAN_STACK_BYTES: usize = 8 * 1024 * 1024;
const PRESENT_STACK_BYTES: usize = 2 * 1024 * 1024;

/// Longest idle sleep in the scan loop.
const SCAN_IDLE: Duration = Duration::from_millis(100);
const PRESENT_TICK: Duration = Duration::from_millis(10);

/// Create the bounded scan-event queue.
pub fn event_queue(capacity: usize) -> Result<(EventSender, EventReceiver), InitError> {
    if capacity == 0 {
        return Err(InitError::EventQueue);
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventReceiver { rx },
    ))
}

/// Producer side. Never blocks: when the queue is full the event is dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ScanEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub fn emit(&self, event: ScanEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = ?ev, "event queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("event queue closed");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<ScanEvent>,
}

impl EventReceiver {
    pub fn try_next(&mut self) -> Option<ScanEvent> {
        self.rx.try_recv().ok()
    }

    /// Forward everything queued right now; returns the number of events.
    pub fn drain(&mut self, sink: &mut dyn PresentationSink) -> usize {
        let mut n = 0;
        while let Some(event) = self.try_next() {
            dispatch(sink, event);
            n += 1;
        }
        n
    }
}

/// Display collaborator.
pub trait PresentationSink: Send {
    fn on_scan_started(&mut self);
    fn on_scan_completed(&mut self);
    fn on_target_updated(&mut self, index: usize, status: Status, latency_ms: u64);

    /// Called once per presentation tick after the queue was drained.
    fn refresh(&mut self) {}
}

pub fn dispatch(sink: &mut dyn PresentationSink, event: ScanEvent) {
    match event {
        ScanEvent::ScanStarted => sink.on_scan_started(),
        ScanEvent::ScanCompleted => sink.on_scan_completed(),
        ScanEvent::TargetUpdated {
            index,
            status,
            latency_ms,
        } => sink.on_target_updated(index, status, latency_ms),
    }
}

impl PresentationSink for Vec<Box<dyn PresentationSink>> {
    fn on_scan_started(&mut self) {
        self.iter_mut().for_each(|s| s.on_scan_started());
    }

    fn on_scan_completed(&mut self) {
        self.iter_mut().for_each(|s| s.on_scan_completed());
    }

    fn on_target_updated(&mut self, index: usize, status: Status, latency_ms: u64) {
        self.iter_mut()
            .for_each(|s| s.on_target_updated(index, status, latency_ms));
    }

    fn refresh(&mut self) {
        self.iter_mut().for_each(|s| s.refresh());
    }
}

#[derive(Debug, Default)]
struct Board {
    targets: Vec<TargetSnapshot>,
    scanning: bool,
    completed_passes: u64,
    last_completed: Option<Instant>,
}

/// Read-only target model rebuilt from the event stream. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Board>>,
}

impl StatusBoard {
    pub fn new(targets: Vec<TargetSnapshot>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Board {
                targets,
                ..Board::default()
            })),
        }
    }

    pub fn targets(&self) -> Vec<TargetSnapshot> {
        self.read().targets.clone()
    }

    pub fn target(&self, index: usize) -> Option<TargetSnapshot> {
        self.read().targets.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_scanning(&self) -> bool {
        self.read().scanning
    }

    pub fn completed_passes(&self) -> u64 {
        self.read().completed_passes
    }

    pub fn since_last_completed(&self) -> Option<Duration> {
        self.read().last_completed.map(|at| at.elapsed())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Board> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Board> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl PresentationSink for StatusBoard {
    fn on_scan_started(&mut self) {
        self.write().scanning = true;
    }

    fn on_scan_completed(&mut self) {
        let mut b = self.write();
        b.scanning = false;
        b.completed_passes += 1;
        b.last_completed = Some(Instant::now());
    }

    fn on_target_updated(&mut self, index: usize, status: Status, latency_ms: u64) {
        let mut b = self.write();
        match b.targets.get_mut(index) {
            Some(t) => {
                t.status = status;
                t.latency_ms = latency_ms;
            }
            None => tracing::warn!(index, "update for unknown target index"),
        }
    }
}

/// Running scheduler. Dropping it cancels both contexts without joining.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    control: Arc<ScanControl>,
    scan: Option<JoinHandle<()>>,
    present: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn control(&self) -> &Arc<ScanControl> {
        &self.control
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel both contexts and wait for them. A pass in progress is abandoned
    /// at its next suspension point.
    pub fn stop(mut self) {
        self.cancel.cancel();
        for (name, handle) in [("scan", self.scan.take()), ("present", self.present.take())] {
            if let Some(h) = handle {
                if h.join().is_err() {
                    tracing::error!(context = name, "execution context panicked");
                }
            }
        }
        tracing::info!("scheduler stopped");
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Spawn the scan and presentation contexts.
    pub fn start(
        orchestrator: ScanOrchestrator,
        events: EventReceiver,
        sink: Box<dyn PresentationSink>,
        guard: Arc<ResourceGuard>,
    ) -> Result<SchedulerHandle, InitError> {
        let cancel = CancellationToken::new();
        let control = orchestrator.control().clone();

        let scan_rt = runtime("scan-ctx")?;
        let present_rt = runtime("present-ctx")?;

        let scan = {
            let cancel = cancel.clone();
            let guard = guard.clone();
            spawn_context("scan-ctx", SCAN_STACK_BYTES, move || {
                scan_rt.block_on(scan_loop(orchestrator, guard, cancel))
            })?
        };

        let present = {
            let cancel = cancel.clone();
            let control = control.clone();
            let guard = guard.clone();
            spawn_context("present-ctx", PRESENT_STACK_BYTES, move || {
                present_rt.block_on(present_loop(events, sink, control, guard, cancel))
            })
        };
        let present = match present {
            Ok(h) => h,
            Err(e) => {
                cancel.cancel();
                let _ = scan.join();
                return Err(e);
            }
        };

        tracing::info!("scheduler started");
        Ok(SchedulerHandle {
            cancel,
            control,
            scan: Some(scan),
            present: Some(present),
        })
    }
}

fn runtime(name: &'static str) -> Result<Runtime, InitError> {
    Builder::new_current_thread()
        .enable_all()
        .thread_name(name)
        .build()
        .map_err(|source| InitError::Runtime { name, source })
}

fn spawn_context<F>(name: &'static str, stack: usize, f: F) -> Result<JoinHandle<()>, InitError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .stack_size(stack)
        .spawn(f)
        .map_err(|source| InitError::SpawnContext { name, source })
}

async fn scan_loop(
    mut orchestrator: ScanOrchestrator,
    guard: Arc<ResourceGuard>,
    cancel: CancellationToken,
) {
    let control = orchestrator.control().clone();
    let memory_every = Duration::from_millis(guard.settings().memory_check_interval_ms);
    let mut last_memory_check = Instant::now();
    tracing::debug!("scan context running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = orchestrator.tick() => {}
        }
        guard.feed_liveness();

        if last_memory_check.elapsed() >= memory_every {
            last_memory_check = Instant::now();
            // Never reclaim under a request in flight.
            if guard.is_low() && !control.is_scanning() {
                guard.reclaim();
            }
        }

        let idle = orchestrator.until_due().min(SCAN_IDLE);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = control.woken() => {}
            _ = time::sleep(idle) => {}
        }
    }
    tracing::debug!("scan context exiting");
}

async fn present_loop(
    mut events: EventReceiver,
    mut sink: Box<dyn PresentationSink>,
    control: Arc<ScanControl>,
    guard: Arc<ResourceGuard>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(PRESENT_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!("presentation context running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        events.drain(sink.as_mut());
        control.supervise();
        guard.watch_liveness();
        sink.refresh();
    }
    events.drain(sink.as_mut());
    tracing::debug!("presentation context exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckKind, Target};

    #[test]
    fn zero_capacity_is_an_init_error() {
        assert!(matches!(event_queue(0), Err(InitError::EventQueue)));
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = event_queue(2).unwrap();
        assert!(tx.emit(ScanEvent::ScanStarted));
        assert!(tx.emit(ScanEvent::ScanCompleted));
        assert!(!tx.emit(ScanEvent::ScanStarted));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.try_next(), Some(ScanEvent::ScanStarted));
        assert_eq!(rx.try_next(), Some(ScanEvent::ScanCompleted));
        assert_eq!(rx.try_next(), None);
    }

    #[test]
    fn board_follows_events_in_order() {
        let targets = vec![
            Target::new("a", "http://a", CheckKind::Reachability).snapshot(),
            Target::new("b", "http://b", CheckKind::Reachability).snapshot(),
        ];
        let board = StatusBoard::new(targets);
        let (tx, mut rx) = event_queue(8).unwrap();
        tx.emit(ScanEvent::ScanStarted);
        tx.emit(ScanEvent::TargetUpdated {
            index: 1,
            status: Status::Up,
            latency_ms: 17,
        });
        tx.emit(ScanEvent::TargetUpdated {
            index: 9,
            status: Status::Down,
            latency_ms: 0,
        });

        let mut sink = board.clone();
        assert_eq!(rx.drain(&mut sink), 3);
        assert!(board.is_scanning());
        assert_eq!(board.target(1).unwrap().latency_ms, 17);
        assert_eq!(board.target(0).unwrap().status, Status::Unknown);

        tx.emit(ScanEvent::ScanCompleted);
        rx.drain(&mut sink);
        assert!(!board.is_scanning());
        assert_eq!(board.completed_passes(), 1);
    }
}

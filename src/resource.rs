//! Heap-pressure tracking and liveness pacing.
//!
//! Everything here is advisory: the engine stays correct if the probe cannot
//! read memory at all, it merely loses the ability to back off under pressure.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const MEMINFO_PATH: &str = "/proc/meminfo";

/// Thresholds and pacing intervals for the [`ResourceGuard`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub low_heap_bytes: u64,
    pub critical_heap_bytes: u64,
    /// Minimum spacing between two reclamation runs.
    pub reclaim_interval_ms: u64,
    /// Minimum spacing between two liveness signals.
    pub liveness_interval_ms: u64,
    /// Silence after which the liveness watchdog reports a starved loop.
    pub liveness_timeout_ms: u64,
    /// How often the scan context looks at memory pressure.
    pub memory_check_interval_ms: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            low_heap_bytes: 50_000,
            critical_heap_bytes: 20_000,
            reclaim_interval_ms: 120_000,
            liveness_interval_ms: 1_000,
            liveness_timeout_ms: 30_000,
            memory_check_interval_ms: 10_000,
        }
    }
}

/// Source of the current free-heap figure.
pub trait HeapProbe: Send + Sync {
    /// Free bytes, or `None` when the figure cannot be read.
    fn free_bytes(&self) -> Option<u64>;
}

/// Reads `MemAvailable` from a `/proc/meminfo`-formatted file.
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    pub fn new() -> Self {
        Self::from_path(MEMINFO_PATH)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Extract `MemAvailable` (kB in the file) as bytes.
    pub fn parse_available(content: &str) -> Option<u64> {
        content.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemAvailable:") => parts.next()?.parse::<u64>().ok().map(|kb| kb * 1024),
                _ => None,
            }
        })
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapProbe for ProcMeminfo {
    fn free_bytes(&self) -> Option<u64> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        Self::parse_available(&content)
    }
}

/// Something holding memory it can give back on request (idle connections,
/// cached buffers). Must be cheap and must not block.
pub trait Reclaimer: Send + Sync {
    fn name(&self) -> &str;
    fn reclaim(&self);
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub free_bytes: Option<u64>,
    pub low: bool,
    pub critical: bool,
    pub reclaim_runs: u64,
    pub liveness_signals: u64,
    pub liveness_age_ms: Option<u64>,
    pub liveness_starved: bool,
    pub liveness_stalls: u64,
}

pub struct ResourceGuard {
    settings: ResourceSettings,
    probe: Box<dyn HeapProbe>,
    reclaimers: Mutex<Vec<Arc<dyn Reclaimer>>>,
    last_reclaim: Mutex<Option<Instant>>,
    last_feed: Mutex<Option<Instant>>,
    reclaim_runs: AtomicU64,
    liveness_signals: AtomicU64,
    starved: AtomicBool,
    stalls: AtomicU64,
}

impl ResourceGuard {
    pub fn new(settings: ResourceSettings, probe: impl HeapProbe + 'static) -> Self {
        Self {
            settings,
            probe: Box::new(probe),
            reclaimers: Mutex::new(Vec::new()),
            last_reclaim: Mutex::new(None),
            last_feed: Mutex::new(None),
            reclaim_runs: AtomicU64::new(0),
            liveness_signals: AtomicU64::new(0),
            starved: AtomicBool::new(false),
            stalls: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ResourceSettings {
        &self.settings
    }

    pub fn register(&self, reclaimer: Arc<dyn Reclaimer>) {
        lock(&self.reclaimers).push(reclaimer);
    }

    pub fn free_bytes(&self) -> Option<u64> {
        self.probe.free_bytes()
    }

    pub fn is_low(&self) -> bool {
        matches!(self.free_bytes(), Some(free) if free < self.settings.low_heap_bytes)
    }

    pub fn is_critical(&self) -> bool {
        matches!(self.free_bytes(), Some(free) if free < self.settings.critical_heap_bytes)
    }

    /// Ask registered reclaimers to release memory.
    ///
    /// No-op when called again within `reclaim_interval_ms` or when memory is
    /// not under pressure. Returns whether a run happened.
    pub fn reclaim(&self) -> bool {
        let now = Instant::now();
        let interval = Duration::from_millis(self.settings.reclaim_interval_ms);
        let mut last = lock(&self.last_reclaim);
        if matches!(*last, Some(at) if now.duration_since(at) < interval) {
            return false;
        }
        let before = self.free_bytes();
        if !matches!(before, Some(free) if free < self.settings.low_heap_bytes) {
            tracing::debug!(free_bytes = ?before, "memory not under pressure, skipping reclaim");
            return false;
        }
        *last = Some(now);
        drop(last);

        tracing::info!(free_bytes = ?before, "reclaiming memory");
        let reclaimers = lock(&self.reclaimers).clone();
        for r in &reclaimers {
            tracing::debug!(reclaimer = r.name(), "running reclaimer");
            r.reclaim();
        }
        let after = self.free_bytes();
        tracing::info!(
            before = ?before,
            after = ?after,
            reclaimers = reclaimers.len(),
            "reclaim complete"
        );
        self.reclaim_runs.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Emit the keep-alive signal, at most once per `liveness_interval_ms`.
    ///
    /// Long loops call this on every iteration; calls inside the interval only
    /// cost a mutex check.
    pub fn feed_liveness(&self) {
        let now = Instant::now();
        let interval = Duration::from_millis(self.settings.liveness_interval_ms);
        let mut last = lock(&self.last_feed);
        if matches!(*last, Some(at) if now.duration_since(at) < interval) {
            return;
        }
        *last = Some(now);
        self.liveness_signals.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last keep-alive signal, `None` if none was ever sent.
    pub fn liveness_age(&self) -> Option<Duration> {
        lock(&self.last_feed).map(|at| at.elapsed())
    }

    /// Whether the keep-alive has been silent for longer than
    /// `liveness_timeout_ms`. A guard that was never fed is not starved.
    pub fn is_starved(&self) -> bool {
        let timeout = Duration::from_millis(self.settings.liveness_timeout_ms);
        matches!(self.liveness_age(), Some(age) if age > timeout)
    }

    /// Watchdog side of the keep-alive, called from a context other than the
    /// one feeding it. Logs once when a stall begins and once when it ends;
    /// returns whether the feeder is currently starved.
    pub fn watch_liveness(&self) -> bool {
        let starved = self.is_starved();
        let was = self.starved.swap(starved, Ordering::AcqRel);
        if starved && !was {
            self.stalls.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                silent_ms = self.liveness_age().map(|d| d.as_millis() as u64),
                timeout_ms = self.settings.liveness_timeout_ms,
                "liveness signal starved"
            );
        } else if was && !starved {
            tracing::info!("liveness signal resumed");
        }
        starved
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let free = self.free_bytes();
        MemorySnapshot {
            free_bytes: free,
            low: matches!(free, Some(f) if f < self.settings.low_heap_bytes),
            critical: matches!(free, Some(f) if f < self.settings.critical_heap_bytes),
            reclaim_runs: self.reclaim_runs.load(Ordering::Relaxed),
            liveness_signals: self.liveness_signals.load(Ordering::Relaxed),
            liveness_age_ms: self.liveness_age().map(|d| d.as_millis() as u64),
            liveness_starved: self.starved.load(Ordering::Relaxed),
            liveness_stalls: self.stalls.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("settings", &self.settings)
            .field("reclaim_runs", &self.reclaim_runs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A poisoned lock only means another thread panicked mid-update of a
/// timestamp or a list; the data is still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Probe returning a settable value. Used by tests and the one-shot CLI mode.
#[derive(Debug, Default)]
pub struct FixedHeap(AtomicU64);

impl FixedHeap {
    pub fn new(free_bytes: u64) -> Self {
        Self(AtomicU64::new(free_bytes))
    }

    pub fn set(&self, free_bytes: u64) {
        self.0.store(free_bytes, Ordering::Relaxed);
    }
}

impl HeapProbe for FixedHeap {
    fn free_bytes(&self) -> Option<u64> {
        Some(self.0.load(Ordering::Relaxed))
    }
}

impl<P: HeapProbe + ?Sized> HeapProbe for Arc<P> {
    fn free_bytes(&self) -> Option<u64> {
        (**self).free_bytes()
    }
}

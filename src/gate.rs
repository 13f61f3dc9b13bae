//! Exclusive-Access Gate: one permit serializing every secure-channel setup.
//!
//! Concurrent TLS handshakes are the largest single source of memory spikes,
//! so every TLS request attempt and every alert delivery holds a [`GateGuard`]
//! for its duration. The gate is not reentrant: acquiring it again while a
//! guard is alive in the same operation blocks until the wait bound expires.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};

#[derive(Debug, Default)]
struct Counters {
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    total_wait_ms: AtomicU64,
    max_wait_ms: AtomicU64,
    held: AtomicU64,
    stray_releases: AtomicU64,
}

/// Aggregate wait-time statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateStats {
    pub acquisitions: u64,
    pub timeouts: u64,
    pub avg_wait_ms: u64,
    pub max_wait_ms: u64,
    pub held: u64,
    pub stray_releases: u64,
}

#[derive(Debug, Clone)]
pub struct SecureGate {
    sem: Arc<Semaphore>,
    counters: Arc<Counters>,
    max_wait: Duration,
}

impl SecureGate {
    /// `max_wait` caps whatever timeout a caller asks for.
    pub fn new(max_wait: Duration) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
            counters: Arc::new(Counters::default()),
            max_wait,
        }
    }

    /// Wait up to `timeout` (clamped to the gate's maximum) for exclusive access.
    ///
    /// Returns `None` on timeout; the caller treats that as a failed attempt.
    pub async fn try_acquire(&self, timeout: Duration) -> Option<GateGuard> {
        let timeout = timeout.min(self.max_wait);
        let start = Instant::now();
        let res = time::timeout(timeout, self.sem.clone().acquire_owned()).await;
        let waited_ms = start.elapsed().as_millis() as u64;
        match res {
            Ok(Ok(permit)) => {
                let c = &self.counters;
                c.acquisitions.fetch_add(1, Ordering::Relaxed);
                c.total_wait_ms.fetch_add(waited_ms, Ordering::Relaxed);
                c.max_wait_ms.fetch_max(waited_ms, Ordering::Relaxed);
                let held = c.held.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(wait_ms = waited_ms, held, "secure gate acquired");
                Some(GateGuard {
                    permit: Some(permit),
                    counters: self.counters.clone(),
                    acquired_at: Instant::now(),
                })
            }
            // The semaphore is never closed, but a closed gate is just as unusable as a busy one.
            Ok(Err(_)) | Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(wait_ms = waited_ms, "secure gate wait timed out");
                None
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.sem.available_permits() == 0
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn stats(&self) -> GateStats {
        let c = &self.counters;
        let acquisitions = c.acquisitions.load(Ordering::Relaxed);
        let total = c.total_wait_ms.load(Ordering::Relaxed);
        GateStats {
            acquisitions,
            timeouts: c.timeouts.load(Ordering::Relaxed),
            avg_wait_ms: if acquisitions > 0 { total / acquisitions } else { 0 },
            max_wait_ms: c.max_wait_ms.load(Ordering::Relaxed),
            held: c.held.load(Ordering::Relaxed),
            stray_releases: c.stray_releases.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        c.acquisitions.store(0, Ordering::Relaxed);
        c.timeouts.store(0, Ordering::Relaxed);
        c.total_wait_ms.store(0, Ordering::Relaxed);
        c.max_wait_ms.store(0, Ordering::Relaxed);
        c.stray_releases.store(0, Ordering::Relaxed);
    }
}

/// Scoped hold on the gate. Dropping it releases the permit on every exit
/// path, including early returns and errors.
#[derive(Debug)]
pub struct GateGuard {
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
    acquired_at: Instant,
}

impl GateGuard {
    /// Release before the end of scope. A second call is reported and ignored.
    pub fn release(&mut self) {
        match self.permit.take() {
            Some(permit) => {
                drop(permit);
                self.counters.held.fetch_sub(1, Ordering::Relaxed);
                tracing::debug!(
                    held_ms = self.acquired_at.elapsed().as_millis() as u64,
                    "secure gate released"
                );
            }
            None => {
                self.counters.stray_releases.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("secure gate released with no outstanding acquisition");
            }
        }
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_on_drop() {
        let gate = SecureGate::new(Duration::from_secs(5));
        {
            let _g = gate.try_acquire(Duration::from_millis(100)).await.unwrap();
            assert!(gate.is_held());
        }
        assert!(!gate.is_held());
        assert_eq!(gate.stats().acquisitions, 1);
        assert_eq!(gate.stats().held, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_times_out_while_held() {
        let gate = SecureGate::new(Duration::from_secs(5));
        let _held = gate.try_acquire(Duration::from_secs(1)).await.unwrap();
        // Not reentrant: the same holder blocks itself.
        assert!(gate.try_acquire(Duration::from_millis(300)).await.is_none());
        assert_eq!(gate.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded_by_max() {
        let gate = SecureGate::new(Duration::from_millis(200));
        let _held = gate.try_acquire(Duration::from_secs(1)).await.unwrap();
        let start = Instant::now();
        assert!(gate.try_acquire(Duration::from_secs(60)).await.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn double_release_is_reported_not_fatal() {
        let gate = SecureGate::new(Duration::from_secs(1));
        let mut g = gate.try_acquire(Duration::from_millis(100)).await.unwrap();
        g.release();
        g.release();
        drop(g);
        let stats = gate.stats();
        assert_eq!(stats.stray_releases, 1);
        assert_eq!(stats.held, 0);
        assert!(!gate.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_gate_after_release_and_stats_record_wait() {
        let gate = SecureGate::new(Duration::from_secs(5));
        let held = gate.try_acquire(Duration::from_secs(1)).await.unwrap();
        let g2 = gate.clone();
        let waiter =
            tokio::spawn(async move { g2.try_acquire(Duration::from_secs(5)).await.is_some() });
        tokio::time::sleep(Duration::from_millis(400)).await;
        drop(held);
        assert!(waiter.await.unwrap());
        let stats = gate.stats();
        assert_eq!(stats.acquisitions, 2);
        assert!(stats.max_wait_ms >= 400);
    }
}

//! Per-host timeout and retry policy, and failure classification.
//!
//! Nothing here is stored per target: the policy is recomputed from the URL
//! shape on every request.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CheckError, ErrorCategory};

/// Hard limits and pacing for the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub max_url_len: usize,
    /// Limit on a health-check base URL before the path is joined.
    pub max_health_base_len: usize,
    /// Response bodies are cut at this many bytes.
    pub max_body_chars: usize,
    /// Health bodies are validated only when non-empty and shorter than this.
    pub validate_body_below: usize,
    pub max_post_len: usize,
    /// Ceiling on any timeout, caller-provided or policy-derived.
    pub hard_timeout_cap_ms: u64,
    /// Tunnel hosts never get less than this.
    pub tunnel_floor_ms: u64,
    pub absolute_cap_ms: u64,
    /// Backoff before retry `n` is `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    /// Stabilization delay after a failed secure-channel attempt, gate still held.
    pub secure_failure_settle_ms: u64,
    /// Extra stabilization delay before retrying a secure-channel request.
    pub secure_retry_settle_ms: u64,
    /// Bounded wait for the Exclusive-Access Gate on a probe.
    pub gate_wait_ms: u64,
    pub user_agent: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_url_len: 500,
            max_health_base_len: 200,
            max_body_chars: 2_000,
            validate_body_below: 1_000,
            max_post_len: 1_000,
            hard_timeout_cap_ms: 8_000,
            tunnel_floor_ms: 7_000,
            absolute_cap_ms: 15_000,
            retry_backoff_ms: 1_000,
            secure_failure_settle_ms: 100,
            secure_retry_settle_ms: 200,
            gate_wait_ms: 5_000,
            user_agent: "NebulaWatch/1.0".into(),
        }
    }
}

/// Host families with distinct timing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostClass {
    /// Ephemeral reverse-tunnel domains: slow first byte, frequent hiccups.
    NgrokTunnel,
    CloudflareTunnel,
    /// Static hosting with reliable edges.
    Stable,
    Standard,
}

impl HostClass {
    pub fn of(url: &str) -> Self {
        let host = host_of(url);
        if host.ends_with("ngrok-free.app")
            || host.ends_with("ngrok.io")
            || host.ends_with("ngrok.app")
        {
            HostClass::NgrokTunnel
        } else if host.ends_with("trycloudflare.com") {
            HostClass::CloudflareTunnel
        } else if host.ends_with("github.io") {
            HostClass::Stable
        } else {
            HostClass::Standard
        }
    }

    pub fn is_tunnel(self) -> bool {
        matches!(self, HostClass::NgrokTunnel | HostClass::CloudflareTunnel)
    }
}

/// Derived connection parameters for one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub class: HostClass,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    /// Skip certificate verification (tunnel endpoints rotate certificates).
    pub insecure: bool,
    pub max_retries: u8,
}

impl ConnectionConfig {
    pub fn for_url(url: &str) -> Self {
        let class = HostClass::of(url);
        let (base, max, insecure, retries) = match class {
            HostClass::NgrokTunnel => (8_000, 12_000, true, 2),
            HostClass::CloudflareTunnel => (7_000, 10_000, true, 2),
            HostClass::Stable => (5_000, 8_000, false, 1),
            HostClass::Standard => (5_000, 10_000, false, 1),
        };
        Self {
            class,
            base_timeout: Duration::from_millis(base),
            max_timeout: Duration::from_millis(max),
            insecure,
            max_retries: retries,
        }
    }

    /// Timeout for one attempt.
    ///
    /// A caller-provided value replaces the base timeout, both are capped at
    /// `hard_timeout_cap_ms`, tunnels are raised to `tunnel_floor_ms`, and the
    /// result never exceeds `absolute_cap_ms`.
    pub fn effective_timeout(
        &self,
        requested: Option<Duration>,
        s: &TransportSettings,
    ) -> Duration {
        let mut t = requested
            .filter(|d| !d.is_zero())
            .unwrap_or(self.base_timeout)
            .min(Duration::from_millis(s.hard_timeout_cap_ms));
        if self.class.is_tunnel() {
            t = t.max(Duration::from_millis(s.tunnel_floor_ms));
        }
        t.min(Duration::from_millis(s.absolute_cap_ms))
    }
}

pub fn is_https(url: &str) -> bool {
    url.get(..8).is_some_and(|p| p.eq_ignore_ascii_case("https://"))
}

/// Lowercased host part of an `http(s)://host[:port]/...` URL.
pub fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = if host.starts_with('[') {
        host.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(host)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    host.to_ascii_lowercase()
}

/// Map a failed attempt to the category that drives the retry decision.
pub fn categorize(err: &CheckError, url: &str) -> ErrorCategory {
    match err {
        CheckError::LinkDown => ErrorCategory::LinkUnavailable,
        CheckError::CriticalMemory => ErrorCategory::ResourceExhausted,
        CheckError::UrlTooLong { .. }
        | CheckError::BodyTooLong { .. }
        | CheckError::InvalidUrl(_) => ErrorCategory::Permanent,
        CheckError::GateTimeout { .. } => ErrorCategory::SecureChannel,
        CheckError::Connect(_) | CheckError::Other(_) => {
            if is_https(url) {
                ErrorCategory::SecureChannel
            } else {
                ErrorCategory::Temporary
            }
        }
        CheckError::Timeout { .. } => ErrorCategory::Temporary,
        CheckError::Status { code } if *code >= 500 => ErrorCategory::Temporary,
        CheckError::Status { code } if (400..500).contains(code) => ErrorCategory::Permanent,
        CheckError::Status { .. } | CheckError::Unhealthy => ErrorCategory::Unknown,
    }
}

/// Whether attempt number `retries_done + 1` may be retried.
///
/// Permanent failures are never retried; secure-channel failures once;
/// temporary failures up to twice. The host's `max_retries` caps all of it.
pub fn should_retry(category: ErrorCategory, retries_done: u8, cfg: &ConnectionConfig) -> bool {
    let by_category = match category {
        ErrorCategory::SecureChannel => retries_done < 1,
        ErrorCategory::Temporary => retries_done < 2,
        ErrorCategory::Permanent
        | ErrorCategory::LinkUnavailable
        | ErrorCategory::ResourceExhausted
        | ErrorCategory::Unknown => false,
    };
    by_category && retries_done < cfg.max_retries
}

/// Delay before retry number `retry` (1-based).
pub fn backoff(retry: u8, s: &TransportSettings) -> Duration {
    Duration::from_millis(s.retry_backoff_ms * u64::from(retry))
}

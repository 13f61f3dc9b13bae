use async_trait::async_trait;
use reqwest::{header, Method};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{self, Instant};

use super::health::HealthPatterns;
use super::policy::{self, ConnectionConfig, HostClass, TransportSettings};
use crate::error::{CheckError, ErrorCategory, InitError};
use crate::gate::SecureGate;
use crate::link::LinkStatus;
use crate::resource::{Reclaimer, ResourceGuard};
use crate::types::{CheckKind, Target};

/// Outcome of one probe. `latency_ms == 0` means the target did not answer
/// acceptably; `error` then says why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub latency_ms: u64,
    pub http_code: Option<u16>,
    pub error: Option<ErrorCategory>,
    pub attempts: u8,
}

impl ProbeResult {
    pub fn up(latency_ms: u64, http_code: u16, attempts: u8) -> Self {
        Self {
            latency_ms: latency_ms.max(1),
            http_code: Some(http_code),
            error: None,
            attempts,
        }
    }

    pub fn failed(http_code: Option<u16>, error: ErrorCategory, attempts: u8) -> Self {
        Self {
            latency_ms: 0,
            http_code,
            error: Some(error),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.latency_ms > 0
    }
}

/// Checks one target. The scan orchestrator depends only on this.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `target`; `timeout` overrides the host policy's base timeout but
    /// never the transport's hard ceiling.
    async fn check(&self, target: &Target, timeout: Option<Duration>) -> ProbeResult;
}

/// A response that arrived, whatever its status.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub code: u16,
    /// Truncated at `max_body_chars`, with `...` appended when cut.
    pub body: String,
    pub elapsed: Duration,
}

/// Process-lifetime request counters.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    secure_failures: AtomicU64,
    timeout_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub secure_failures: u64,
    pub timeout_failures: u64,
    pub success_rate: f64,
}

impl TransportMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let ok = self.successful_requests.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: total,
            successful_requests: ok,
            secure_failures: self.secure_failures.load(Ordering::Relaxed),
            timeout_failures: self.timeout_failures.load(Ordering::Relaxed),
            success_rate: if total == 0 { 100.0 } else { ok as f64 / total as f64 * 100.0 },
        }
    }

    /// Operator-requested reset.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.secure_failures.store(0, Ordering::Relaxed);
        self.timeout_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, category: ErrorCategory) {
        match category {
            ErrorCategory::SecureChannel => {
                self.secure_failures.fetch_add(1, Ordering::Relaxed);
            }
            ErrorCategory::Temporary => {
                self.timeout_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Diagnostics about the most recent probe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LastOutcome {
    pub http_code: Option<u16>,
    pub error: Option<ErrorCategory>,
    pub body: String,
    #[serde(skip)]
    pub at: Option<Instant>,
}

/// What counts as an acceptable status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acceptance {
    /// The host answered. 401/403 still prove reachability.
    Reachable,
    /// 2xx only.
    Success,
}

impl Acceptance {
    fn accepts(self, code: u16) -> bool {
        match self {
            Acceptance::Reachable => code < 400 || code == 401 || code == 403,
            Acceptance::Success => (200..300).contains(&code),
        }
    }
}

struct Exchange {
    result: Result<HttpReply, CheckError>,
    category: Option<ErrorCategory>,
    attempts: u8,
}

/// HTTP client for probes and alert delivery.
///
/// Every `https` attempt runs inside the [`SecureGate`]; the gate is taken
/// once per attempt and released before any retry backoff.
pub struct HttpTransport {
    settings: TransportSettings,
    health: HealthPatterns,
    verified: reqwest::Client,
    insecure: reqwest::Client,
    gate: SecureGate,
    guard: Arc<ResourceGuard>,
    link: Arc<dyn LinkStatus>,
    metrics: Arc<TransportMetrics>,
    last: Mutex<LastOutcome>,
}

impl HttpTransport {
    pub fn new(
        settings: TransportSettings,
        health: HealthPatterns,
        gate: SecureGate,
        guard: Arc<ResourceGuard>,
        link: Arc<dyn LinkStatus>,
    ) -> Result<Self, InitError> {
        let verified = build_client(false, &settings.user_agent)?;
        let insecure = build_client(true, &settings.user_agent)?;
        Ok(Self {
            settings,
            health,
            verified,
            insecure,
            gate,
            guard,
            link,
            metrics: Arc::new(TransportMetrics::default()),
            last: Mutex::new(LastOutcome::default()),
        })
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn health_patterns(&self) -> &HealthPatterns {
        &self.health
    }

    pub fn gate(&self) -> &SecureGate {
        &self.gate
    }

    pub fn metrics(&self) -> Arc<TransportMetrics> {
        self.metrics.clone()
    }

    pub fn last_outcome(&self) -> LastOutcome {
        lock(&self.last).clone()
    }

    pub fn last_error(&self) -> Option<ErrorCategory> {
        lock(&self.last).error
    }

    pub fn last_http_code(&self) -> Option<u16> {
        lock(&self.last).http_code
    }

    /// Single-attempt JSON POST. Never retried, so a message is delivered at
    /// most once even when the response is lost.
    pub async fn post_json(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
        gate_wait: Duration,
    ) -> Result<HttpReply, CheckError> {
        let body = serde_json::to_string(payload).map_err(|e| CheckError::Other(e.to_string()))?;
        let cfg = ConnectionConfig::for_url(url);
        let timeout = cfg.effective_timeout(Some(timeout), &self.settings);
        self.attempt(Method::POST, url, Some(&body), timeout, cfg.insecure, gate_wait)
            .await
    }

    async fn exchange(
        &self,
        url: &str,
        requested: Option<Duration>,
        acceptance: Acceptance,
    ) -> Exchange {
        let cfg = ConnectionConfig::for_url(url);
        let timeout = cfg.effective_timeout(requested, &self.settings);
        let gate_wait = Duration::from_millis(self.settings.gate_wait_ms);
        let secure = policy::is_https(url);
        let mut retries: u8 = 0;

        loop {
            self.guard.feed_liveness();
            let res = self
                .attempt(Method::GET, url, None, timeout, cfg.insecure, gate_wait)
                .await;
            self.guard.feed_liveness();

            let err = match res {
                Ok(reply) if acceptance.accepts(reply.code) => {
                    return Exchange {
                        result: Ok(reply),
                        category: None,
                        attempts: retries + 1,
                    };
                }
                Ok(reply) => CheckError::Status { code: reply.code },
                Err(e) => e,
            };

            let category = policy::categorize(&err, url);
            self.metrics.record_failure(category);

            if !policy::should_retry(category, retries, &cfg) {
                return Exchange {
                    result: Err(err),
                    category: Some(category),
                    attempts: retries + 1,
                };
            }

            retries += 1;
            tracing::info!(
                url,
                retry = retries,
                max_retries = cfg.max_retries,
                %category,
                error = %err,
                "retrying request"
            );
            if secure {
                time::sleep(Duration::from_millis(self.settings.secure_retry_settle_ms)).await;
            }
            time::sleep(policy::backoff(retries, &self.settings)).await;
        }
    }

    async fn attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<&str>,
        timeout: Duration,
        insecure: bool,
        gate_wait: Duration,
    ) -> Result<HttpReply, CheckError> {
        if !self.link.is_connected() {
            tracing::debug!(url, "link down, request skipped");
            return Err(CheckError::LinkDown);
        }
        if self.guard.is_critical() {
            tracing::warn!(url, "critical memory, request skipped");
            return Err(CheckError::CriticalMemory);
        }
        if url.len() > self.settings.max_url_len {
            return Err(CheckError::UrlTooLong {
                len: url.len(),
                max: self.settings.max_url_len,
            });
        }
        if let Some(b) = body {
            if b.len() > self.settings.max_post_len {
                return Err(CheckError::BodyTooLong {
                    len: b.len(),
                    max: self.settings.max_post_len,
                });
            }
        }

        let secure = policy::is_https(url);
        let gate_start = Instant::now();
        let _gate = if secure {
            match self.gate.try_acquire(gate_wait).await {
                Some(g) => Some(g),
                None => {
                    return Err(CheckError::GateTimeout {
                        waited_ms: gate_start.elapsed().as_millis() as u64,
                    })
                }
            }
        } else {
            None
        };

        let client = if insecure { &self.insecure } else { &self.verified };
        let mut req = client.request(method, url).header(header::ACCEPT, "*/*");
        if HostClass::of(url) == HostClass::NgrokTunnel {
            req = req.header("ngrok-skip-browser-warning", "true");
        }
        if let Some(b) = body {
            req = req
                .header(header::CONTENT_TYPE, "application/json")
                .body(b.to_string());
        }

        let max_body = self.settings.max_body_chars;
        let start = Instant::now();
        let outcome = time::timeout(timeout, async move {
            let resp = req.send().await?;
            let code = resp.status().as_u16();
            let body = read_capped(resp, max_body).await;
            Ok::<_, reqwest::Error>((code, body))
        })
        .await;
        let elapsed = start.elapsed();

        let result = match outcome {
            Ok(Ok((code, body))) => Ok(HttpReply { code, body, elapsed }),
            Ok(Err(e)) => Err(map_reqwest_error(&e, timeout)),
            Err(_) => Err(CheckError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        let elapsed_ms = elapsed.as_millis() as u64;
        match &result {
            Ok(r) => tracing::debug!(url, code = r.code, elapsed_ms, "http attempt"),
            Err(e) => tracing::debug!(url, error = %e, elapsed_ms, "http attempt failed"),
        }

        // Settle after a failed secure-channel attempt. The gate stays held.
        let channel_failed = matches!(
            result,
            Err(CheckError::Connect(_) | CheckError::Timeout { .. } | CheckError::Other(_))
        );
        if secure && channel_failed {
            time::sleep(Duration::from_millis(self.settings.secure_failure_settle_ms)).await;
        }

        result
    }

    fn record_last(&self, exchange: &Exchange, error: Option<ErrorCategory>) {
        let mut last = lock(&self.last);
        last.at = Some(Instant::now());
        last.error = error;
        match &exchange.result {
            Ok(reply) => {
                last.http_code = Some(reply.code);
                last.body.clone_from(&reply.body);
            }
            Err(e) => {
                last.http_code = e.http_code();
                last.body.clear();
            }
        }
    }
}

#[async_trait]
impl Prober for HttpTransport {
    async fn check(&self, target: &Target, timeout: Option<Duration>) -> ProbeResult {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let (url, acceptance) = match target.kind {
            CheckKind::Reachability => (target.url.clone(), Acceptance::Reachable),
            CheckKind::HealthCheck => {
                if target.url.len() > self.settings.max_health_base_len {
                    tracing::warn!(
                        name = %target.name,
                        len = target.url.len(),
                        "health-check base url too long"
                    );
                    return ProbeResult::failed(None, ErrorCategory::Permanent, 0);
                }
                (target.resolved_url(), Acceptance::Success)
            }
        };

        let exchange = self.exchange(&url, timeout, acceptance).await;
        let result = match &exchange.result {
            Ok(reply) => {
                let validate = target.kind == CheckKind::HealthCheck
                    && !reply.body.is_empty()
                    && reply.body.len() < self.settings.validate_body_below;
                if validate && !self.health.is_healthy(&reply.body) {
                    let err = CheckError::Unhealthy;
                    let category = policy::categorize(&err, &url);
                    tracing::warn!(
                        name = %target.name,
                        code = reply.code,
                        body = %reply.body,
                        error = %err,
                        "unhealthy response"
                    );
                    ProbeResult::failed(Some(reply.code), category, exchange.attempts)
                } else {
                    self.metrics.successful_requests.fetch_add(1, Ordering::Relaxed);
                    ProbeResult::up(reply.elapsed.as_millis() as u64, reply.code, exchange.attempts)
                }
            }
            Err(e) => {
                let category = exchange.category.unwrap_or(ErrorCategory::Unknown);
                tracing::info!(
                    name = %target.name,
                    %category,
                    error = %e,
                    attempts = exchange.attempts,
                    "check failed"
                );
                ProbeResult::failed(e.http_code(), category, exchange.attempts)
            }
        };
        self.record_last(&exchange, result.error);
        result
    }
}

impl Reclaimer for HttpTransport {
    fn name(&self) -> &str {
        "http-transport"
    }

    fn reclaim(&self) {
        let mut last = lock(&self.last);
        last.body = String::new();
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("settings", &self.settings)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

fn build_client(insecure: bool, user_agent: &str) -> Result<reqwest::Client, InitError> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(insecure)
        .danger_accept_invalid_hostnames(insecure)
        .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
        .build()
        .map_err(|e| InitError::HttpClient(e.to_string()))?;
    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .user_agent(user_agent)
        // One connection per request; idle pooled TLS sessions pin memory.
        .pool_max_idle_per_host(0)
        // A redirect to https would handshake outside the gate; a 3xx is judged as is.
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| InitError::HttpClient(e.to_string()))
}

/// Read at most `max` bytes of body; lossy UTF-8, `...` appended when cut.
/// A cut never splits a character.
async fn read_capped(mut resp: reqwest::Response, max: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut truncated = false;
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let room = max.saturating_sub(buf.len());
                if chunk.len() > room {
                    buf.extend_from_slice(&chunk[..room]);
                    truncated = true;
                    break;
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "body read interrupted");
                break;
            }
        }
    }
    if truncated {
        if let Err(e) = std::str::from_utf8(&buf) {
            if e.error_len().is_none() {
                buf.truncate(e.valid_up_to());
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        tracing::warn!(max, "response truncated");
        s.push_str("...");
    }
    s
}

fn map_reqwest_error(e: &reqwest::Error, timeout: Duration) -> CheckError {
    if e.is_timeout() {
        CheckError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if e.is_builder() {
        CheckError::InvalidUrl(error_chain(e))
    } else if e.is_connect() {
        CheckError::Connect(error_chain(e))
    } else {
        CheckError::Other(error_chain(e))
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut s = e.to_string();
    let mut src = e.source();
    while let Some(inner) = src {
        s.push_str(": ");
        s.push_str(&inner.to_string());
        src = inner.source();
    }
    s
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

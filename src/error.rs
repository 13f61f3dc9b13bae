//! Error taxonomy for the monitoring engine.
//!
//! Probe failures are never surfaced as `Err`: the transport returns a zero
//! latency and records an [`ErrorCategory`] the caller may inspect. Only
//! startup problems are real errors ([`InitError`]).

use serde::Serialize;

/// Classification that drives the retry decision for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// No network link; fails fast, never retried.
    LinkUnavailable,
    /// Server 5xx, connect failures, tunnel hiccups, timeouts.
    Temporary,
    /// Connection failure on an `https` URL.
    SecureChannel,
    /// HTTP 4xx, malformed or oversized URL.
    Permanent,
    /// Resource Guard reported critical memory.
    ResourceExhausted,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::LinkUnavailable => "link unavailable",
            ErrorCategory::Temporary => "temporary network issue",
            ErrorCategory::SecureChannel => "secure channel error",
            ErrorCategory::Permanent => "permanent error",
            ErrorCategory::ResourceExhausted => "resource exhausted",
            ErrorCategory::Unknown => "unknown error",
        };
        f.write_str(s)
    }
}

/// Why a single request attempt did not produce a usable response.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("network link is down")]
    LinkDown,

    #[error("critical memory, request skipped")]
    CriticalMemory,

    #[error("url too long ({len} > {max} chars)")]
    UrlTooLong { len: usize, max: usize },

    #[error("request body too long ({len} > {max} bytes)")]
    BodyTooLong { len: usize, max: usize },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("secure channel busy: gate wait timed out after {waited_ms} ms")]
    GateTimeout { waited_ms: u64 },

    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("http status {code}")]
    Status { code: u16 },

    #[error("unhealthy response body")]
    Unhealthy,

    #[error("request failed: {0}")]
    Other(String),
}

impl CheckError {
    /// HTTP code of the failed attempt, if a response arrived.
    pub fn http_code(&self) -> Option<u16> {
        match self {
            CheckError::Status { code } => Some(*code),
            _ => None,
        }
    }
}

/// Startup failures surfaced to the caller instead of handled internally.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to spawn execution context `{name}`: {source}")]
    SpawnContext {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("failed to build runtime for `{name}`: {source}")]
    Runtime {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("failed to build http client: {0}")]
    HttpClient(String),

    #[error("event queue capacity must be at least 1")]
    EventQueue,
}

/// Configuration validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("target {index}: name and url are required")]
    IncompleteTarget { index: usize },

    #[error("too many targets: {count} (max {max})")]
    TooManyTargets { count: usize, max: usize },

    #[error("{field} must be at least {min}")]
    OutOfRange { field: &'static str, min: u64 },

    #[error("invalid target spec `{spec}`: {reason}")]
    TargetSpec { spec: String, reason: &'static str },
}

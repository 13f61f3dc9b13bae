use serde::{Deserialize, Serialize};

/// Last observed status of a monitored endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unknown,
    Up,
    Down,
}

impl Status {
    /// `Down` and `Unknown` both count as failures for alerting.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Down | Status::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Up => "UP",
            Status::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a target is probed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Bare connectivity probe against the base URL.
    #[default]
    Reachability,
    /// Probe against `url + health_path` whose body is validated.
    HealthCheck,
}

impl CheckKind {
    /// Accepts the device's config spellings (`PING`, `HEALTH_CHECK`) as well as
    /// the snake_case names. Anything unrecognised is a reachability check.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "health_check" | "healthcheck" | "health" => CheckKind::HealthCheck,
            _ => CheckKind::Reachability,
        }
    }
}

/// One monitored endpoint, owned by the scan orchestrator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub kind: CheckKind,
    #[serde(skip)]
    pub status: Status,
    /// 0 means no successful response.
    #[serde(skip)]
    pub latency_ms: u64,
}

impl Target {
    pub fn new(name: impl Into<String>, url: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            health_path: None,
            kind,
            status: Status::Unknown,
            latency_ms: 0,
        }
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.health_path = if path.trim().is_empty() { None } else { Some(path) };
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.url.trim().is_empty()
    }

    /// URL actually requested: base URL for reachability, base + path for health checks.
    pub fn resolved_url(&self) -> String {
        match (self.kind, self.health_path.as_deref()) {
            (CheckKind::HealthCheck, Some(path)) => join_url(&self.url, path),
            _ => self.url.clone(),
        }
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            name: self.name.clone(),
            url: self.url.clone(),
            kind: self.kind,
            status: self.status,
            latency_ms: self.latency_ms,
        }
    }
}

/// Join a base URL and a path with exactly one `/` between them.
pub fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", &base[..base.len() - 1], path),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Read-only copy of a target handed to presentation and the status API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub name: String,
    pub url: String,
    pub kind: CheckKind,
    pub status: Status,
    pub latency_ms: u64,
}

impl TargetSnapshot {
    /// Short label as a status tile shows it.
    pub fn latency_text(&self) -> String {
        if self.status != Status::Up || self.latency_ms == 0 {
            return match self.kind {
                CheckKind::HealthCheck => "FAIL".into(),
                CheckKind::Reachability => "DOWN".into(),
            };
        }
        match self.kind {
            CheckKind::HealthCheck => format!("{} OK", self.latency_ms),
            CheckKind::Reachability => format!("{} ms", self.latency_ms),
        }
    }
}

/// Message from the scan context to the presentation context.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanStarted,
    ScanCompleted,
    TargetUpdated {
        index: usize,
        status: Status,
        latency_ms: u64,
    },
}

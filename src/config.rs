use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::alert::AlertPolicy;
use crate::error::ConfigError;
use crate::monitor::ScanLimits;
use crate::notify::ChannelSettings;
use crate::resource::ResourceSettings;
use crate::transport::{HealthPatterns, TransportSettings};
use crate::types::{CheckKind, Target};

/// Upper bound on configured targets (three display tabs of six).
pub const MAX_TARGETS: usize = 18;

/// Shortest scan interval accepted from any source.
pub const MIN_INTERVAL_MS: u64 = 1_000;

/// Complete engine configuration. Every field has a device default, so an
/// empty JSON object is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub targets: Vec<Target>,
    pub alert: AlertPolicy,
    pub scan: ScanLimits,
    pub transport: TransportSettings,
    pub health: HealthPatterns,
    pub resource: ResourceSettings,
    pub channel: ChannelSettings,
    /// Offset applied when rendering timestamps in alert messages.
    pub timezone_offset_secs: i32,
    pub event_queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            alert: AlertPolicy::default(),
            scan: ScanLimits::default(),
            transport: TransportSettings::default(),
            health: HealthPatterns::default(),
            resource: ResourceSettings::default(),
            channel: ChannelSettings::default(),
            timezone_offset_secs: -10_800,
            event_queue_capacity: 20,
        }
    }
}

impl MonitorConfig {
    /// Parse a JSON configuration document and validate it.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: MonitorConfig = serde_json::from_str(s).context("invalid configuration JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("failed to load config file: {}", path.as_ref().display()))
    }

    /// Load configuration from a file, or fall back to defaults if it is missing or broken.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "using default configuration");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.len() > MAX_TARGETS {
            return Err(ConfigError::TooManyTargets {
                count: self.targets.len(),
                max: MAX_TARGETS,
            });
        }
        if let Some(index) = self.targets.iter().position(|t| !t.is_valid()) {
            return Err(ConfigError::IncompleteTarget { index });
        }
        if self.alert.failure_threshold == 0 {
            return Err(ConfigError::OutOfRange {
                field: "alert.failure_threshold",
                min: 1,
            });
        }
        if self.scan.interval_ms < MIN_INTERVAL_MS {
            return Err(ConfigError::OutOfRange {
                field: "scan.interval_ms",
                min: MIN_INTERVAL_MS,
            });
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "event_queue_capacity",
                min: 1,
            });
        }
        Ok(())
    }

    /// Append targets given on the command line, respecting the target cap.
    pub fn push_targets(
        &mut self,
        extra: impl IntoIterator<Item = Target>,
    ) -> Result<(), ConfigError> {
        self.targets.extend(extra);
        self.validate()
    }
}

/// Parse a target in the device's pipe-separated shape:
/// `name|url[|health_path[|kind]]`.
///
/// - `kind` is `PING`/`reachability` or `HEALTH_CHECK`/`health_check`
/// - an empty `health_path` means none
/// - a health path without an explicit kind implies a health check
pub fn parse_target_spec(spec: &str) -> Result<Target, ConfigError> {
    let err = |reason| ConfigError::TargetSpec {
        spec: spec.to_string(),
        reason,
    };
    let mut parts = spec.split('|').map(str::trim);
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| err("missing name"))?;
    let url = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| err("missing url"))?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(err("url must start with http:// or https://"));
    }
    let path = parts.next().unwrap_or("");
    let kind = match parts.next() {
        Some(k) if !k.is_empty() => CheckKind::parse_lenient(k),
        _ if !path.is_empty() => CheckKind::HealthCheck,
        _ => CheckKind::Reachability,
    };
    if parts.next().is_some() {
        return Err(err("too many fields"));
    }
    Ok(Target::new(name, url, kind).with_health_path(path))
}

//! Health-response body validation.

use serde::{Deserialize, Serialize};

/// Bodies shorter than this, without JSON braces, are accepted as plain status text.
const SHORT_BODY: usize = 200;

/// Bodies that are healthy on their own, compared after trimming and lowercasing.
const SIMPLE_HEALTHY: &[&str] = &[
    "ok",
    "healthy",
    "up",
    "running",
    r#"{"ok":true}"#,
    r#"{"status":"ok"}"#,
    r#"{"health":"ok"}"#,
];

/// Configurable text patterns. Matching is case-insensitive substring search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPatterns {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
    /// Require an explicit healthy indicator.
    pub strict: bool,
}

impl Default for HealthPatterns {
    fn default() -> Self {
        let healthy = [
            r#""status":"healthy""#,
            r#""status":"ok""#,
            r#""status":"up""#,
            r#""status":"running""#,
            r#""health":"ok""#,
            r#""health":"healthy""#,
            r#""health":"up""#,
            r#""ok""#,
            r#""healthy""#,
            r#""up""#,
        ];
        let unhealthy = [
            r#""status":"unhealthy""#,
            r#""status":"down""#,
            r#""status":"error""#,
            r#""status":"failed""#,
            r#""health":"unhealthy""#,
            r#""health":"down""#,
            "502 bad gateway",
            "503 service unavailable",
            "504 gateway timeout",
            "500 internal server error",
        ];
        Self {
            healthy: healthy.iter().map(|s| s.to_string()).collect(),
            unhealthy: unhealthy.iter().map(|s| s.to_string()).collect(),
            strict: false,
        }
    }
}

impl HealthPatterns {
    /// Build a pattern list from a comma-separated string, the way the device
    /// config stores it. Blank entries are dropped.
    pub fn split_list(csv: &str) -> Vec<String> {
        csv.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Decide whether a health-check body reports a healthy service.
    ///
    /// Order matters: an unhealthy pattern wins even when a healthy pattern
    /// also matches.
    pub fn is_healthy(&self, body: &str) -> bool {
        if body.is_empty() {
            return false;
        }
        let lower = body.to_lowercase();

        if contains_any(&lower, &self.unhealthy) {
            return false;
        }
        if contains_any(&lower, &self.healthy) {
            return true;
        }
        if SIMPLE_HEALTHY.contains(&lower.trim()) {
            return true;
        }
        if self.strict {
            return false;
        }
        if body.len() < SHORT_BODY {
            // JSON without a recognised indicator is ambiguous; plain text is a status line.
            let looks_json = body.contains('{') && body.contains('}');
            return !looks_json;
        }
        false
    }
}

fn contains_any(haystack_lower: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .any(|p| haystack_lower.contains(&p.to_lowercase()))
}

//! Alert delivery: channels, message formatting and the per-target manager.

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use time::{macros::format_description, OffsetDateTime, UtcOffset};
use tokio::time::Instant;

use crate::alert::{AlertPhase, AlertPolicy, AlertState};
use crate::resource::ResourceGuard;
use crate::transport::HttpTransport;
use crate::types::{Status, Target};

/// Where outage and recovery messages go. Only the boolean matters to the engine.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, message: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
    pub send_timeout_ms: u64,
    /// Bounded wait for the Exclusive-Access Gate per message.
    pub gate_wait_ms: u64,
    pub announce_startup: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: "https://api.telegram.org".into(),
            send_timeout_ms: 5_000,
            gate_wait_ms: 3_000,
            announce_startup: false,
        }
    }
}

impl ChannelSettings {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.bot_token.trim().is_empty() && !self.chat_id.trim().is_empty()
    }
}

/// Telegram Bot API `sendMessage`, HTML parse mode.
pub struct TelegramChannel {
    transport: Arc<HttpTransport>,
    guard: Arc<ResourceGuard>,
    endpoint: String,
    chat_id: String,
    timeout: Duration,
    gate_wait: Duration,
}

impl TelegramChannel {
    /// `None` when the channel is disabled or credentials are missing.
    pub fn new(
        settings: &ChannelSettings,
        transport: Arc<HttpTransport>,
        guard: Arc<ResourceGuard>,
    ) -> Option<Self> {
        if !settings.is_usable() {
            return None;
        }
        Some(Self {
            transport,
            guard,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                settings.api_base.trim_end_matches('/'),
                settings.bot_token.trim()
            ),
            chat_id: settings.chat_id.trim().to_string(),
            timeout: Duration::from_millis(settings.send_timeout_ms),
            gate_wait: Duration::from_millis(settings.gate_wait_ms),
        })
    }

    pub fn payload(&self, text: &str) -> serde_json::Value {
        json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        })
    }
}

#[async_trait]
impl AlertChannel for TelegramChannel {
    async fn send(&self, message: &str) -> bool {
        if self.guard.is_low() {
            tracing::warn!(
                free_bytes = ?self.guard.free_bytes(),
                "low memory, alert message skipped"
            );
            return false;
        }
        // The endpoint embeds the bot token; never log it.
        match self
            .transport
            .post_json(&self.endpoint, &self.payload(message), self.timeout, self.gate_wait)
            .await
        {
            Ok(reply) if reply.code == 200 => {
                tracing::info!(
                    elapsed_ms = reply.elapsed.as_millis() as u64,
                    "alert message delivered"
                );
                true
            }
            Ok(reply) => {
                tracing::warn!(code = reply.code, "alert channel rejected message");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "alert delivery failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("chat_id", &self.chat_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Writes messages to the log and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    async fn send(&self, message: &str) -> bool {
        tracing::info!(message = %strip_tags(message), "alert");
        true
    }
}

/// What the manager delivered for one status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Outage,
    Recovery,
}

/// Renders monotonic instants as local wall-clock text.
#[derive(Debug, Clone, Copy)]
pub struct MessageClock {
    offset: UtcOffset,
}

impl MessageClock {
    pub fn new(offset_secs: i32) -> Self {
        let offset = UtcOffset::from_whole_seconds(offset_secs).unwrap_or_else(|e| {
            tracing::warn!(offset_secs, error = %e, "invalid timezone offset, using UTC");
            UtcOffset::UTC
        });
        Self { offset }
    }

    /// Wall time of `at`, given that `now` is the present.
    pub fn wall(&self, at: Instant, now: Instant) -> OffsetDateTime {
        let ago = now.saturating_duration_since(at);
        (OffsetDateTime::now_utc() - ago).to_offset(self.offset)
    }

    pub fn render(&self, at: Instant, now: Instant) -> String {
        format_timestamp(self.wall(at, now))
    }
}

pub fn format_timestamp(dt: OffsetDateTime) -> String {
    let fmt = format_description!("[day]/[month]/[year] [hour]:[minute]:[second]");
    dt.format(fmt).unwrap_or_else(|_| "unknown".into())
}

/// `45s`, `2m`, `2m 5s`, `1h`, `1h 3m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let (m, s) = (secs / 60, secs % 60);
        if s == 0 {
            format!("{m}m")
        } else {
            format!("{m}m {s}s")
        }
    } else {
        let (h, m) = (secs / 3600, (secs % 3600) / 60);
        if m == 0 {
            format!("{h}h")
        } else {
            format!("{h}h {m}m")
        }
    }
}

pub fn outage_message(
    name: &str,
    status: Status,
    latency_ms: u64,
    downtime: Duration,
    detected_at: &str,
) -> String {
    let name = escape_html(name);
    if status == Status::Unknown {
        format!(
            "❓ <b>UNKNOWN STATUS</b>\n\n\
             🟡 <b>Target:</b> {name}\n\
             📊 <b>Response:</b> {latency_ms}ms\n\
             🕐 <b>Detected:</b> {detected_at}\n\n\
             🔍 <b>Status unclear, waiting...</b>"
        )
    } else {
        format!(
            "🚨 <b>SYSTEM DOWN!</b>\n\n\
             🔴 <b>Target:</b> {name}\n\n\
             🕐 <b>Detected:</b> {detected_at}\n\
             ⏱️ <b>Downtime:</b> {}\n\
             ⚠️ <b>Status:</b> Unreachable\n\n\
             🔍 <b>Waiting for recovery...</b>",
            format_duration(downtime)
        )
    }
}

pub fn recovery_message(
    name: &str,
    latency_ms: u64,
    total_downtime: Duration,
    first_failure: Option<&str>,
    recovered_at: &str,
) -> String {
    format!(
        "🟢 <b>SYSTEM RECOVERED</b>\n\n\
         🎉 <b>Target:</b> {}\n\n\
         🕐 <b>First Failure:</b> {}\n\
         ✅ <b>Recovered At:</b> {recovered_at}\n\n\
         ⏱️ <b>Total Downtime:</b> {}\n\
         📊 <b>Current Latency:</b> {latency_ms}ms\n\
         🔄 <b>Status:</b> Online\n\n\
         ✅ <b>Service is fully operational!</b>",
        escape_html(name),
        first_failure.unwrap_or("Unknown"),
        format_duration(total_downtime),
    )
}

pub fn startup_message(
    targets: &[Target],
    interval: Duration,
    policy: &AlertPolicy,
    networks: &[IpNet],
) -> String {
    let mut msg = String::from("✅ <b>Monitoring started</b>\n\n");
    if networks.is_empty() {
        msg.push_str("📶 <b>Network:</b> no local address\n\n");
    } else {
        msg.push_str("📶 <b>Network:</b>\n");
        for net in networks {
            msg.push_str(&format!("• {net}\n"));
        }
        msg.push('\n');
    }
    msg.push_str("🎯 <b>Monitoring Targets:</b>\n");
    if targets.is_empty() {
        msg.push_str("• No targets configured\n");
    }
    for t in targets {
        msg.push_str(&format!("• {}\n", escape_html(&t.name)));
    }
    msg.push_str(&format!(
        "\n⏰ <b>Scan Interval:</b> {}\n\
         🚨 <b>Alert Threshold:</b> {} failures\n⏱️ <b>Cooldown:</b> {}",
        format_duration(interval),
        policy.failure_threshold,
        format_duration(policy.alert_cooldown()),
    ));
    msg
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// One [`AlertState`] per target index, plus the channel that delivers.
///
/// States advance only on a delivered message; a failed send leaves the alert
/// due so the next pass tries again.
pub struct AlertManager {
    states: Vec<AlertState>,
    policy: AlertPolicy,
    channel: Option<Arc<dyn AlertChannel>>,
    clock: MessageClock,
}

impl AlertManager {
    pub fn new(
        target_count: usize,
        policy: AlertPolicy,
        channel: Option<Arc<dyn AlertChannel>>,
        timezone_offset_secs: i32,
    ) -> Self {
        Self {
            states: (0..target_count).map(|_| AlertState::new(policy.clone())).collect(),
            policy,
            channel,
            clock: MessageClock::new(timezone_offset_secs),
        }
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    pub fn states(&self) -> &[AlertState] {
        &self.states
    }

    pub fn state(&self, index: usize) -> Option<&AlertState> {
        self.states.get(index)
    }

    pub fn phases(&self, now: Instant) -> Vec<AlertPhase> {
        self.states.iter().map(|s| s.phase(now)).collect()
    }

    /// Grow or shrink to `count` targets; existing states keep their history.
    pub fn resize(&mut self, count: usize) {
        let policy = self.policy.clone();
        self.states.resize_with(count, || AlertState::new(policy.clone()));
    }

    /// Feed one check result and deliver whatever is due.
    pub async fn on_status(
        &mut self,
        index: usize,
        name: &str,
        status: Status,
        latency_ms: u64,
        now: Instant,
    ) -> Option<Notice> {
        let channel = self.channel.clone();
        let clock = self.clock;
        let Some(state) = self.states.get_mut(index) else {
            tracing::warn!(index, "status for unknown target index");
            return None;
        };
        state.update(status, latency_ms, now);

        if state.should_alert(now) {
            let detected = clock.render(now, now);
            let msg = outage_message(name, status, latency_ms, state.downtime(now), &detected);
            tracing::warn!(name = %name, failures = state.failures(), %status, "outage alert due");
            if deliver(channel.as_deref(), &msg).await {
                state.mark_alert_sent(now);
                tracing::info!(name = %name, "outage alert sent");
                return Some(Notice::Outage);
            }
        } else if state.should_recover(now) {
            let first = state.downtime_start().map(|at| clock.render(at, now));
            let total = Duration::from_secs(state.downtime(now).as_secs());
            let recovered = clock.render(now, now);
            let msg = recovery_message(name, latency_ms, total, first.as_deref(), &recovered);
            tracing::info!(name = %name, downtime = %format_duration(total), "recovery alert due");
            if deliver(channel.as_deref(), &msg).await {
                state.mark_recovered(now);
                tracing::info!(name = %name, "recovery alert sent");
                return Some(Notice::Recovery);
            }
        }
        None
    }

    /// One-off announcement; false without a channel.
    pub async fn announce_startup(
        &self,
        targets: &[Target],
        interval: Duration,
        networks: &[IpNet],
    ) -> bool {
        let msg = startup_message(targets, interval, &self.policy, networks);
        deliver(self.channel.as_deref(), &msg).await
    }
}

async fn deliver(channel: Option<&dyn AlertChannel>, message: &str) -> bool {
    match channel {
        Some(ch) => ch.send(message).await,
        None => {
            tracing::debug!("no alert channel configured, message dropped");
            false
        }
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("targets", &self.states.len())
            .field("policy", &self.policy)
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}

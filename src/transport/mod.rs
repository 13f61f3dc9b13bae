//! Timed HTTP requests with per-host retry policy and failure classification.

mod client;
pub mod health;
pub mod policy;

pub use client::{
    HttpReply, HttpTransport, LastOutcome, MetricsSnapshot, ProbeResult, Prober, TransportMetrics,
};
pub use health::HealthPatterns;
pub use policy::{ConnectionConfig, HostClass, TransportSettings};

//! Library crate for nebula-watch: endpoint monitoring with debounced alerting.
pub mod alert;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod link;
pub mod monitor;
pub mod notify;
pub mod resource;
pub mod scheduler;
pub mod server;
pub mod transport;
pub mod types;

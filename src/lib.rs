//! BrightSight: local-first ophthalmic screening.
//!
//! Fundus photographs are classified by a local inference service, recorded
//! as detections, reviewed by a doctor, and rendered into printable
//! reports. All records live in an in-memory SQLite database whose image is
//! persisted wholesale through a pluggable byte store, so the application
//! owns a single durable artifact and works fully offline.

pub mod auth;
pub mod config;
pub mod context;
pub mod db;
pub mod inference;
pub mod models;
pub mod report;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. RUST_LOG overrides the default
/// filter. Safe to call once per process.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

//! Structured logging bootstrap, grounded on the teacher's
//! `FmtSubscriber::builder().with_env_filter(...)` pattern in
//! `agent::main`.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber. Respects `RUST_LOG`, defaulting
/// to `info` for this crate and `warn` elsewhere.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,chatsvc=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

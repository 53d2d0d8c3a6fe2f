//! Reverse-tunnel agent: dials out to an orchestrator, registers, and
//! relays TCP egress on demand. See [`config`] for configuration and
//! [`tunnel::Session`] for the event loop itself.

pub mod config;

use std::time::Duration;

use anyhow::Result;
use config::Config;
use tokio_util::sync::CancellationToken;
use tunnel::{LogSink, Session};

/// Run the agent until the control channel is lost or `cancel` fires.
/// Mirrors the teacher's `startup(config) -> anyhow::Result<()>` entry
/// point: `main.rs` does nothing but load configuration, set up logging,
/// and call this.
pub async fn startup(config: Config, cancel: CancellationToken) -> Result<()> {
    Session::run(
        &config.orchestrator.host,
        config.orchestrator.port,
        config.agent.identity,
        Duration::from_secs(config.heartbeat_interval_secs),
        LogSink,
        cancel,
    )
    .await
}

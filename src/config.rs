use std::{fs::read_to_string, str::FromStr};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tunnel::HEARTBEAT_INTERVAL;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct OrchestratorConfig {
    ///
    /// Host or IP address of the orchestrator's control listener.
    ///
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    ///
    /// Opaque identity string sent in the REGISTER frame. The orchestrator
    /// treats it as an arbitrary label, not a credential.
    ///
    #[serde(default = "AgentConfig::identity")]
    pub identity: String,
}

impl AgentConfig {
    fn identity() -> String {
        "agent".to_string()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: Self::identity(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log: LogConfig,
    ///
    /// Idle cadence for outbound HEARTBEAT frames, in seconds.
    ///
    #[serde(default = "Config::heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Config {
    fn heartbeat_interval_secs() -> u64 {
        HEARTBEAT_INTERVAL.as_secs()
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
struct Cli {
    ///
    /// Specify the configuration file path.
    ///
    /// Example: tunnel-agent --config /etc/tunnel-agent/config.json5
    ///
    #[arg(long, short)]
    config: Option<String>,

    /// Orchestrator host or IP address. Overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Orchestrator control port. Overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Agent identity string sent in REGISTER. Overrides the config file.
    #[arg(long)]
    identity: Option<String>,

    /// Enable debug-level log output.
    #[arg(short, long)]
    verbose: bool,

    /// Idle cadence for outbound HEARTBEAT frames, in seconds.
    #[arg(long, hide = true)]
    heartbeat_interval_secs: Option<u64>,
}

impl Config {
    ///
    /// Load configuration from an optional config file and command line
    /// parameters.
    ///
    /// If `--config` is given, it is parsed first; direct CLI flags
    /// (`--host`, `--port`, `--identity`, `-v`, `--heartbeat-interval-secs`)
    /// then override whatever it set, so the agent is usable without a
    /// config file in the common case.
    ///
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();

        let mut config = match &cli.config {
            Some(path) => serde_json5::from_str::<Self>(&read_to_string(path)?)
                .with_context(|| format!("parsing config file {path}"))?,
            None => Config {
                orchestrator: OrchestratorConfig {
                    host: cli
                        .host
                        .clone()
                        .context("missing orchestrator host: pass --host or --config")?,
                    port: cli
                        .port
                        .context("missing orchestrator port: pass --port or --config")?,
                },
                agent: AgentConfig::default(),
                log: LogConfig::default(),
                heartbeat_interval_secs: Config::heartbeat_interval_secs(),
            },
        };

        if let Some(host) = cli.host {
            config.orchestrator.host = host;
        }
        if let Some(port) = cli.port {
            config.orchestrator.port = port;
        }
        if let Some(identity) = cli.identity {
            config.agent.identity = identity;
        }
        if cli.verbose {
            config.log.level = LogLevel::Debug;
        }
        if let Some(secs) = cli.heartbeat_interval_secs {
            config.heartbeat_interval_secs = secs;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_from_str_roundtrips_known_names() {
        for (text, level) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            assert_eq!(LogLevel::from_str(text).unwrap().as_level(), level.as_level());
        }
    }

    #[test]
    fn log_level_from_str_rejects_unknown() {
        assert!(LogLevel::from_str("verbose").is_err());
    }
}

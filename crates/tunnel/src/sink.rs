//! Event sink: the externally-implemented half of logging.
//!
//! The core never writes to a log backend directly. It calls one of these
//! methods, all of which have a no-op default, so a caller can hook only
//! the lifecycle events it cares about and still get free-text coverage of
//! everything else through [`EventSink::log`].

use std::fmt;

/// Severity of a logged event, independent of whatever logging backend
/// `log` is ultimately wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

pub trait EventSink: Send + Sync + Clone + 'static {
    /// Free-text event at the given severity. Timestamping is the sink's
    /// responsibility.
    fn log(&self, level: Level, args: fmt::Arguments<'_>);

    /// A tunnel was opened: dial to `target` succeeded and the connection
    /// is now relaying.
    #[allow(unused_variables)]
    fn on_tunnel_open(&self, id: u32, target: &str) {}

    /// A tunnel was torn down, locally or on receipt of CLOSE.
    #[allow(unused_variables)]
    fn on_tunnel_close(&self, id: u32, target: &str, reason: &str) {}

    /// A CONNECT failed to dial; no tunnel was ever inserted for `id`.
    #[allow(unused_variables)]
    fn on_dial_failed(&self, id: u32, target: &str, reply_code: u8) {}
}

/// Default [`EventSink`] backed by the `log` facade crate. `on_tunnel_open`,
/// `on_tunnel_close`, and `on_dial_failed` all route through `log` at a
/// level appropriate to the event; override them individually for anything
/// more structured than a log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        match level {
            Level::Error => log::error!("{args}"),
            Level::Warn => log::warn!("{args}"),
            Level::Info => log::info!("{args}"),
            Level::Debug => log::debug!("{args}"),
        }
    }

    fn on_tunnel_open(&self, id: u32, target: &str) {
        log::info!("tunnel {id} open -> {target}");
    }

    fn on_tunnel_close(&self, id: u32, target: &str, reason: &str) {
        log::info!("tunnel {id} closed ({target}): {reason}");
    }

    fn on_dial_failed(&self, id: u32, target: &str, reply_code: u8) {
        log::warn!("tunnel {id} dial to {target} failed: reply 0x{reply_code:02x}");
    }
}

/// Log through an [`EventSink`] with `format!`-style arguments, mirroring
/// the ergonomics of `log::info!` etc.
macro_rules! sink_log {
    ($sink:expr, $level:expr, $($arg:tt)+) => {
        $sink.log($level, format_args!($($arg)+))
    };
}

pub(crate) use sink_log;

//! Stateful half of the agent: the target dialer, the tunnel table, and
//! the session event loop built on top of them. `tokio` is the
//! concurrency substrate throughout.

pub mod dialer;
pub mod session;
pub mod sink;
pub mod table;

pub use session::{Session, HEARTBEAT_INTERVAL};
pub use sink::{EventSink, Level, LogSink};
pub use table::TunnelTable;

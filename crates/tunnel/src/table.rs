//! Tunnel table: `id -> Tunnel`, owning every target socket and the task
//! that relays bytes between it and the control channel.
//!
//! Scheduling note: the specification's event loop is a single-threaded
//! ready-set over the control socket and every live target socket. This
//! implementation takes the alternative the specification explicitly
//! sanctions instead: one task per tunnel, each driving its own socket with
//! `tokio::select!`, forwarding `DATA`/`CLOSE` frames through a channel
//! shared with a single control-socket writer task. The invariants are
//! unchanged — at most one entry per id, a socket closed exactly once, no
//! component but this one ever closes a target socket — only who does the
//! polling differs.

use std::sync::Arc;

use ahash::HashMap;
use bytes::Bytes;
use codec::frame::{Frame, Kind};
use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};

use crate::sink::{sink_log, EventSink, Level};

/// Bound on a single read from a target socket, matching the 64 KiB figure
/// the wire protocol's payload cap is sized around.
const READ_CHUNK: usize = 64 * 1024;

enum ToTarget {
    Write(Bytes),
    /// Orchestrator sent CLOSE for this id: tear the tunnel down without
    /// echoing CLOSE back.
    Shutdown,
}

struct TunnelHandle {
    sender: mpsc::UnboundedSender<ToTarget>,
}

/// Owns every open [`Tunnel`](crate) entry. Cheaply cloneable; all state is
/// behind an `Arc`.
pub struct TunnelTable<S: EventSink> {
    entries: RwLock<HashMap<u32, TunnelHandle>>,
    outbound: mpsc::UnboundedSender<Frame>,
    sink: S,
}

impl<S: EventSink> TunnelTable<S> {
    pub fn new(outbound: mpsc::UnboundedSender<Frame>, sink: S) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::default()),
            outbound,
            sink,
        })
    }

    /// Insert a freshly dialed tunnel and spawn the task that relays it.
    /// Returns `false` (and closes `socket` without ever relaying a byte)
    /// if `id` is already present — a protocol violation, since the
    /// orchestrator is the sole allocator of ids and must never reuse one
    /// live in this session.
    pub fn open(self: &Arc<Self>, id: u32, socket: TcpStream, target: String) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return false;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        entries.insert(id, TunnelHandle { sender });
        drop(entries);

        let table = Arc::clone(self);
        tokio::spawn(async move {
            run(table, id, socket, receiver, target).await;
        });

        true
    }

    /// Best-effort write of `bytes` to the tunnel's target socket. A no-op
    /// if `id` is unknown (already closed, or never opened).
    pub fn write(&self, id: u32, bytes: Bytes) {
        let entries = self.entries.read();
        if let Some(handle) = entries.get(&id) {
            let _ = handle.sender.send(ToTarget::Write(bytes));
        }
    }

    /// Tear the tunnel down locally in response to an inbound CLOSE. A
    /// no-op if `id` is unknown (including a tunnel already closed once —
    /// CLOSE received twice is idempotent).
    pub fn close(&self, id: u32) {
        let entries = self.entries.read();
        if let Some(handle) = entries.get(&id) {
            let _ = handle.sender.send(ToTarget::Shutdown);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn remove(&self, id: u32) {
        self.entries.write().remove(&id);
    }

    /// Shut down every open tunnel without emitting CLOSE frames: used on
    /// session teardown, when the control channel is already gone.
    pub fn shutdown_all(&self) {
        let mut entries = self.entries.write();
        for (_, handle) in entries.drain() {
            let _ = handle.sender.send(ToTarget::Shutdown);
        }
    }
}

async fn run<S: EventSink>(
    table: Arc<TunnelTable<S>>,
    id: u32,
    socket: TcpStream,
    mut receiver: mpsc::UnboundedReceiver<ToTarget>,
    target: String,
) {
    let sink = table.sink.clone();
    sink.on_tunnel_open(id, &target);

    let (mut read_half, mut write_half) = socket.into_split();
    let mut buf = vec![0u8; READ_CHUNK];

    // `Some(reason)` means this side detected the close (local EOF/error)
    // and must emit CLOSE upstream; `None` means the orchestrator already
    // knows (CLOSE received, or session teardown), so emitting one back
    // would be a redundant echo.
    let local_reason: Option<&'static str> = loop {
        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => break Some("target closed"),
                    Ok(n) => {
                        match Frame::new(Kind::Data, id, buf[..n].to_vec()) {
                            Ok(frame) => { let _ = table.outbound.send(frame); }
                            Err(e) => {
                                sink_log!(sink, Level::Warn, "tunnel {id}: dropping oversized read ({e})");
                            }
                        }
                    }
                    Err(_) => break Some("target read error"),
                }
            }
            message = receiver.recv() => {
                match message {
                    Some(ToTarget::Write(bytes)) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break Some("target write error");
                        }
                    }
                    Some(ToTarget::Shutdown) | None => break None,
                }
            }
        }
    };

    table.remove(id);

    if let Some(reason) = local_reason {
        sink.on_tunnel_close(id, &target, reason);
        match Frame::new(Kind::Close, id, Vec::new()) {
            Ok(frame) => {
                let _ = table.outbound.send(frame);
            }
            Err(_) => unreachable!("an empty payload is always within the cap"),
        }
    } else {
        sink.on_tunnel_close(id, &target, "closed by orchestrator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> anyhow::Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        Ok((client, server))
    }

    #[tokio::test]
    async fn open_rejects_duplicate_id() -> anyhow::Result<()> {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let table = TunnelTable::new(outbound_tx, LogSink);

        let (a, _a_peer) = loopback_pair().await?;
        let (b, _b_peer) = loopback_pair().await?;

        assert!(table.open(1, a, "a:1".into()));
        assert!(!table.open(1, b, "b:2".into()));

        Ok(())
    }

    #[tokio::test]
    async fn data_for_unknown_id_is_a_no_op() -> anyhow::Result<()> {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let table = TunnelTable::new(outbound_tx, LogSink);

        table.write(42, Bytes::from_static(b"hi"));
        assert_eq!(table.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn local_eof_emits_close_and_removes_entry() -> anyhow::Result<()> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let table = TunnelTable::new(outbound_tx, LogSink);

        let (client, server) = loopback_pair().await?;
        assert!(table.open(7, client, "127.0.0.1:9".into()));
        drop(server);

        let frame = outbound_rx.recv().await.expect("close frame");
        assert_eq!(frame.kind(), Ok(Kind::Close));
        assert_eq!(frame.conn_id, 7);

        for _ in 0..50 {
            if table.len() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(table.len(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn close_does_not_echo_upstream() -> anyhow::Result<()> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let table = TunnelTable::new(outbound_tx, LogSink);

        let (client, _server) = loopback_pair().await?;
        assert!(table.open(7, client, "127.0.0.1:9".into()));

        table.close(7);

        for _ in 0..50 {
            if table.len() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(table.len(), 0);
        assert!(outbound_rx.try_recv().is_err());

        // Second CLOSE for the same id is a no-op.
        table.close(7);

        Ok(())
    }
}

//! Top-level session: dial the orchestrator, register, run the dispatch
//! loop, and shut down idempotently.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use codec::{
    address::Address,
    frame::{Frame, Kind, SESSION_CONN_ID},
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    dialer,
    sink::{sink_log, EventSink, Level},
    table::TunnelTable,
};

/// Dial timeout for the control connection itself, matching the target
/// dialer's bound.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity timeout on the control socket. Applied to both the reader
/// task's decode and the writer task's write; coupled with the heartbeat
/// cadence, a dead peer that never sends a FIN/RST is detected within one
/// timeout plus one heartbeat interval.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle cadence for outbound HEARTBEAT frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Session;

impl Session {
    /// Dial `host:port`, register as `identity`, and run until the control
    /// channel is lost or `cancel` fires. Returns once shutdown (closing
    /// every tunnel socket, then the control socket) is complete.
    pub async fn run<S: EventSink>(
        host: &str,
        port: u16,
        identity: String,
        heartbeat_interval: Duration,
        sink: S,
        cancel: CancellationToken,
    ) -> Result<()> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .context("dialing orchestrator timed out")?
            .with_context(|| format!("dialing orchestrator {host}:{port}"))?;

        sink_log!(sink, Level::Info, "connected to orchestrator {host}:{port}");

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let table = TunnelTable::new(outbound_tx.clone(), sink.clone());
        let writer = tokio::spawn(run_writer(write_half, outbound_rx));

        // Decoding happens on its own task so the main loop only ever races
        // a channel `recv()` (cancel-safe) in `select!`, never `decode_from`
        // itself: dropping a half-read `decode_from` future on a cancelled
        // `select!` branch would discard bytes already pulled off the
        // socket and desync every frame after it.
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<ReaderEvent>();
        let reader = tokio::spawn(run_reader(read_half, inbound_tx));

        let register = Frame::new(Kind::Register, SESSION_CONN_ID, identity.clone().into_bytes())
            .expect("agent identity never exceeds the payload cap in practice");
        outbound_tx
            .send(register)
            .map_err(|_| anyhow::anyhow!("control writer task died before REGISTER"))?;

        let mut next_heartbeat = Instant::now() + heartbeat_interval;

        let teardown_reason = loop {
            tokio::select! {
                event = inbound_rx.recv() => {
                    match event {
                        Some(ReaderEvent::Frame(frame)) => {
                            if let Some(reset) = dispatch(frame, &table, &outbound_tx, &sink) {
                                if reset {
                                    next_heartbeat = Instant::now() + heartbeat_interval;
                                }
                            }
                        }
                        Some(ReaderEvent::Eof) => break "control socket closed by orchestrator",
                        Some(ReaderEvent::DecodeError(e)) => {
                            sink_log!(sink, Level::Error, "control socket decode error: {e}");
                            break "control socket decode error";
                        }
                        Some(ReaderEvent::InactivityTimeout) => {
                            sink_log!(sink, Level::Warn, "control socket inactivity timeout");
                            break "control socket inactivity timeout";
                        }
                        None => break "reader task died",
                    }
                }
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    let heartbeat = Frame::new(Kind::Heartbeat, SESSION_CONN_ID, Vec::new())
                        .expect("empty payload is always within the cap");
                    if outbound_tx.send(heartbeat).is_err() {
                        break "control writer task died";
                    }
                    next_heartbeat = Instant::now() + heartbeat_interval;
                }
                // Woken directly by the token rather than polled on a
                // fixed cadence: select! already re-evaluates every branch
                // each iteration, so cancellation is observed at most one
                // iteration late, same bound the spec asks for.
                _ = cancel.cancelled() => {
                    break "cancelled";
                }
            }
        };

        sink_log!(sink, Level::Info, "session ending: {teardown_reason}");

        // Shutdown is idempotent and emits no CLOSE frames: the control
        // channel is going away regardless of how it ends.
        table.shutdown_all();
        drop(outbound_tx);
        // `table` holds its own clone of the outbound sender (handed to every
        // tunnel task), so the channel only actually closes once this drops
        // too — without it the writer task's `recv()` never returns.
        drop(table);
        reader.abort();
        let _ = writer.await;

        Ok(())
    }
}

/// Events the reader task hands back to the dispatch loop. Decoding lives
/// entirely on this task so the loop's `select!` only ever races a channel
/// `recv()`, which is cancel-safe, instead of racing `decode_from` itself.
enum ReaderEvent {
    Frame(Frame),
    /// Clean EOF: the orchestrator closed the control socket.
    Eof,
    DecodeError(codec::Error),
    /// No byte arrived within `INACTIVITY_TIMEOUT`: treat the peer as dead.
    InactivityTimeout,
}

async fn run_reader(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    sender: mpsc::UnboundedSender<ReaderEvent>,
) {
    loop {
        let event = match tokio::time::timeout(INACTIVITY_TIMEOUT, Frame::decode_from(&mut read_half)).await {
            Ok(Ok(Some(frame))) => ReaderEvent::Frame(frame),
            Ok(Ok(None)) => ReaderEvent::Eof,
            Ok(Err(e)) => ReaderEvent::DecodeError(e),
            Err(_elapsed) => ReaderEvent::InactivityTimeout,
        };

        let terminal = matches!(
            event,
            ReaderEvent::Eof | ReaderEvent::DecodeError(_) | ReaderEvent::InactivityTimeout
        );

        if sender.send(event).is_err() || terminal {
            return;
        }
    }
}

/// Single serialized writer over the control socket's write half. Every
/// outbound frame, whether from the dispatch loop or a tunnel task, flows
/// through this one task so writes are never interleaved. Each write is
/// itself bounded by `INACTIVITY_TIMEOUT`, so a peer that stops draining its
/// receive window (ack'd but never read) is torn down instead of wedging
/// this task forever.
async fn run_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = receiver.recv().await {
        let encoded = frame.encode();
        match tokio::time::timeout(INACTIVITY_TIMEOUT, write_half.write_all(&encoded)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    let _ = write_half.shutdown().await;
}

/// Handle one inbound frame. Returns `Some(true)` if handling it should
/// reset the outbound heartbeat deadline (an inbound HEARTBEAT counts as
/// channel activity), `Some(false)`/`None` otherwise.
fn dispatch<S: EventSink>(
    frame: Frame,
    table: &Arc<TunnelTable<S>>,
    outbound: &mpsc::UnboundedSender<Frame>,
    sink: &S,
) -> Option<bool> {
    let id = frame.conn_id;

    let kind = match frame.kind() {
        Ok(kind) => kind,
        Err(byte) => {
            sink_log!(sink, Level::Warn, "unknown frame kind 0x{byte:02x} (conn {id}), ignoring");
            return Some(false);
        }
    };

    match kind {
        Kind::Connect => {
            handle_connect(id, &frame.payload, table, outbound, sink);
            Some(false)
        }
        Kind::Data => {
            table.write(id, frame.payload);
            Some(false)
        }
        Kind::Close => {
            table.close(id);
            Some(false)
        }
        Kind::Heartbeat => {
            let reply = Frame::new(Kind::Heartbeat, SESSION_CONN_ID, Vec::new())
                .expect("empty payload is always within the cap");
            let _ = outbound.send(reply);
            Some(true)
        }
        Kind::Register | Kind::NewConn | Kind::ConnectReply => {
            sink_log!(
                sink,
                Level::Warn,
                "unexpected {kind:?} from orchestrator (conn {id}), ignoring"
            );
            Some(false)
        }
    }
}

fn handle_connect<S: EventSink>(
    id: u32,
    payload: &bytes::Bytes,
    table: &Arc<TunnelTable<S>>,
    outbound: &mpsc::UnboundedSender<Frame>,
    sink: &S,
) {
    let address = match Address::decode(payload) {
        Ok(address) => address,
        Err(_) => {
            sink_log!(sink, Level::Warn, "malformed CONNECT address (conn {id})");
            reply(outbound, id, dialer::REPLY_GENERIC_FAILURE);
            return;
        }
    };

    let target = address.to_string();
    let table = Arc::clone(table);
    let outbound = outbound.clone();
    let sink = sink.clone();

    tokio::spawn(async move {
        match dialer::dial(&address).await {
            Ok(socket) => {
                if table.open(id, socket, target.clone()) {
                    reply(&outbound, id, dialer::REPLY_SUCCESS);
                } else {
                    sink_log!(
                        sink,
                        Level::Warn,
                        "CONNECT for already-live id {id} ({target}), dropping new socket"
                    );
                }
            }
            Err(reply_code) => {
                sink.on_dial_failed(id, &target, reply_code);
                reply(&outbound, id, reply_code);
            }
        }
    });
}

fn reply(outbound: &mpsc::UnboundedSender<Frame>, id: u32, code: u8) {
    if let Ok(frame) = Frame::new(Kind::ConnectReply, id, vec![code]) {
        let _ = outbound.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn registers_on_connect() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let frame = Frame::decode_from(&mut socket).await.unwrap().unwrap();
            cancel_clone.cancel();
            frame
        });

        Session::run(
            "127.0.0.1",
            addr.port(),
            "agent".into(),
            Duration::from_secs(30),
            LogSink,
            cancel,
        )
        .await?;

        let frame = server.await?;
        assert_eq!(frame.kind(), Ok(Kind::Register));
        assert_eq!(frame.conn_id, SESSION_CONN_ID);
        assert_eq!(&frame.payload[..], b"agent");

        Ok(())
    }
}

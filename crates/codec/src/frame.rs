//! Wire frame: `kind(1) | conn_id(4, BE) | payload_len(4, BE) | payload`.
//!
//! Every frame is exactly `HEADER_LEN + payload.len()` bytes on the wire, in
//! that order. The decoder never returns a partial frame: it retries short
//! reads until the declared payload length is satisfied, the peer closes
//! (EOF), or the underlying reader errors.
//!
//! `kind` is decoded as a raw byte, not matched against [`Kind`] up front.
//! An unrecognized kind still carries a valid `payload_len`, so the frame
//! must be fully consumed to keep the stream in sync; rejecting it before
//! the payload is read would desync every frame that follows. Kind
//! interpretation is a dispatch-layer concern, via [`Frame::kind`].

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 9;

/// Upper bound on `payload_len`, chosen to guard against runaway
/// allocations from a desynced or hostile peer. Large enough that a single
/// 64 KiB tunnel read (see the tunnel table's bounded read) always fits in
/// one `DATA` frame.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Register = 0x01,
    NewConn = 0x02,
    Connect = 0x03,
    ConnectReply = 0x04,
    Data = 0x05,
    Close = 0x06,
    Heartbeat = 0x07,
}

impl Kind {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Kind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Register,
            0x02 => Self::NewConn,
            0x03 => Self::Connect,
            0x04 => Self::ConnectReply,
            0x05 => Self::Data,
            0x06 => Self::Close,
            0x07 => Self::Heartbeat,
            other => return Err(other),
        })
    }
}

/// Connection id reserved for session-level frames (`REGISTER`,
/// `HEARTBEAT`) that are not associated with any tunnel.
pub const SESSION_CONN_ID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind_byte: u8,
    pub conn_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: Kind, conn_id: u32, payload: impl Into<Bytes>) -> Result<Self, Error> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge(payload.len() as u32));
        }

        Ok(Self {
            kind_byte: kind.as_u8(),
            conn_id,
            payload,
        })
    }

    /// The frame's kind, or `Err(byte)` if the header byte matched none of
    /// [`Kind`]'s variants. An `Err` here is not a decode failure: the
    /// frame was already fully and correctly consumed from the stream:
    /// callers should log and ignore it, not treat it as fatal.
    pub fn kind(&self) -> Result<Kind, u8> {
        Kind::try_from(self.kind_byte)
    }

    /// Encode this frame to its wire representation.
    ///
    /// ```
    /// use tunnel_agent_codec::frame::{Frame, Kind};
    ///
    /// let frame = Frame::new(Kind::Data, 7, b"hi\n".to_vec()).unwrap();
    /// let bytes = frame.encode();
    ///
    /// assert_eq!(bytes.len(), 9 + 3);
    /// assert_eq!(&bytes[..9], &[0x05, 0, 0, 0, 7, 0, 0, 0, 3]);
    /// assert_eq!(&bytes[9..], b"hi\n");
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind_byte);
        buf.put_u32(self.conn_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Read exactly one frame from `reader`, retrying short reads until the
    /// header and declared payload length are fully read.
    ///
    /// Returns `Ok(None)` on a clean EOF that occurs before any header bytes
    /// have been read (the ordinary "peer hung up" case). An EOF that
    /// truncates a header or payload already in progress is a protocol
    /// error, not a clean end-of-stream, and is reported as
    /// [`std::io::ErrorKind::UnexpectedEof`].
    ///
    /// An unrecognized `kind` byte is not rejected here: the header is
    /// still well-formed and `payload_len` still says exactly how many body
    /// bytes to consume, so the frame decodes normally. Use [`Frame::kind`]
    /// to find out whether it was a kind the caller understands.
    ///
    /// ```
    /// use tunnel_agent_codec::frame::{Frame, Kind};
    ///
    /// tokio::runtime::Runtime::new().unwrap().block_on(async {
    ///     let encoded = Frame::new(Kind::Heartbeat, 0, Vec::new()).unwrap().encode();
    ///     let mut cursor = std::io::Cursor::new(encoded.to_vec());
    ///
    ///     let decoded = Frame::decode_from(&mut cursor).await.unwrap().unwrap();
    ///     assert_eq!(decoded.kind(), Ok(Kind::Heartbeat));
    ///     assert_eq!(decoded.conn_id, 0);
    ///     assert!(decoded.payload.is_empty());
    /// });
    /// ```
    pub async fn decode_from<R>(reader: &mut R) -> Result<Option<Self>, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        if !read_exact_or_eof(reader, &mut header).await? {
            return Ok(None);
        }

        let kind_byte = header[0];
        let conn_id = u32::from_be_bytes(header[1..5].try_into().expect("4-byte slice"));
        let payload_len = u32::from_be_bytes(header[5..9].try_into().expect("4-byte slice"));

        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge(payload_len));
        }

        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Self {
            kind_byte,
            conn_id,
            payload: Bytes::from(payload),
        }))
    }
}

/// Like `AsyncReadExt::read_exact`, but a zero-byte read on the very first
/// byte is treated as a clean EOF (`Ok(false)`) instead of an error, and any
/// EOF after that point is a genuine `UnexpectedEof`.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, Error>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }

            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }

        filled += n;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_every_kind() -> Result<(), Error> {
        for kind in [
            Kind::Register,
            Kind::NewConn,
            Kind::Connect,
            Kind::ConnectReply,
            Kind::Data,
            Kind::Close,
            Kind::Heartbeat,
        ] {
            let frame = Frame::new(kind, 42, b"payload".to_vec())?;
            let encoded = frame.encode();

            let mut cursor = std::io::Cursor::new(encoded.to_vec());
            let decoded = Frame::decode_from(&mut cursor).await?.expect("not eof");

            assert_eq!(decoded, frame);
            assert_eq!(decoded.kind(), Ok(kind));
        }

        Ok(())
    }

    #[tokio::test]
    async fn empty_reader_is_clean_eof() -> Result<(), Error> {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(Frame::decode_from(&mut cursor).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn truncated_payload_is_unexpected_eof() {
        // Header declares 5 bytes of payload but only 2 are present.
        let mut bytes = Frame::new(Kind::Data, 1, b"hi".to_vec())
            .unwrap()
            .encode()
            .to_vec();
        bytes[5..9].copy_from_slice(&5u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(bytes);
        let err = Frame::decode_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn oversized_payload_len_is_rejected_before_reading_body() {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.push(Kind::Data.as_u8());
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&(MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes());

        let mut cursor = std::io::Cursor::new(header);
        let err = Frame::decode_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn unknown_kind_byte_still_consumes_the_whole_frame() -> Result<(), Error> {
        // kind 0x00 is unrecognized, but the frame right after it must
        // still decode cleanly: proof an unknown kind does not desync
        // the stream.
        let mut bytes = BytesMut::new();
        bytes.put_u8(0x00);
        bytes.put_u32(5);
        bytes.put_u32(3);
        bytes.put_slice(b"abc");
        bytes.extend_from_slice(&Frame::new(Kind::Heartbeat, 0, Vec::new())?.encode());

        let mut cursor = std::io::Cursor::new(bytes.to_vec());

        let unknown = Frame::decode_from(&mut cursor).await?.expect("not eof");
        assert_eq!(unknown.kind(), Err(0x00));
        assert_eq!(unknown.conn_id, 5);
        assert_eq!(&unknown.payload[..], b"abc");

        let next = Frame::decode_from(&mut cursor).await?.expect("not eof");
        assert_eq!(next.kind(), Ok(Kind::Heartbeat));

        Ok(())
    }

    // Property: decode(encode(kind, id, payload)) == (kind, id, payload) for
    // payloads within the cap, and across a fragmented/short-read transport.
    #[tokio::test]
    async fn survives_byte_at_a_time_delivery() -> Result<(), Error> {
        struct OneByteAtATime(std::io::Cursor<Vec<u8>>);

        impl AsyncRead for OneByteAtATime {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let mut one = [0u8; 1];
                let mut limited = tokio::io::ReadBuf::new(&mut one);
                match std::pin::Pin::new(&mut self.0).poll_read(cx, &mut limited) {
                    std::task::Poll::Ready(Ok(())) => {
                        if let Some(&b) = limited.filled().first() {
                            buf.put_slice(&[b]);
                        }
                        std::task::Poll::Ready(Ok(()))
                    }
                    other => other,
                }
            }
        }

        let frame = Frame::new(Kind::Data, 99, b"split across many tiny reads".to_vec())?;
        let mut reader = OneByteAtATime(std::io::Cursor::new(frame.encode().to_vec()));

        let decoded = Frame::decode_from(&mut reader).await?.expect("not eof");
        assert_eq!(decoded, frame);

        Ok(())
    }
}

//! ## Multiplex frame codec
//!
//! The agent and the orchestrator speak a single, unauthenticated,
//! length-prefixed framing protocol over one long-lived TCP connection. This
//! crate is the pure, stateless half of that protocol: encoding/decoding of
//! frames (`frame`) and of the address descriptor carried in a `CONNECT`
//! frame's payload (`address`). Neither module touches a socket directly;
//! `frame::decode_from` is generic over `tokio::io::AsyncRead` so it can be
//! driven by a real socket or, in tests, by an in-memory buffer.

pub mod address;
pub mod frame;

use std::{io, string::FromUtf8Error};

#[derive(Debug)]
pub enum Error {
    /// The frame's declared payload length exceeds [`frame::MAX_PAYLOAD_LEN`].
    PayloadTooLarge(u32),
    /// A CONNECT address payload was truncated, had an invalid length
    /// prefix, or named an unknown `atype`.
    MalformedAddress,
    Io(io::Error),
    Utf8(FromUtf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge(len) => write!(f, "payload length {len} exceeds the cap"),
            Self::MalformedAddress => write!(f, "malformed CONNECT address payload"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Utf8(e) => write!(f, "invalid utf-8: {e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(value: FromUtf8Error) -> Self {
        Self::Utf8(value)
    }
}

//! Typed error taxonomy for the wire/transport subsystem (spec.md §7).
use thiserror::Error;

/// Failures decoding a single `MsgRecord`/`AESRecord` off the wire.
/// Transient, per-record: the caller logs and drops the record (§4.4, §7).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record buffer too short: need at least {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown message kind tag: {0}")]
    UnknownKind(u8),
    #[error("declared field length {declared} exceeds remaining buffer of {remaining} bytes")]
    FieldOverrun { declared: usize, remaining: usize },
    #[error("payload of {0} bytes exceeds MaxChunk ({1})")]
    ChunkTooLarge(usize, usize),
}

/// Framer-level failures. In practice only `Incomplete` is ever produced; it
/// is absorbed into the overflow buffer and never surfaced past `Framer`.
#[derive(Debug, Error)]
pub enum FramerError {
    #[error("frame incomplete, buffered for more bytes")]
    Incomplete,
    #[error("inner structure truncated: need at least {need} bytes, have {have}")]
    InnerTruncated { need: usize, have: usize },
}

/// Handshake (C4) failures. Each maps to exactly one `ErrorMessage` string
/// sent to the peer before the socket is closed (§4.3, §7).
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("cannot connect to server: Connection timed out")]
    Timeout,
    #[error("cannot connect to server: signature verification failed")]
    SignatureInvalid,
    #[error("cannot connect to server: malformed key material")]
    MalformedKey,
    #[error("cannot connect to server: duplicate username")]
    DuplicateUsername,
    #[error("cannot connect to server: connection limit reached")]
    CapacityExceeded,
    #[error("cannot connect to server: IP banned")]
    IpBanned,
    #[error("cannot connect to server: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot connect to server: protocol error: {0}")]
    Protocol(String),
}

impl HandshakeError {
    /// The exact user-visible string a peer is sent before close.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}

/// Hub (C6) admission/lookup failures, per spec.md §4.5's documented `Err` variants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection limit reached")]
    CapacityReached,
    #[error("duplicate username")]
    DuplicateUsername,
    #[error("user does not exist")]
    UnknownUser,
}

//! C2 — record codec: fixed-offset binary encoding of `MsgRecord`/`AESRecord`,
//! and fragmentation/reassembly of application payloads (spec.md §4.1).
use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::CodecError;

/// Largest payload bytes a single fragment may carry (spec.md §6).
pub const MAX_CHUNK: usize = 1000;
/// `MsgRecord.username`/`.colour` fixed field capacity, per spec.md §3.
pub const MAX_NAME_LEN: usize = 32;
/// `AESRecord.data`/`.sig` fixed field capacity, per spec.md §3.
pub const AES_FIELD_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    RequestConnect,
    RequestDisconnect,
    Message,
    KeepAlive,
    WhisperMessage,
    ServerActiveUsers,
    ErrorMessage,
    SendAESKey,
}

impl MessageKind {
    fn to_tag(self) -> u8 {
        match self {
            MessageKind::RequestConnect => 0,
            MessageKind::RequestDisconnect => 1,
            MessageKind::Message => 2,
            MessageKind::KeepAlive => 3,
            MessageKind::WhisperMessage => 4,
            MessageKind::ServerActiveUsers => 5,
            MessageKind::ErrorMessage => 6,
            MessageKind::SendAESKey => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => MessageKind::RequestConnect,
            1 => MessageKind::RequestDisconnect,
            2 => MessageKind::Message,
            3 => MessageKind::KeepAlive,
            4 => MessageKind::WhisperMessage,
            5 => MessageKind::ServerActiveUsers,
            6 => MessageKind::ErrorMessage,
            7 => MessageKind::SendAESKey,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}

/// A single wire-level application record. `payload` never exceeds `MAX_CHUNK`
/// bytes; a logical message larger than that is represented by several
/// `MsgRecord`s produced by [`fragment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgRecord {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub username: String,
    pub colour: String,
    pub timestamp: DateTime<Utc>,
}

/// A record carrying an RSA-wrapped AES key (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesRecord {
    pub data: Vec<u8>,
    pub sig: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Msg(MsgRecord),
    Aes(AesRecord),
}

/// A fully reassembled application message, handed to the hub or the UI
/// sink. Unlike `MsgRecord` its payload is not bounded by `MAX_CHUNK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub username: String,
    pub colour: String,
    pub timestamp: DateTime<Utc>,
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_u16(buf: &[u8], at: usize) -> Result<u16, CodecError> {
    if buf.len() < at + 2 {
        return Err(CodecError::Truncated { need: at + 2, have: buf.len() });
    }
    Ok(u16::from_be_bytes([buf[at], buf[at + 1]]))
}

fn take_field<'a>(buf: &'a [u8], at: &mut usize) -> Result<&'a [u8], CodecError> {
    let len = take_u16(buf, *at)? as usize;
    *at += 2;
    if buf.len() < *at + len {
        return Err(CodecError::FieldOverrun { declared: len, remaining: buf.len() - *at });
    }
    let field = &buf[*at..*at + len];
    *at += len;
    Ok(field)
}

fn take_i64(buf: &[u8], at: usize) -> Result<i64, CodecError> {
    if buf.len() < at + 8 {
        return Err(CodecError::Truncated { need: at + 8, have: buf.len() });
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[at..at + 8]);
    Ok(i64::from_be_bytes(arr))
}

/// Encode a `Record` using the fixed-offset layout described in spec.md §3.
/// `kind` is the self-describing discriminant: an `AESRecord`'s kind byte is
/// always `SendAESKey`; any other tag value denotes a `MsgRecord`.
pub fn encode_record(record: &Record) -> Vec<u8> {
    match record {
        Record::Msg(m) => {
            let username = truncated(m.username.as_bytes(), MAX_NAME_LEN);
            let colour = truncated(m.colour.as_bytes(), MAX_NAME_LEN);
            let mut out = Vec::with_capacity(1 + 2 + m.payload.len() + 2 + username.len() + 2 + colour.len() + 8);
            out.push(m.kind.to_tag());
            push_field(&mut out, &m.payload);
            push_field(&mut out, username);
            push_field(&mut out, colour);
            out.extend_from_slice(&m.timestamp.timestamp_millis().to_be_bytes());
            out
        }
        Record::Aes(a) => {
            let data = truncated(&a.data, AES_FIELD_LEN);
            let sig = truncated(&a.sig, AES_FIELD_LEN);
            let mut out = Vec::with_capacity(1 + 2 + data.len() + 2 + sig.len() + 8);
            out.push(MessageKind::SendAESKey.to_tag());
            push_field(&mut out, data);
            push_field(&mut out, sig);
            out.extend_from_slice(&a.timestamp.timestamp_millis().to_be_bytes());
            out
        }
    }
}

/// Clamp to the original's fixed-size-array capacity: a `MsgRecord`
/// username/colour or `AESRecord` data/sig field that is too long is
/// silently truncated on encode, mirroring a fixed `[u8; N]` + `copy()`.
fn truncated(bytes: &[u8], max_len: usize) -> &[u8] {
    &bytes[..bytes.len().min(max_len)]
}

/// Decode a `Record`. Returns `Err` on truncated or malformed input — this
/// is always a transient, per-record error handled by dropping the record.
pub fn decode_record(buf: &[u8]) -> Result<Record, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Truncated { need: 1, have: 0 });
    }
    let kind = MessageKind::from_tag(buf[0])?;
    let mut at = 1usize;
    if matches!(kind, MessageKind::SendAESKey) {
        let data = take_field(buf, &mut at)?.to_vec();
        let sig = take_field(buf, &mut at)?.to_vec();
        let millis = take_i64(buf, at)?;
        Ok(Record::Aes(AesRecord { data, sig, timestamp: millis_to_datetime(millis) }))
    } else {
        let payload = take_field(buf, &mut at)?.to_vec();
        if payload.len() > MAX_CHUNK {
            return Err(CodecError::ChunkTooLarge(payload.len(), MAX_CHUNK));
        }
        let username = String::from_utf8_lossy(take_field(buf, &mut at)?).into_owned();
        let colour = String::from_utf8_lossy(take_field(buf, &mut at)?).into_owned();
        let millis = take_i64(buf, at)?;
        Ok(Record::Msg(MsgRecord {
            kind,
            payload,
            username,
            colour,
            timestamp: millis_to_datetime(millis),
        }))
    }
}

/// Split an application payload into consecutive `MsgRecord` fragments of at
/// most `MAX_CHUNK` bytes each. Header fields are duplicated on every
/// fragment but authoritative only on fragment #1 (spec.md §4.1). Always
/// produces at least one fragment, even for an empty payload.
pub fn fragment(
    kind: MessageKind,
    payload: &[u8],
    username: &str,
    colour: &str,
    timestamp: DateTime<Utc>,
) -> Vec<MsgRecord> {
    if payload.is_empty() {
        return vec![MsgRecord {
            kind,
            payload: Vec::new(),
            username: username.to_string(),
            colour: colour.to_string(),
            timestamp,
        }];
    }
    payload
        .chunks(MAX_CHUNK)
        .map(|chunk| MsgRecord {
            kind,
            payload: chunk.to_vec(),
            username: username.to_string(),
            colour: colour.to_string(),
            timestamp,
        })
        .collect()
}

/// Reassembles fragments received on a single connection back into a logical
/// `IncomingMessage`. Fragments of different messages are never interleaved
/// on one connection (spec.md §4.1), so only one reassembly is ever pending.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<u16, MsgRecord>,
    total: Option<u16>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns `Some(message)` once all `frag_total`
    /// fragments of the current message have arrived.
    pub fn accept(&mut self, frag_index: u16, frag_total: u16, record: MsgRecord) -> Option<IncomingMessage> {
        if frag_total <= 1 {
            return Some(IncomingMessage {
                kind: record.kind,
                payload: record.payload,
                username: record.username,
                colour: record.colour,
                timestamp: record.timestamp,
            });
        }
        self.total = Some(frag_total);
        self.pending.insert(frag_index, record);
        if self.pending.len() < frag_total as usize {
            return None;
        }
        let mut indices: Vec<u16> = self.pending.keys().copied().collect();
        indices.sort_unstable();
        let first = self.pending.get(&1)?.clone();
        let mut payload = Vec::new();
        for idx in indices {
            if let Some(frag) = self.pending.get(&idx) {
                payload.extend_from_slice(&frag.payload);
            }
        }
        self.pending.clear();
        self.total = None;
        Some(IncomingMessage {
            kind: first.kind,
            payload,
            username: first.username,
            colour: first.colour,
            timestamp: first.timestamp,
        })
    }
}

//! C5 — connection worker (plus C7 keep-alive, folded in per spec.md §9's
//! simplification note: a deadline re-armed on read replaces a timer task).
//! Two flavors share the framer/codec/crypto plumbing: [`run_server_peer`]
//! services one admitted remote peer on the hub side; [`run_client_peer`]
//! drives the local UI-facing half of a client (including a co-located host).
//! Both are generic over the stream type so tests can drive them with an
//! in-memory `tokio::io::duplex` pair instead of a real socket.
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::{self, IncomingMessage, MessageKind, MsgRecord, Reassembler, Record};
use crate::crypto::{self, AES_KEY_LEN};
use crate::events::{InboundEvent, InboundSender, OutboundCommand, OutboundReceiver};
use crate::framer::{self, FrameMode, Framer, MAX_FRAME};
use crate::hub::{self, Hub};

/// Idle deadline re-armed by every inbound `KeepAlive` record (spec.md §4.6).
pub const KEEP_ALIVE_DEADLINE: Duration = Duration::from_secs(30);
/// How often a client proactively emits `KeepAlive` while otherwise silent.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Service one admitted remote peer until it disconnects, is kicked/banned,
/// or falls idle past [`KEEP_ALIVE_DEADLINE`]. Always ends by calling
/// `hub.unregister`, which is idempotent and the sole broadcast authority
/// for departures (spec.md §9).
pub async fn run_server_peer<S>(
    stream: S,
    hub: Arc<Hub>,
    username: String,
    colour: String,
    peer_aes_key: [u8; AES_KEY_LEN],
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut close_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = split(stream);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut framer = Framer::new(FrameMode::Sealed);
    let mut reassembler = Reassembler::new();
    let mut buf = [0u8; MAX_FRAME];
    let mut deadline = Instant::now() + KEEP_ALIVE_DEADLINE;

    'read: loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    debug!(username = %username, "closed by hub");
                    break 'read;
                }
            }
            outcome = timeout(remaining, read_into(&mut read_half, &mut buf)) => {
                match outcome {
                    Err(_) => {
                        info!(username = %username, "idle timeout");
                        break 'read;
                    }
                    Ok(Ok(0)) => break 'read,
                    Ok(Err(e)) => {
                        warn!(username = %username, error = %e, "socket read error");
                        break 'read;
                    }
                    Ok(Ok(n)) => {
                        for sealed in framer.push(&buf[..n]) {
                            match decode_sealed(&peer_aes_key, &sealed) {
                                Ok((frag_index, frag_total, Record::Msg(msg))) => {
                                    if matches!(msg.kind, MessageKind::KeepAlive) {
                                        deadline = Instant::now() + KEEP_ALIVE_DEADLINE;
                                    }
                                    if let Some(message) = reassembler.accept(frag_index, frag_total, msg) {
                                        dispatch_to_hub(&hub, &username, &colour, message);
                                    }
                                }
                                Ok((_, _, Record::Aes(_))) => {
                                    warn!(username = %username, "unexpected SendAESKey after admission, dropping");
                                }
                                Err(reason) => warn!(username = %username, reason, "dropping malformed record"),
                            }
                        }
                    }
                }
            }
        }
    }

    writer.abort();
    hub.unregister(&username);
}

async fn read_into<R: AsyncRead + Unpin>(read_half: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    use tokio::io::AsyncReadExt;
    read_half.read(buf).await
}

fn decode_sealed(key: &[u8; AES_KEY_LEN], sealed: &[u8]) -> Result<(u16, u16, Record), &'static str> {
    let inner = crypto::aes_open(key, sealed).map_err(|_| "AES open failed")?;
    let (frag_index, frag_total, record_bytes) = framer::parse_inner(&inner).map_err(|_| "inner frame truncated")?;
    let record = codec::decode_record(record_bytes).map_err(|_| "malformed record")?;
    Ok((frag_index, frag_total, record))
}

fn dispatch_to_hub(hub: &Hub, username: &str, colour: &str, message: IncomingMessage) {
    match message.kind {
        MessageKind::Message => {
            let rendered = hub::format_group_line(username, colour, message.timestamp, &message.payload);
            hub.broadcast_group(username, rendered);
        }
        MessageKind::WhisperMessage => {
            let target = first_token(&message.payload);
            let rendered = hub::format_whisper_line(username, colour, message.timestamp, &message.payload);
            if let Err(e) = hub.send_to_user(&target, username, rendered) {
                warn!(sender = username, target, error = %e, "whisper target not found");
            }
        }
        MessageKind::RequestDisconnect => {
            let _ = hub.close_user(username);
        }
        MessageKind::KeepAlive => {}
        other => {
            warn!(username, kind = ?other, "unexpected record kind from peer, dropping");
        }
    }
}

/// First whitespace-delimited token; the remainder (token included in the
/// caller's own copy of `payload`) is rendered verbatim, unstripped
/// (spec.md §9's open question).
fn first_token(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == b' ').unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Drive the local UI-facing half of a client connection: turns
/// `OutboundCommand`s into sealed records on the wire, and turns inbound
/// sealed records into `InboundEvent`s for the UI sink. `host_hub` is
/// `Some` only for the client co-located with a host's own server, giving
/// `Kick`/`Ban` direct access to the hub instead of a wire round-trip.
pub async fn run_client_peer<S>(
    stream: S,
    own_aes_key: [u8; AES_KEY_LEN],
    peer_aes_key: [u8; AES_KEY_LEN],
    username: String,
    colour: String,
    outbound_rx: OutboundReceiver,
    events_tx: InboundSender,
    host_hub: Option<Arc<Hub>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, write_half) = split(stream);

    let writer = tokio::spawn(run_client_writer(write_half, own_aes_key, username, colour, outbound_rx, host_hub));

    let mut framer = Framer::new(FrameMode::Sealed);
    let mut reassembler = Reassembler::new();
    let mut buf = [0u8; MAX_FRAME];

    loop {
        let n = match read_into(&mut read_half, &mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "client socket read error");
                break;
            }
        };
        for sealed in framer.push(&buf[..n]) {
            match decode_sealed(&peer_aes_key, &sealed) {
                Ok((frag_index, frag_total, Record::Msg(msg))) => {
                    if let Some(message) = reassembler.accept(frag_index, frag_total, msg) {
                        dispatch_to_ui(&events_tx, message);
                    }
                }
                Ok((_, _, Record::Aes(_))) => warn!("unexpected SendAESKey after handshake, dropping"),
                Err(reason) => warn!(reason, "dropping malformed record"),
            }
        }
    }

    writer.abort();
    let _ = events_tx.send(InboundEvent::Disconnected);
}

fn dispatch_to_ui(events_tx: &InboundSender, message: IncomingMessage) {
    let event = match message.kind {
        MessageKind::Message | MessageKind::WhisperMessage => InboundEvent::RenderMessage(message.payload),
        MessageKind::ServerActiveUsers => {
            let list = String::from_utf8_lossy(&message.payload)
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            InboundEvent::RenderActiveUsers(list)
        }
        MessageKind::ErrorMessage => InboundEvent::RenderError(message.payload),
        other => {
            warn!(kind = ?other, "unexpected record kind from server, dropping");
            return;
        }
    };
    let _ = events_tx.send(event);
}

async fn run_client_writer<S>(
    mut write_half: WriteHalf<S>,
    own_aes_key: [u8; AES_KEY_LEN],
    username: String,
    colour: String,
    mut outbound_rx: OutboundReceiver,
    host_hub: Option<Arc<Hub>>,
) where
    S: AsyncWrite + Unpin,
{
    let mut ticker = interval(KEEP_ALIVE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = hub::seal_single(&own_aes_key, MessageKind::KeepAlive, &[], &username, &colour);
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
            command = outbound_rx.recv() => {
                let Some(command) = command else { break };
                if !handle_outbound(command, &mut write_half, &own_aes_key, &username, &colour, host_hub.as_deref()).await {
                    break;
                }
            }
        }
    }
}

async fn handle_outbound<S>(
    command: OutboundCommand,
    write_half: &mut WriteHalf<S>,
    own_aes_key: &[u8; AES_KEY_LEN],
    username: &str,
    colour: &str,
    host_hub: Option<&Hub>,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    let (kind, payload) = match command {
        OutboundCommand::SendMessage(bytes) => (MessageKind::Message, bytes),
        OutboundCommand::SendWhisper(bytes) => (MessageKind::WhisperMessage, bytes),
        OutboundCommand::RequestDisconnect => (MessageKind::RequestDisconnect, Vec::new()),
        OutboundCommand::Kick(target) => {
            match host_hub {
                Some(hub) => {
                    if let Err(e) = hub.close_user(&target) {
                        warn!(target, error = %e, "kick failed");
                    }
                }
                None => warn!("Kick issued by a non-host client, ignoring"),
            }
            return true;
        }
        OutboundCommand::Ban(target) => {
            match host_hub {
                Some(hub) => {
                    if let Err(e) = hub.ban(&target) {
                        warn!(target, error = %e, "ban failed");
                    }
                }
                None => warn!("Ban issued by a non-host client, ignoring"),
            }
            return true;
        }
    };
    for frame in seal_fragmented(own_aes_key, kind, &payload, username, colour) {
        if write_half.write_all(&frame).await.is_err() {
            return false;
        }
    }
    true
}

/// Seal `payload` as one or more sealed frames, splitting it into
/// `codec::MAX_CHUNK`-sized fragments first (spec.md §4.1). A client's own
/// outbound `Message`/`WhisperMessage` records can exceed one chunk, unlike
/// the single-fragment `KeepAlive`/`RequestDisconnect` records sealed via
/// [`hub::seal_single`].
fn seal_fragmented(own_key: &[u8; AES_KEY_LEN], kind: MessageKind, payload: &[u8], username: &str, colour: &str) -> Vec<Vec<u8>> {
    let timestamp = chrono::Utc::now();
    let fragments = codec::fragment(kind, payload, username, colour, timestamp);
    let total = fragments.len() as u16;
    fragments
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let record_bytes = codec::encode_record(&Record::Msg(record.clone()));
            let inner = framer::build_inner((i + 1) as u16, total, &record_bytes);
            let sealed = crypto::aes_seal(own_key, &inner);
            framer::encode_sealed_frame(&sealed)
        })
        .collect()
}

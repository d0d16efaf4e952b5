//! C6 — hub: registry of live connections, broadcast fan-out, targeted
//! delivery, bounded history, blacklist, active-user enumeration (spec.md §4.5).
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use chrono::Utc;
use parking_lot::RwLock;
use rsa::RsaPublicKey;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::codec::{self, MessageKind, MsgRecord, Record};
use crate::crypto::{self, AES_KEY_LEN};
use crate::error::HubError;
use crate::framer;

/// Bound on the group-message history ring (spec.md §3).
pub const MAX_HISTORY: usize = 200;

/// Per-peer state the hub tracks, created on admission and destroyed on
/// unregister (spec.md §3's `ConnectedUser`).
pub struct ConnectedUser {
    pub colour: String,
    pub addr: SocketAddr,
    pub peer_public_key: RsaPublicKey,
    pub peer_aes_key: [u8; AES_KEY_LEN],
    /// Pre-framed, already-sealed wire bytes are pushed here; the
    /// connection's writer task drains and writes them to the socket.
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Flipped to force the connection's read loop to unwind (kick/ban);
    /// the worker holds the matching `watch::Receiver` (spec.md §4.4/§9).
    pub close: watch::Sender<bool>,
}

/// A new connection admitted by the handshake + admission path (spec.md §4.7).
pub struct NewUser {
    pub username: String,
    pub colour: String,
    pub addr: SocketAddr,
    pub peer_public_key: RsaPublicKey,
    pub peer_aes_key: [u8; AES_KEY_LEN],
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub close: watch::Sender<bool>,
}

#[derive(Default)]
struct HubState {
    live: HashMap<String, ConnectedUser>,
    history: VecDeque<Vec<u8>>,
    blacklist: HashSet<String>,
    host_user: Option<String>,
}

/// The shared, single-reader-writer-lock registry described in spec.md §3 and §5.
pub struct Hub {
    state: RwLock<HubState>,
    server_rsa: crypto::RsaKeyPair,
    server_aes_key: [u8; AES_KEY_LEN],
    server_name: String,
    max_connections: usize,
}

impl Hub {
    pub fn new(server_rsa: crypto::RsaKeyPair, server_name: String, max_connections: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            server_aes_key: crypto::generate_aes_key(),
            server_rsa,
            server_name,
            max_connections,
        }
    }

    pub fn server_public_key(&self) -> &RsaPublicKey {
        &self.server_rsa.public
    }

    pub fn server_private_key(&self) -> &rsa::RsaPrivateKey {
        &self.server_rsa.private
    }

    pub fn server_aes_key(&self) -> [u8; AES_KEY_LEN] {
        self.server_aes_key
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Mark `username` as the locally co-located host client (spec.md §3).
    pub fn set_host_user(&self, username: Option<String>) {
        self.state.write().host_user = username;
    }

    /// Admit a new connection. Fails if the capacity is reached or the
    /// username is already live (spec.md §4.5, invariant 4).
    pub fn register(&self, user: NewUser) -> Result<(), HubError> {
        let mut state = self.state.write();
        if state.live.len() >= self.max_connections {
            return Err(HubError::CapacityReached);
        }
        if state.live.contains_key(&user.username) {
            return Err(HubError::DuplicateUsername);
        }
        state.live.insert(
            user.username.clone(),
            ConnectedUser {
                colour: user.colour,
                addr: user.addr,
                peer_public_key: user.peer_public_key,
                peer_aes_key: user.peer_aes_key,
                outbound: user.outbound,
                close: user.close,
            },
        );
        info!(username = %user.username, "user admitted");
        Ok(())
    }

    /// Remove `username` if present, then broadcast "user left" and a
    /// refreshed active-user list. Removal happens before the broadcast so
    /// the active-user list never transiently contains the departing user
    /// (spec.md §9's resolved open question). Idempotent.
    pub fn unregister(&self, username: &str) {
        let removed = self.state.write().live.remove(username).is_some();
        if !removed {
            return;
        }
        info!(username, "user left");
        self.broadcast_system_message(format!("User {username} has left the server!").into_bytes());
        self.broadcast_active_users();
    }

    /// Force-close a live connection's socket without touching the blacklist
    /// (host "kick"). The connection's own read loop performs the actual
    /// `unregister` once it observes the close signal.
    pub fn close_user(&self, username: &str) -> Result<(), HubError> {
        let state = self.state.read();
        match state.live.get(username) {
            Some(user) => {
                let _ = user.close.send(true);
                Ok(())
            }
            None => Err(HubError::UnknownUser),
        }
    }

    /// Ban `username`'s IP and close their connection (spec.md §4.5, invariant 6).
    pub fn ban(&self, username: &str) -> Result<(), HubError> {
        let ip = {
            let state = self.state.read();
            let user = state.live.get(username).ok_or(HubError::UnknownUser)?;
            user.addr.ip().to_string()
        };
        self.state.write().blacklist.insert(ip.clone());
        warn!(username, ip, "banned");
        self.close_user(username)
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.state.read().blacklist.contains(ip)
    }

    pub fn active_usernames(&self) -> Vec<String> {
        self.state.read().live.keys().cloned().collect()
    }

    pub fn is_host(&self, username: &str) -> bool {
        self.state.read().host_user.as_deref() == Some(username)
    }

    /// Seal `payload` (as one or more `MsgRecord` fragments) with the
    /// server's single AES key, producing wire-ready frames. Every peer
    /// holds this same key (received in handshake step 4), so a broadcast
    /// need only be sealed once (spec.md §4.3's "encrypting once" remark).
    fn seal_and_frame(&self, kind: MessageKind, username: &str, colour: &str, payload: &[u8]) -> Vec<Vec<u8>> {
        let timestamp = Utc::now();
        let fragments = codec::fragment(kind, payload, username, colour, timestamp);
        let total = fragments.len() as u16;
        fragments
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let record_bytes = codec::encode_record(&Record::Msg(record.clone()));
                let inner = framer::build_inner((i + 1) as u16, total, &record_bytes);
                let sealed = crypto::aes_seal(&self.server_aes_key, &inner);
                framer::encode_sealed_frame(&sealed)
            })
            .collect()
    }

    fn send_frames_to(&self, username: &str, frames: &[Vec<u8>]) -> bool {
        let state = self.state.read();
        match state.live.get(username) {
            Some(user) => {
                for frame in frames {
                    let _ = user.outbound.send(frame.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Fan a group message out to every live user except `sender`, and
    /// append it to the bounded history ring (spec.md §4.5, invariant 7).
    pub fn broadcast_group(&self, sender: &str, rendered: Vec<u8>) {
        let frames = self.seal_and_frame(MessageKind::Message, sender, "", &rendered);
        let targets: Vec<String> = {
            let state = self.state.read();
            state.live.keys().filter(|u| u.as_str() != sender).cloned().collect()
        };
        for target in &targets {
            self.send_frames_to(target, &frames);
        }
        let mut state = self.state.write();
        state.history.push_back(rendered);
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }
    }

    /// Send `rendered` to exactly one user; does not touch history
    /// (spec.md §4.5).
    pub fn send_to_user(&self, target: &str, sender: &str, rendered: Vec<u8>) -> Result<(), HubError> {
        let frames = self.seal_and_frame(MessageKind::WhisperMessage, sender, "", &rendered);
        if self.send_frames_to(target, &frames) {
            Ok(())
        } else {
            Err(HubError::UnknownUser)
        }
    }

    fn broadcast_system_message(&self, rendered: Vec<u8>) {
        let frames = self.seal_and_frame(MessageKind::ErrorMessage, &self.server_name, "white", &rendered);
        let targets: Vec<String> = self.state.read().live.keys().cloned().collect();
        for target in &targets {
            self.send_frames_to(target, &frames);
        }
    }

    /// Build and broadcast the `;`-separated active-user list (spec.md §4.5).
    /// Empty lists are not broadcast.
    pub fn broadcast_active_users(&self) {
        let tokens: Vec<String> = {
            let state = self.state.read();
            let mut tokens: Vec<String> = state
                .live
                .iter()
                .map(|(name, user)| {
                    let mut token = format!("[{}]{}[white]", user.colour, name);
                    if state.host_user.as_deref() == Some(name.as_str()) {
                        token.push_str(" (host)");
                    }
                    token
                })
                .collect();
            tokens.sort();
            tokens
        };
        if tokens.is_empty() {
            return;
        }
        let payload = tokens.join(";").into_bytes();
        let frames = self.seal_and_frame(MessageKind::ServerActiveUsers, &self.server_name, "white", &payload);
        let targets: Vec<String> = self.state.read().live.keys().cloned().collect();
        for target in &targets {
            self.send_frames_to(target, &frames);
        }
    }

    /// Replay the history ring to a newly admitted user, oldest first. Must
    /// be called before the "joined" broadcast (spec.md §4.5, scenario c).
    pub fn replay_history_to(&self, username: &str) {
        let history: Vec<Vec<u8>> = self.state.read().history.iter().cloned().collect();
        for rendered in history {
            let frames = self.seal_and_frame(MessageKind::Message, &self.server_name, "white", &rendered);
            self.send_frames_to(username, &frames);
        }
    }

    pub fn broadcast_joined(&self, username: &str) {
        self.broadcast_system_message(format!("User {username} has joined the server!").into_bytes());
    }
}

/// Seal a single `MsgRecord` fragment (kind + raw payload) with `own_key`,
/// for use by a connection worker encrypting its own outbound traffic
/// (e.g. a client's `KeepAlive`/`Message`/`WhisperMessage` records).
pub fn seal_single(own_key: &[u8; AES_KEY_LEN], kind: MessageKind, payload: &[u8], username: &str, colour: &str) -> Vec<u8> {
    let record = MsgRecord {
        kind,
        payload: payload.to_vec(),
        username: username.to_string(),
        colour: colour.to_string(),
        timestamp: Utc::now(),
    };
    let record_bytes = codec::encode_record(&Record::Msg(record));
    let inner = framer::build_inner(1, 1, &record_bytes);
    let sealed = crypto::aes_seal(own_key, &inner);
    framer::encode_sealed_frame(&sealed)
}

/// Render a group message line (spec.md §8 scenario a).
pub fn format_group_line(username: &str, colour: &str, timestamp: chrono::DateTime<Utc>, body: &[u8]) -> Vec<u8> {
    let body = String::from_utf8_lossy(body);
    format!("[{}] [{}]{} ~[white] {}", timestamp.to_rfc3339(), colour, username, body).into_bytes()
}

/// Render a whisper line. The recipient token is NOT stripped from the
/// rendered body, matching the original implementation verbatim (spec.md §9).
pub fn format_whisper_line(username: &str, colour: &str, timestamp: chrono::DateTime<Utc>, raw_payload: &[u8]) -> Vec<u8> {
    let body = String::from_utf8_lossy(raw_payload);
    format!(
        "[{}] [{}]{}\u{1b}[3m\u{1b}[7m (whispered): {}\u{1b}[0m",
        timestamp.to_rfc3339(),
        colour,
        username,
        body
    )
    .into_bytes()
}

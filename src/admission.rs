//! C8 — admission control: the TCP accept loop, blacklist gate, bounded
//! handshake, and hub registration (spec.md §4.7).
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::codec::{self, MessageKind, MsgRecord, Record};
use crate::connection;
use crate::error::{HandshakeError, HubError};
use crate::framer;
use crate::handshake::{self, HandshakeOutcome, Identity};
use crate::hub::{self, Hub, NewUser};

/// Accept connections on `listener` until the process is shut down,
/// spawning one admission+worker task pair per incoming socket.
pub async fn accept_loop(listener: TcpListener, hub: Arc<Hub>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            admit(stream, addr, hub).await;
        });
    }
}

/// Run the full admission sequence for one freshly accepted socket: deny
/// banned IPs outright, run the handshake under its deadline, then register
/// with the hub. Any failure writes a single `ErrorMessage` and closes.
async fn admit(mut stream: TcpStream, addr: std::net::SocketAddr, hub: Arc<Hub>) {
    let ip = addr.ip().to_string();
    if hub.is_banned(&ip) {
        warn!(%ip, "rejecting connection from banned address");
        deny_pre_handshake(&mut stream, &HandshakeError::IpBanned).await;
        return;
    }

    let identity = Identity {
        username: hub.server_name().to_string(),
        colour: "white".to_string(),
        rsa: crate::crypto::RsaKeyPair {
            private: hub.server_private_key().clone(),
            public: hub.server_public_key().clone(),
        },
        own_aes_key: hub.server_aes_key(),
    };

    let outcome = match handshake::run_server_handshake_with_deadline(&mut stream, &identity).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(%ip, error = %e, "handshake failed");
            deny_pre_handshake(&mut stream, &e).await;
            return;
        }
    };

    register_peer(stream, addr, hub, outcome).await;
}

/// Register the admitted peer with the hub and hand its socket to a
/// [`connection::run_server_peer`] task. On a post-handshake admission
/// failure (duplicate username, capacity), the peer already holds the
/// final handshake AES key, so the denial is sealed with it before the
/// socket is closed.
async fn register_peer(mut stream: TcpStream, addr: std::net::SocketAddr, hub: Arc<Hub>, outcome: HandshakeOutcome) {
    let HandshakeOutcome { peer_username, peer_colour, peer_public_key, peer_aes_key } = outcome;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(false);

    let new_user = NewUser {
        username: peer_username.clone(),
        colour: peer_colour.clone(),
        addr,
        peer_public_key,
        peer_aes_key,
        outbound: outbound_tx,
        close: close_tx,
    };

    if let Err(hub_err) = hub.register(new_user) {
        let wire_err = match hub_err {
            HubError::DuplicateUsername => HandshakeError::DuplicateUsername,
            HubError::CapacityReached => HandshakeError::CapacityExceeded,
            HubError::UnknownUser => HandshakeError::Protocol("unknown user".into()),
        };
        warn!(username = %peer_username, error = %wire_err, "admission denied after handshake");
        let frame = hub::seal_single(&hub.server_aes_key(), MessageKind::ErrorMessage, wire_err.wire_message().as_bytes(), hub.server_name(), "white");
        let _ = stream.write_all(&frame).await;
        let _ = stream.shutdown().await;
        return;
    }

    info!(username = %peer_username, %addr, "peer admitted");
    hub.replay_history_to(&peer_username);
    hub.broadcast_joined(&peer_username);
    hub.broadcast_active_users();

    tokio::spawn(connection::run_server_peer(stream, hub, peer_username, peer_colour, peer_aes_key, outbound_rx, close_rx));
}

/// Deny before the 4-step exchange completed: the peer is still reading
/// plaintext handshake frames, so the denial travels the same way.
async fn deny_pre_handshake<S>(stream: &mut S, err: &HandshakeError)
where
    S: AsyncWrite + Unpin,
{
    let record = Record::Msg(MsgRecord {
        kind: MessageKind::ErrorMessage,
        payload: err.wire_message().into_bytes(),
        username: "server".into(),
        colour: "white".into(),
        timestamp: Utc::now(),
    });
    let record_bytes = codec::encode_record(&record);
    let inner = framer::build_inner(1, 1, &record_bytes);
    let frame = framer::encode_handshake_frame(&inner);
    let _ = stream.write_all(&frame).await;
    let _ = stream.shutdown().await;
}

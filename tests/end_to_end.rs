//! End-to-end scenarios over real loopback `TcpListener`/`TcpStream` pairs
//! (spec.md §8). Each test stands up a hub, admits one or more clients
//! through the real handshake, and drives them through the public
//! `OutboundCommand`/`InboundEvent` channel surface exactly as `main.rs` does.
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chatterbox_hub::admission;
use chatterbox_hub::connection;
use chatterbox_hub::crypto::{self, RsaKeyPair};
use chatterbox_hub::handshake::{self, Identity};
use chatterbox_hub::hub::Hub;
use chatterbox_hub::{InboundEvent, OutboundCommand};

async fn spawn_server(max_connections: usize) -> (Arc<Hub>, std::net::SocketAddr) {
    let hub = Arc::new(Hub::new(RsaKeyPair::generate().unwrap(), "server".into(), max_connections));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_hub = hub.clone();
    tokio::spawn(async move { admission::accept_loop(listener, accept_hub).await });
    (hub, addr)
}

struct Client {
    worker: JoinHandle<()>,
    commands: mpsc::UnboundedSender<OutboundCommand>,
    events: mpsc::UnboundedReceiver<InboundEvent>,
}

/// Connect, complete the handshake, and spawn a client worker. Then wait
/// until `hub` actually reflects the registration: the client's handshake
/// future resolves as soon as it reads the server's last handshake frame,
/// which races the server's own post-handshake `hub.register()` call.
async fn connect_client(hub: &Hub, addr: std::net::SocketAddr, username: &str, colour: &str) -> Client {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let own_aes_key = crypto::generate_aes_key();
    let identity = Identity {
        username: username.to_string(),
        colour: colour.to_string(),
        rsa: RsaKeyPair::generate().unwrap(),
        own_aes_key,
    };
    let outcome = handshake::run_client_handshake(&mut stream, &identity).await.unwrap();

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(connection::run_client_peer(
        stream,
        own_aes_key,
        outcome.peer_aes_key,
        username.to_string(),
        colour.to_string(),
        commands_rx,
        events_tx,
        None,
    ));

    wait_until_registered(hub, username).await;
    Client { worker, commands: commands_tx, events: events_rx }
}

async fn wait_until_registered(hub: &Hub, username: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if hub.active_usernames().contains(&username.to_string()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peer never appeared in the hub's live set");
}

async fn recv_timeout(events: &mut mpsc::UnboundedReceiver<InboundEvent>) -> InboundEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event did not arrive in time")
        .expect("event channel closed early")
}

/// Skip the `RenderActiveUsers` refresh(es) every admission/departure
/// triggers and return the next non-active-users event.
async fn recv_message(events: &mut mpsc::UnboundedReceiver<InboundEvent>) -> InboundEvent {
    loop {
        match recv_timeout(events).await {
            InboundEvent::RenderActiveUsers(_) => continue,
            other => return other,
        }
    }
}

/// Skip both `RenderActiveUsers` refreshes and join/leave system broadcasts
/// (`RenderError`), returning only the next actual chat `RenderMessage`.
async fn recv_chat_message(events: &mut mpsc::UnboundedReceiver<InboundEvent>) -> Vec<u8> {
    loop {
        match recv_timeout(events).await {
            InboundEvent::RenderActiveUsers(_) => continue,
            InboundEvent::RenderError(_) => continue,
            InboundEvent::RenderMessage(bytes) => return bytes,
            other => panic!("expected RenderMessage, got {other:?}"),
        }
    }
}

// Scenario (a): a single-chunk group message sent by one client is rendered
// for the other, word for word.
#[tokio::test]
async fn scenario_a_single_chunk_group_message_is_echoed_to_the_other_client() {
    let (hub, addr) = spawn_server(16).await;
    let alice = connect_client(&hub, addr, "alice", "red").await;
    let mut bob = connect_client(&hub, addr, "bob", "blue").await;

    alice.commands.send(OutboundCommand::SendMessage(b"hi bob".to_vec())).unwrap();

    let bytes = recv_chat_message(&mut bob.events).await;
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("hi bob"), "rendered line was: {text}");
    assert!(text.contains("alice"), "rendered line was: {text}");

    alice.worker.abort();
    bob.worker.abort();
}

// Scenario (b): a message over MAX_CHUNK bytes is split into fragments on
// the wire and reassembled back into one logical message on arrival.
#[tokio::test]
async fn scenario_b_oversized_message_is_fragmented_and_reassembled() {
    let (hub, addr) = spawn_server(16).await;
    let alice = connect_client(&hub, addr, "alice", "red").await;
    let mut bob = connect_client(&hub, addr, "bob", "blue").await;

    let payload = vec![b'x'; 2500];
    alice.commands.send(OutboundCommand::SendMessage(payload)).unwrap();

    let bytes = recv_chat_message(&mut bob.events).await;
    let text = String::from_utf8_lossy(&bytes);
    assert_eq!(text.matches('x').count(), 2500);

    alice.worker.abort();
    bob.worker.abort();
}

// Scenario (c): a client joining after messages were sent replays the
// bounded history before the "joined" system broadcast goes out.
#[tokio::test]
async fn scenario_c_history_replay_precedes_joined_broadcast() {
    let (hub, addr) = spawn_server(16).await;
    let alice = connect_client(&hub, addr, "alice", "red").await;

    alice.commands.send(OutboundCommand::SendMessage(b"first".to_vec())).unwrap();
    alice.commands.send(OutboundCommand::SendMessage(b"second".to_vec())).unwrap();
    // Give the server time to append both to history before bob joins.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut bob = connect_client(&hub, addr, "bob", "blue").await;

    let first = recv_message(&mut bob.events).await;
    let second = recv_message(&mut bob.events).await;
    let joined = recv_message(&mut bob.events).await;

    let first_text = match first {
        InboundEvent::RenderMessage(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        other => panic!("expected RenderMessage, got {other:?}"),
    };
    let second_text = match second {
        InboundEvent::RenderMessage(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        other => panic!("expected RenderMessage, got {other:?}"),
    };
    assert!(first_text.contains("first"));
    assert!(second_text.contains("second"));
    match joined {
        InboundEvent::RenderError(bytes) => {
            assert!(String::from_utf8_lossy(&bytes).contains("bob has joined"));
        }
        other => panic!("expected the joined system message, got {other:?}"),
    }

    alice.worker.abort();
    bob.worker.abort();
}

// Scenario (d): a whisper is delivered only to its target, with the
// recipient token left unstripped in the rendered body.
#[tokio::test]
async fn scenario_d_whisper_reaches_only_its_target_with_token_unstripped() {
    let (hub, addr) = spawn_server(16).await;
    let alice = connect_client(&hub, addr, "alice", "red").await;
    let mut bob = connect_client(&hub, addr, "bob", "blue").await;
    let mut carol = connect_client(&hub, addr, "carol", "green").await;

    alice.commands.send(OutboundCommand::SendWhisper(b"bob secret".to_vec())).unwrap();

    let bytes = recv_chat_message(&mut bob.events).await;
    assert!(String::from_utf8_lossy(&bytes).contains("bob secret"));

    assert!(
        tokio::time::timeout(Duration::from_millis(300), recv_chat_message(&mut carol.events)).await.is_err(),
        "carol must not receive alice's whisper to bob"
    );

    alice.worker.abort();
    bob.worker.abort();
    carol.worker.abort();
}

// Scenario (e): a connected peer that never sends a KeepAlive (or anything
// else) is disconnected once the server's idle deadline elapses. Uses paused
// virtual time rather than waiting 30 real seconds; the raw handshake is
// driven directly instead of through `run_client_peer`, whose writer task
// would otherwise ping a `KeepAlive` every `KEEP_ALIVE_INTERVAL` and keep the
// peer alive forever.
#[tokio::test(start_paused = true)]
async fn scenario_e_idle_client_is_disconnected_after_the_keep_alive_deadline() {
    let (hub, addr) = spawn_server(16).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let identity = Identity {
        username: "alice".into(),
        colour: "red".into(),
        rsa: RsaKeyPair::generate().unwrap(),
        own_aes_key: crypto::generate_aes_key(),
    };
    handshake::run_client_handshake(&mut stream, &identity).await.unwrap();
    wait_until_registered(&hub, "alice").await;

    tokio::time::advance(connection::KEEP_ALIVE_DEADLINE + Duration::from_secs(1)).await;

    for _ in 0..100 {
        tokio::task::yield_now().await;
        if !hub.active_usernames().contains(&"alice".to_string()) {
            break;
        }
    }
    assert!(
        !hub.active_usernames().contains(&"alice".to_string()),
        "idle peer should have been unregistered after KEEP_ALIVE_DEADLINE"
    );

    drop(stream);
}

// Scenario (f): a banned IP is rejected outright on its next connection
// attempt, and the denial arrives pre-handshake.
#[tokio::test]
async fn scenario_f_ban_blacklists_the_ip_and_the_next_connection_is_denied() {
    let (hub, addr) = spawn_server(16).await;
    let alice = connect_client(&hub, addr, "alice", "red").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    hub.ban("alice").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!hub.active_usernames().contains(&"alice".to_string()));

    // The same loopback address is now blacklisted; a fresh handshake
    // attempt must fail before completing (denied pre-handshake).
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let identity = Identity {
        username: "alice-again".into(),
        colour: "red".into(),
        rsa: RsaKeyPair::generate().unwrap(),
        own_aes_key: crypto::generate_aes_key(),
    };
    let result = handshake::run_client_handshake(&mut stream, &identity).await;
    assert!(result.is_err(), "banned IP must not be able to complete a fresh handshake");

    alice.worker.abort();
}

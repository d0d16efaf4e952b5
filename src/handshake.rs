//! C4 — handshake engine: the 4-step RSA/AES key exchange (spec.md §4.3),
//! identical in shape for client and server, only the send/receive order differs.
use chrono::Utc;
use rsa::RsaPublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::codec::{self, AesRecord, MessageKind, MsgRecord, Record};
use crate::crypto::{self, AES_KEY_LEN};
use crate::error::HandshakeError;
use crate::framer::{self, FrameMode, Framer, MAX_FRAME};

/// Wall-clock deadline from accept to admission (spec.md §4.3).
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

/// This side's stable identity, known before any handshake begins.
pub struct Identity {
    pub username: String,
    pub colour: String,
    pub rsa: crypto::RsaKeyPair,
    pub own_aes_key: [u8; AES_KEY_LEN],
}

/// Everything learned about the peer once the 4-step exchange completes.
pub struct HandshakeOutcome {
    pub peer_username: String,
    pub peer_colour: String,
    pub peer_public_key: RsaPublicKey,
    /// The AES key the peer generated; used to decrypt its inbound records.
    pub peer_aes_key: [u8; AES_KEY_LEN],
}

/// Read exactly one unencrypted handshake-phase record from `stream`.
async fn read_handshake_record<S>(stream: &mut S, framer: &mut Framer) -> Result<Record, HandshakeError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_FRAME];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(HandshakeError::Protocol("peer closed during handshake".into()));
        }
        for body in framer.push(&buf[..n]) {
            let (_idx, _total, record_bytes) = framer::parse_inner(&body)
                .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
            let record = codec::decode_record(record_bytes)
                .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
            return Ok(record);
        }
    }
}

async fn write_handshake_record<S>(stream: &mut S, record: &Record) -> Result<(), HandshakeError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let record_bytes = codec::encode_record(record);
    let inner = framer::build_inner(1, 1, &record_bytes);
    let frame = framer::encode_handshake_frame(&inner);
    stream.write_all(&frame).await?;
    Ok(())
}

fn hello_record(identity: &Identity) -> Result<Record, HandshakeError> {
    let pem = crypto::encode_public_key_pem(&identity.rsa.public)
        .map_err(|_| HandshakeError::MalformedKey)?;
    Ok(Record::Msg(MsgRecord {
        kind: MessageKind::RequestConnect,
        payload: pem.into_bytes(),
        username: identity.username.clone(),
        colour: identity.colour.clone(),
        timestamp: Utc::now(),
    }))
}

fn parse_hello(record: Record) -> Result<(String, String, RsaPublicKey), HandshakeError> {
    match record {
        Record::Msg(m) if matches!(m.kind, MessageKind::RequestConnect) => {
            let pem = String::from_utf8(m.payload).map_err(|_| HandshakeError::MalformedKey)?;
            let key = crypto::decode_public_key_pem(&pem).map_err(|_| HandshakeError::MalformedKey)?;
            Ok((m.username, m.colour, key))
        }
        _ => Err(HandshakeError::Protocol("expected RequestConnect".into())),
    }
}

fn send_aes_key_record(identity: &Identity, peer_public_key: &RsaPublicKey) -> Result<Record, HandshakeError> {
    let data = crypto::rsa_encrypt(peer_public_key, &identity.own_aes_key)
        .map_err(|_| HandshakeError::MalformedKey)?;
    let sig = crypto::rsa_sign(&identity.rsa.private, &identity.own_aes_key)
        .map_err(|_| HandshakeError::MalformedKey)?;
    Ok(Record::Aes(AesRecord { data, sig, timestamp: Utc::now() }))
}

fn receive_aes_key_record(
    record: Record,
    own_private: &rsa::RsaPrivateKey,
    peer_public_key: &RsaPublicKey,
) -> Result<[u8; AES_KEY_LEN], HandshakeError> {
    let aes_record = match record {
        Record::Aes(a) => a,
        _ => return Err(HandshakeError::Protocol("expected SendAESKey".into())),
    };
    let plaintext = crypto::rsa_decrypt(own_private, &aes_record.data).map_err(|_| HandshakeError::MalformedKey)?;
    crypto::rsa_verify(peer_public_key, &plaintext, &aes_record.sig)
        .map_err(|_| HandshakeError::SignatureInvalid)?;
    if plaintext.len() != AES_KEY_LEN {
        return Err(HandshakeError::MalformedKey);
    }
    let mut key = [0u8; AES_KEY_LEN];
    key.copy_from_slice(&plaintext);
    Ok(key)
}

/// Run the client side of the 4-step exchange against an already-connected
/// `stream`. Bounded by [`HANDSHAKE_DEADLINE`] by the caller.
pub async fn run_client_handshake<S>(stream: &mut S, identity: &Identity) -> Result<HandshakeOutcome, HandshakeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut framer = Framer::new(FrameMode::Handshake);

    // Step 1: client -> server hello.
    write_handshake_record(stream, &hello_record(identity)?).await?;
    // Step 2: server -> client hello.
    let server_hello = read_handshake_record(stream, &mut framer).await?;
    let (peer_username, peer_colour, peer_public_key) = parse_hello(server_hello)?;

    // Step 3: client -> server SendAESKey.
    write_handshake_record(stream, &send_aes_key_record(identity, &peer_public_key)?).await?;
    // Step 4: server -> client SendAESKey.
    let server_key_record = read_handshake_record(stream, &mut framer).await?;
    let peer_aes_key = receive_aes_key_record(server_key_record, &identity.rsa.private, &peer_public_key)?;

    debug!(server = %peer_username, "client handshake complete");
    Ok(HandshakeOutcome { peer_username, peer_colour, peer_public_key, peer_aes_key })
}

/// Run the server side of the 4-step exchange against a freshly accepted
/// `stream`, bounded by [`HANDSHAKE_DEADLINE`].
pub async fn run_server_handshake<S>(stream: &mut S, identity: &Identity) -> Result<HandshakeOutcome, HandshakeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut framer = Framer::new(FrameMode::Handshake);

    // Step 1: client -> server hello.
    let client_hello = read_handshake_record(stream, &mut framer).await?;
    let (peer_username, peer_colour, peer_public_key) = parse_hello(client_hello)?;

    // Step 2: server -> client hello.
    write_handshake_record(stream, &hello_record(identity)?).await?;

    // Step 3: client -> server SendAESKey.
    let client_key_record = read_handshake_record(stream, &mut framer).await?;
    let peer_aes_key = receive_aes_key_record(client_key_record, &identity.rsa.private, &peer_public_key)?;

    // Step 4: server -> client SendAESKey.
    write_handshake_record(stream, &send_aes_key_record(identity, &peer_public_key)?).await?;

    debug!(client = %peer_username, "server handshake complete");
    Ok(HandshakeOutcome { peer_username, peer_colour, peer_public_key, peer_aes_key })
}

/// Run the server handshake with the wall-clock deadline from spec.md §4.3.
pub async fn run_server_handshake_with_deadline<S>(
    stream: &mut S,
    identity: &Identity,
) -> Result<HandshakeOutcome, HandshakeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match timeout(HANDSHAKE_DEADLINE, run_server_handshake(stream, identity)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("handshake exceeded {:?} deadline", HANDSHAKE_DEADLINE);
            Err(HandshakeError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(username: &str, colour: &str) -> Identity {
        Identity {
            username: username.to_string(),
            colour: colour.to_string(),
            rsa: crypto::RsaKeyPair::generate().unwrap(),
            own_aes_key: crypto::generate_aes_key(),
        }
    }

    #[tokio::test]
    async fn client_and_server_handshake_agree_on_keys() {
        let (mut client_sock, mut server_sock) = tokio::io::duplex(64 * 1024);
        let client_identity = identity("alice", "red");
        let server_identity = identity("server", "white");

        let client_aes = client_identity.own_aes_key;
        let server_aes = server_identity.own_aes_key;

        let server_task = tokio::spawn(async move {
            run_server_handshake(&mut server_sock, &server_identity).await.unwrap()
        });
        let client_outcome = run_client_handshake(&mut client_sock, &client_identity).await.unwrap();
        let server_outcome = server_task.await.unwrap();

        assert_eq!(client_outcome.peer_username, "server");
        assert_eq!(server_outcome.peer_username, "alice");
        assert_eq!(client_outcome.peer_aes_key, server_aes);
        assert_eq!(server_outcome.peer_aes_key, client_aes);
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        // Build a SendAESKey record signed by the wrong key and confirm
        // receive_aes_key_record refuses it (invariant 3, spec.md §8).
        let real = identity("alice", "red");
        let impostor = crypto::RsaKeyPair::generate().unwrap();
        let data = crypto::rsa_encrypt(&real.rsa.public, &real.own_aes_key).unwrap();
        let sig = crypto::rsa_sign(&impostor.private, &real.own_aes_key).unwrap();
        let record = Record::Aes(AesRecord { data, sig, timestamp: Utc::now() });
        // `real.rsa.public` is the key exchanged in steps 1/2 as the claimed
        // sender's identity; the signature was made with a different key.
        let result = receive_aes_key_record(record, &real.rsa.private, &real.rsa.public);
        assert!(matches!(result, Err(HandshakeError::SignatureInvalid)));
    }
}

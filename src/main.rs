//! Binary entry point: CLI parsing, logging setup, and wiring between the
//! core library and a real TCP listener/socket. No protocol logic lives
//! here (spec.md §1).
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatterbox_hub::admission;
use chatterbox_hub::connection;
use chatterbox_hub::crypto::{self, RsaKeyPair};
use chatterbox_hub::handshake::{self, Identity};
use chatterbox_hub::hub::Hub;
use chatterbox_hub::{InboundEvent, OutboundCommand};

mod config;
use config::{ClientArgs, Cli, Command, HostArgs, ServerArgs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Connect(args) => connect(args).await,
        Command::Host(args) => host(args).await,
    }
}

fn build_hub(args: &ServerArgs) -> Result<Arc<Hub>> {
    args.validate()?;
    let rsa = RsaKeyPair::generate().context("generating server RSA keypair")?;
    Ok(Arc::new(Hub::new(rsa, args.server_name.clone(), args.max_connections)))
}

async fn bind_listener(bind: std::net::IpAddr, port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::new(bind, port);
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding listener on {addr}"))?;
    info!(%addr, "listening");
    Ok(listener)
}

async fn serve(args: ServerArgs) -> Result<()> {
    let hub = build_hub(&args)?;
    let listener = bind_listener(args.bind, args.port).await?;
    admission::accept_loop(listener, hub).await;
    Ok(())
}

/// Connect to `server_addr`, run the client handshake, and spawn a
/// [`connection::run_client_peer`] task wired to fresh event/command
/// channels. `host_hub` is `Some` only when this client is co-located with
/// its own server (the `host` subcommand).
async fn connect_and_spawn(
    server_addr: SocketAddr,
    username: String,
    colour: String,
    host_hub: Option<Arc<Hub>>,
) -> Result<(tokio::task::JoinHandle<()>, mpsc::UnboundedReceiver<InboundEvent>)> {
    let mut stream = TcpStream::connect(server_addr).await.with_context(|| format!("connecting to {server_addr}"))?;

    let own_aes_key = crypto::generate_aes_key();
    let identity = Identity {
        username: username.clone(),
        colour: colour.clone(),
        rsa: RsaKeyPair::generate().context("generating client RSA keypair")?,
        own_aes_key,
    };
    let outcome = handshake::run_client_handshake(&mut stream, &identity).await.context("handshake with server failed")?;
    info!(server = %outcome.peer_username, username = %username, "connected");

    let (_outbound_tx, outbound_rx): (mpsc::UnboundedSender<OutboundCommand>, _) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let worker = tokio::spawn(connection::run_client_peer(
        stream,
        own_aes_key,
        outcome.peer_aes_key,
        username,
        colour,
        outbound_rx,
        events_tx,
        host_hub,
    ));

    Ok((worker, events_rx))
}

async fn connect(args: ClientArgs) -> Result<()> {
    let server_addr = SocketAddr::new(args.server, args.port);
    let (worker, mut events_rx) = connect_and_spawn(server_addr, args.username, args.colour, None).await?;

    while let Some(event) = events_rx.recv().await {
        log_inbound_event(event);
    }
    let _ = worker.await;
    Ok(())
}

async fn host(args: HostArgs) -> Result<()> {
    let hub = build_hub(&args.server)?;
    let listener = bind_listener(args.server.bind, args.server.port).await?;
    let accept_hub = hub.clone();
    tokio::spawn(async move { admission::accept_loop(listener, accept_hub).await });

    let loopback = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), args.server.port);
    let (worker, mut events_rx) = connect_and_spawn(loopback, args.username.clone(), args.colour, Some(hub.clone())).await?;
    hub.set_host_user(Some(args.username));

    while let Some(event) = events_rx.recv().await {
        log_inbound_event(event);
    }
    let _ = worker.await;
    Ok(())
}

/// The interactive terminal UI is out of scope (spec.md §1); this just
/// logs what it would have rendered.
fn log_inbound_event(event: InboundEvent) {
    match event {
        InboundEvent::RenderMessage(bytes) => info!(message = %String::from_utf8_lossy(&bytes), "message"),
        InboundEvent::RenderError(bytes) => warn!(message = %String::from_utf8_lossy(&bytes), "error"),
        InboundEvent::RenderActiveUsers(users) => info!(?users, "active users"),
        InboundEvent::Disconnected => {
            warn!("disconnected");
        }
    }
}

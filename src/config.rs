//! Binary-entry-point configuration (spec.md §1: "CLI argument parsing for
//! the binary entry point ... is ambient wiring ... it lives only in
//! main.rs and never leaks into the core library"). This module is the
//! `clap`-derived surface `main.rs` parses into before touching the library.
use std::net::IpAddr;

use clap::{Args, Parser, Subcommand};

use crate::crypto::RSA_KEY_BITS;

#[derive(Parser, Debug)]
#[command(name = "chatterbox-hub", version, about = "Hybrid-encrypted group chat core")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run as a pure server: accept connections, no local UI.
    Serve(ServerArgs),
    /// Run as a pure client: connect to a remote server.
    Connect(ClientArgs),
    /// Run as a co-located host: a server plus a local client marked as host.
    Host(HostArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to bind the listener on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,
    /// Port to bind the listener on.
    #[arg(long, default_value_t = 7878)]
    pub port: u16,
    /// Name this server presents to peers during the handshake.
    #[arg(long, default_value = "server")]
    pub server_name: String,
    /// Maximum number of simultaneously admitted connections.
    #[arg(long, default_value_t = 64)]
    pub max_connections: usize,
    /// RSA modulus size in bits; only 2048 is supported (spec.md §6).
    #[arg(long, default_value_t = RSA_KEY_BITS)]
    pub rsa_key_bits: usize,
}

impl ServerArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rsa_key_bits != RSA_KEY_BITS {
            anyhow::bail!("unsupported rsa_key_bits {} (only {} is supported)", self.rsa_key_bits, RSA_KEY_BITS);
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Remote server address to connect to.
    #[arg(long)]
    pub server: IpAddr,
    /// Remote server port.
    #[arg(long, default_value_t = 7878)]
    pub port: u16,
    /// This client's chosen username.
    #[arg(long)]
    pub username: String,
    /// This client's chosen display colour.
    #[arg(long, default_value = "white")]
    pub colour: String,
}

#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    /// Username the co-located local client connects as (marked "(host)").
    #[arg(long)]
    pub username: String,
    /// Display colour for the co-located local client.
    #[arg(long, default_value = "white")]
    pub colour: String,
}

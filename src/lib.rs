//! Core wire/transport subsystem for a self-hosted, hybrid-encrypted group
//! chat service: framing, the RSA/AES handshake, fragment reassembly, and a
//! concurrent-safe broadcast hub. The interactive UI, configuration file
//! I/O, and command language are out of scope and modeled only as the
//! channel-carried [`events::InboundEvent`]/[`events::OutboundCommand`]
//! pair; CLI argument parsing for the binary entry point lives in `main.rs`.
pub mod admission;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod framer;
pub mod handshake;
pub mod hub;

pub use error::{CodecError, FramerError, HandshakeError, HubError};
pub use events::{InboundEvent, OutboundCommand};
pub use hub::Hub;

//! External interfaces (spec.md §6): the two channel-carried enums a
//! connection worker exchanges with whatever renders/drives it. Neither
//! endpoint here is implemented against a concrete UI.
use tokio::sync::mpsc;

/// Events a connection worker pushes outward for rendering.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    RenderMessage(Vec<u8>),
    RenderError(Vec<u8>),
    RenderActiveUsers(Vec<String>),
    Disconnected,
}

/// Commands a UI/driver pushes inward for a connection worker to act on.
#[derive(Debug, Clone)]
pub enum OutboundCommand {
    SendMessage(Vec<u8>),
    SendWhisper(Vec<u8>),
    RequestDisconnect,
    Kick(String),
    Ban(String),
}

pub type InboundSender = mpsc::UnboundedSender<InboundEvent>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundEvent>;
pub type OutboundSender = mpsc::UnboundedSender<OutboundCommand>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundCommand>;

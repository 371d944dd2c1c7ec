//! Link plumbing shared by agent and client connections.
//!
//! Each socket is bridged onto a pair of bounded channels. Exactly one pump
//! task per socket drains the outbound queue, which is what serializes JSON
//! control frames and binary data frames on the shared transport — no two
//! writers ever touch the wire concurrently.

use tokio::sync::mpsc;

use super::protocol::ControlMessage;

/// Frames read off a link's socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Frames queued for a link's socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Control(ControlMessage),
    Data(Vec<u8>),
}

pub type OutboundSender = mpsc::Sender<Outbound>;

/// Queue depth per link. Senders back off when a peer stops draining, which
/// bounds memory without buffering terminal output in the hub.
pub const LINK_BUFFER: usize = 64;

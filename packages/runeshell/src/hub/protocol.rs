//! Control message schema.
//!
//! JSON messages spoken on every link, tagged by a `type` field. The same
//! union covers all three directions (client↔hub, hub↔agent); each end
//! ignores types it does not handle, so new message types can be added
//! without breaking older peers.

use serde::{Deserialize, Serialize};

/// On-wire error and denial codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    BadVersion,
    NotAuthorized,
    AgentOffline,
    /// Reserved for a connect-time single-writer policy; never emitted today.
    Busy,
    Locked,
    AnotherWriter,
    AttachFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client→hub to open a session, hub→agent to request a local attach.
    /// The first message on a client link must be this, carrying the
    /// protocol version (and, in tailnet mode, the target agent).
    Attach {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "is_zero")]
        protocol_version: u8,
    },
    /// Hub→client handshake confirmation.
    Attached { write: bool, status: String },
    Detach {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Resize {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    /// Client→hub: designate the input target session (protocol 2).
    Active {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Client→hub: `state` is "on" or "off"; anything else is a no-op.
    Focus {
        #[serde(default)]
        state: String,
    },
    RequestWrite,
    ReleaseWrite,
    /// Hub→client: whether this client currently holds the writer slot.
    WriteStatus { write: bool },
    WriteDenied { code: ErrorCode, message: String },
    /// Hub→agent: ask for the current session list.
    ListSessions { request_id: String },
    /// Agent→hub reply, correlated by `request_id`.
    Sessions {
        #[serde(default)]
        request_id: String,
        #[serde(default)]
        sessions: Vec<String>,
    },
    /// Hub→client broadcast of the agent's session list.
    SessionsSync { sessions: Vec<String> },
    Heartbeat,
    Error { code: ErrorCode, message: String },
    /// Catch-all for types this build does not know.
    #[serde(other)]
    Unknown,
}

fn is_zero(v: &u8) -> bool {
    *v == 0
}

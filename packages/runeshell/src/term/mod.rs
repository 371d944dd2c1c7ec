//! Terminal session seams.
//!
//! The agent treats terminal acquisition as opaque: a [`SessionManager`]
//! yields byte-stream sessions addressed by name, and the agent only ever
//! writes input, resizes, and drains output. The tmux-backed implementation
//! lives in [`local`].

pub mod local;

pub use local::LocalSessionManager;

use anyhow::Result;
use tokio::sync::mpsc;

/// Output chunks from an attached session. Bounded, so a stalled hub link
/// applies backpressure to the reader instead of buffering in memory.
pub type OutputReceiver = mpsc::Receiver<Vec<u8>>;

/// Write side of an attached session.
pub trait SessionHandle: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<()>;
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    /// Idempotent; also invoked on agent teardown.
    fn close(&self);
}

/// An attached session: its write handle plus the output stream.
pub struct SessionStreams {
    pub handle: Box<dyn SessionHandle>,
    pub output: OutputReceiver,
}

pub trait SessionManager: Send + Sync {
    /// Attach to (creating if necessary) the named session.
    fn attach(&self, session_id: &str) -> Result<SessionStreams>;

    /// Sessions currently known to the backing terminal server. The default
    /// suits managers that cannot enumerate.
    fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

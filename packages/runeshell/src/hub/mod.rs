//! Terminal multiplexing hub.
//!
//! Bridges agent links (one per terminal-owning process) to any number of
//! client links, with exactly one writer per agent at a time. Terminal
//! output enters at the agent link and fans out to every attached client;
//! client input passes the writer/focus/lock gates before reaching the
//! agent's serialized write side.

pub mod agent_link;
pub mod client_link;
pub mod http;
pub mod link;
pub mod protocol;
pub mod registry;


pub use http::{router, AppState};
pub use registry::Hub;

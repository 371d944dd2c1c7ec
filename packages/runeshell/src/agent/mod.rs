//! Agent process: the hub's wire counterparty.
//!
//! One long-lived outbound WebSocket carries binary output frames
//! (agent→hub) and control/input frames (hub→agent). All writes funnel
//! through a single sender task, so control replies and session output
//! never interleave on the shared socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::hub::link::Outbound;
use crate::hub::protocol::{ControlMessage, ErrorCode};
use crate::term::{SessionHandle, SessionManager, SessionStreams};

/// Frames queued for the hub before senders back off.
const OUTBOUND_BUFFER: usize = 64;

pub struct AgentClient {
    config: AgentConfig,
    manager: Arc<dyn SessionManager>,
}

impl AgentClient {
    pub fn new(config: AgentConfig, manager: Arc<dyn SessionManager>) -> Self {
        Self { config, manager }
    }

    /// Connect to the hub and serve until the link drops or `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let url = format!(
            "{}?agent_id={}&agent_secret={}",
            self.config.hub_url, self.config.agent_id, self.config.agent_secret
        );
        let (socket, _) = tokio_tungstenite::connect_async(&url)
            .await
            .with_context(|| format!("connecting to {}", self.config.hub_url))?;
        info!(agent = %self.config.agent_id, "connected to hub");
        let (mut sink, mut stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
        let sender_task = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                let message = match outbound {
                    Outbound::Control(msg) => match serde_json::to_string(&msg) {
                        Ok(json) => tungstenite::Message::Text(json.into()),
                        Err(err) => {
                            warn!(error = %err, "failed to serialize control reply");
                            continue;
                        }
                    },
                    Outbound::Data(bytes) => tungstenite::Message::Binary(bytes.into()),
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut sessions = SessionTable::new(outbound_tx.clone());
        let result = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                message = stream.next() => message,
            };
            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(err)) => break Err(anyhow!(err).context("reading from hub")),
                None => break Err(anyhow!("hub closed the connection")),
            };
            match message {
                tungstenite::Message::Text(text) => {
                    self.handle_control(&text, &mut sessions).await;
                }
                tungstenite::Message::Binary(frame) => sessions.route_input(&frame),
                tungstenite::Message::Close(_) => break Err(anyhow!("hub closed the connection")),
                _ => {}
            }
        };

        sessions.close_all();
        drop(outbound_tx);
        sender_task.abort();
        result
    }

    /// Reconnect loop with a fixed delay; returns only when cancelled.
    pub async fn run_with_retry(&self, cancel: CancellationToken) {
        let retry = if self.config.retry.is_zero() {
            Duration::from_secs(2)
        } else {
            self.config.retry
        };
        loop {
            match self.run(&cancel).await {
                Ok(()) => return,
                Err(err) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    warn!(error = %err, "agent disconnected, retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    async fn handle_control(&self, text: &str, sessions: &mut SessionTable) {
        let Ok(msg) = serde_json::from_str::<ControlMessage>(text) else {
            return;
        };
        match msg {
            ControlMessage::Attach { session_id, .. } => {
                let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
                    return;
                };
                if let Err(err) = sessions.attach(self.manager.as_ref(), &session_id) {
                    warn!(session = %session_id, error = %err, "attach failed");
                    sessions
                        .send_control(ControlMessage::Error {
                            code: ErrorCode::AttachFailed,
                            message: err.to_string(),
                        })
                        .await;
                }
            }
            ControlMessage::Detach { session_id } => {
                if let Some(session_id) = session_id.filter(|s| !s.is_empty()) {
                    sessions.detach(&session_id);
                }
            }
            ControlMessage::Resize { session_id, cols, rows } => {
                if let Some(session_id) = session_id.filter(|s| !s.is_empty()) {
                    sessions.resize(&session_id, cols, rows);
                }
            }
            ControlMessage::ListSessions { request_id } => {
                let list = self.manager.list_sessions().unwrap_or_default();
                sessions
                    .send_control(ControlMessage::Sessions {
                        request_id,
                        sessions: list,
                    })
                    .await;
            }
            // Heartbeats and anything newer than this build are fine to drop.
            _ => {}
        }
    }
}

struct ActiveSession {
    handle: Box<dyn SessionHandle>,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Sessions this agent currently has attached, keyed by session id.
struct SessionTable {
    sessions: HashMap<String, ActiveSession>,
    outbound: mpsc::Sender<Outbound>,
}

impl SessionTable {
    fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            sessions: HashMap::new(),
            outbound,
        }
    }

    async fn send_control(&self, msg: ControlMessage) {
        let _ = self.outbound.send(Outbound::Control(msg)).await;
    }

    /// Attach the named session and start forwarding its output as frames.
    /// Already-attached sessions are left alone.
    fn attach(&mut self, manager: &dyn SessionManager, session_id: &str) -> Result<()> {
        if self.sessions.contains_key(session_id) {
            return Ok(());
        }
        let SessionStreams { handle, mut output } = manager.attach(session_id)?;
        let outbound = self.outbound.clone();
        let forward_session = session_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                let Ok(frame) = mux_frame::encode(&forward_session, &chunk) else {
                    continue;
                };
                if outbound.send(Outbound::Data(frame)).await.is_err() {
                    break;
                }
            }
        });
        self.sessions
            .insert(session_id.to_string(), ActiveSession { handle, forwarder });
        Ok(())
    }

    fn detach(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            debug!(session = session_id, "detaching");
            session.forwarder.abort();
            session.handle.close();
        }
    }

    fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        if let Some(session) = self.sessions.get(session_id) {
            if let Err(err) = session.handle.resize(cols, rows) {
                warn!(session = session_id, error = %err, "resize failed");
            }
        }
    }

    /// Route a framed input payload to its session; unknown sessions and
    /// undecodable frames are dropped.
    fn route_input(&self, frame: &[u8]) {
        let Ok((session_id, payload)) = mux_frame::decode(frame) else {
            return;
        };
        if let Some(session) = self.sessions.get(session_id) {
            if let Err(err) = session.handle.write(payload) {
                warn!(session = session_id, error = %err, "input write failed");
            }
        }
    }

    fn close_all(&mut self) {
        for (session_id, session) in self.sessions.drain() {
            debug!(session = %session_id, "closing session");
            session.forwarder.abort();
            session.handle.close();
        }
    }
}

//! Hub registry.
//!
//! Process-wide index of connected agents and their clients. Owns writer
//! arbitration, the web-writable lock, session-sync round-trips, and the
//! pending-request table. Every mutation is a short critical section under
//! the registry lock; fan-out I/O always happens on snapshots taken inside
//! the lock and used outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::link::{Outbound, OutboundSender};
use super::protocol::ControlMessage;

/// How long a session-sync round-trip may take before it is discarded.
pub const SESSION_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// A client attached to an agent, as stored in the registry.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: String,
    pub tx: OutboundSender,
    pub protocol_version: u8,
    /// Session pinned by authorization; empty when the claim does not pin one.
    pub claim_session: String,
    /// Cancelling this tears the client's link down.
    pub cancel: CancellationToken,
}

struct AgentEntry {
    tx: OutboundSender,
    cancel: CancellationToken,
    clients: HashMap<String, ClientHandle>,
    writer: Option<String>,
    web_writable: bool,
    /// Session id most recently bound by an attaching client; gates lock
    /// targeting so an admin cannot flip the lock for a stale session.
    active_session_hint: String,
}

/// The process-wide broker state.
pub struct Hub {
    agents: RwLock<HashMap<String, AgentEntry>>,
    pending_sessions: Mutex<HashMap<String, mpsc::Sender<Vec<String>>>>,
    request_counter: AtomicU64,
    client_counter: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            pending_sessions: Mutex::new(HashMap::new()),
            request_counter: AtomicU64::new(0),
            client_counter: AtomicU64::new(0),
        }
    }

    /// Register an agent link, last-writer-wins. A replaced link is
    /// cancelled and every client attached to it is evicted.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        tx: OutboundSender,
        cancel: CancellationToken,
    ) {
        let prior = {
            let mut agents = self.agents.write().await;
            agents.insert(
                agent_id.to_string(),
                AgentEntry {
                    tx,
                    cancel,
                    clients: HashMap::new(),
                    writer: None,
                    web_writable: true,
                    active_session_hint: String::new(),
                },
            )
        };
        if let Some(prior) = prior {
            info!(agent = agent_id, "replacing existing agent link");
            prior.cancel.cancel();
            for client in prior.clients.values() {
                client.cancel.cancel();
            }
        }
    }

    /// Remove the agent record if `tx` is still its current link, evicting
    /// any attached clients. A stale link (already replaced) is a no-op.
    pub async fn unregister_agent(&self, agent_id: &str, tx: &OutboundSender) {
        let removed = {
            let mut agents = self.agents.write().await;
            match agents.get(agent_id) {
                Some(entry) if entry.tx.same_channel(tx) => agents.remove(agent_id),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            for client in entry.clients.values() {
                client.cancel.cancel();
            }
        }
    }

    /// The current link to an agent, if it is connected.
    pub async fn agent_tx(&self, agent_id: &str) -> Option<OutboundSender> {
        self.agents.read().await.get(agent_id).map(|entry| entry.tx.clone())
    }

    /// Store a client under its agent. Fails when the agent disconnected
    /// between lookup and registration.
    pub async fn add_client(&self, agent_id: &str, client: ClientHandle) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(entry) => {
                entry.clients.insert(client.id.clone(), client);
                true
            }
            None => false,
        }
    }

    /// Drop a client record. Returns true when the client held the writer
    /// slot, which is then cleared.
    pub async fn remove_client(&self, agent_id: &str, client_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(agent_id) else {
            return false;
        };
        entry.clients.remove(client_id);
        if entry.writer.as_deref() == Some(client_id) {
            entry.writer = None;
            return true;
        }
        false
    }

    /// Copy of the agent's client set, for fan-out outside the lock.
    pub async fn client_snapshot(&self, agent_id: &str) -> Vec<ClientHandle> {
        let agents = self.agents.read().await;
        match agents.get(agent_id) {
            Some(entry) => entry.clients.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn set_active_session_hint(&self, agent_id: &str, session_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.active_session_hint = session_id.to_string();
        }
    }

    pub fn next_client_id(&self) -> String {
        format!("c-{}", self.client_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub async fn is_writer(&self, agent_id: &str, client_id: &str) -> bool {
        let agents = self.agents.read().await;
        match agents.get(agent_id) {
            Some(entry) => !client_id.is_empty() && entry.writer.as_deref() == Some(client_id),
            None => false,
        }
    }

    pub async fn has_writer(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().await;
        agents.get(agent_id).is_some_and(|entry| entry.writer.is_some())
    }

    pub async fn set_writer(&self, agent_id: &str, client_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.writer = Some(client_id.to_string());
        }
    }

    pub async fn clear_writer(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.writer = None;
        }
    }

    async fn writer_of(&self, agent_id: &str) -> Option<String> {
        let agents = self.agents.read().await;
        agents.get(agent_id).and_then(|entry| entry.writer.clone())
    }

    /// Whether web clients may currently hold the writer slot at all.
    pub async fn web_writable(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().await;
        agents.get(agent_id).is_some_and(|entry| entry.web_writable)
    }

    /// Flip the web-writable lock. Applies only when the agent exists and
    /// the session hint is unset or matches `session_id`; returns whether
    /// the change was applied.
    pub async fn set_web_writable(&self, agent_id: &str, session_id: &str, enabled: bool) -> bool {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(agent_id) else {
            return false;
        };
        if !entry.active_session_hint.is_empty() && entry.active_session_hint != session_id {
            return false;
        }
        entry.web_writable = enabled;
        true
    }

    /// Tell every client of `agent_id` whether it is the writer.
    pub async fn broadcast_write_status(&self, agent_id: &str) {
        let clients = self.client_snapshot(agent_id).await;
        if clients.is_empty() {
            return;
        }
        let writer = self.writer_of(agent_id).await;
        for client in clients {
            let write = writer.as_deref() == Some(client.id.as_str());
            let _ = client
                .tx
                .send(Outbound::Control(ControlMessage::WriteStatus { write }))
                .await;
        }
    }

    /// One session-sync round-trip: ask the agent, then fan the reply out to
    /// every attached client. Timeouts and offline agents are discarded —
    /// the missing `sessions_sync` is itself the signal.
    pub async fn sync_sessions(&self, agent_id: &str) {
        let Some(sessions) = self.request_sessions(agent_id).await else {
            return;
        };
        let clients = self.client_snapshot(agent_id).await;
        for client in clients {
            let _ = client
                .tx
                .send(Outbound::Control(ControlMessage::SessionsSync {
                    sessions: sessions.clone(),
                }))
                .await;
        }
    }

    /// Ask the agent for its session list and wait for the correlated
    /// reply. Concurrent requests for the same agent are fine — each gets a
    /// distinct `request_id` routed through the pending table.
    pub async fn request_sessions(&self, agent_id: &str) -> Option<Vec<String>> {
        let agent = self.agent_tx(agent_id).await?;
        let request_id = format!("req-{}", self.request_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.pending_sessions
            .lock()
            .await
            .insert(request_id.clone(), reply_tx);

        let _ = agent
            .send(Outbound::Control(ControlMessage::ListSessions {
                request_id: request_id.clone(),
            }))
            .await;
        let result = tokio::time::timeout(SESSION_SYNC_TIMEOUT, reply_rx.recv()).await;
        self.pending_sessions.lock().await.remove(&request_id);
        match result {
            Ok(Some(sessions)) => Some(sessions),
            Ok(None) => None,
            Err(_) => {
                debug!(agent = agent_id, request = %request_id, "session sync timed out");
                None
            }
        }
    }

    /// Route an agent's `sessions` reply to its waiting request, if any.
    /// Non-blocking: a missing or already-filled slot drops the reply.
    pub async fn deliver_sessions(&self, request_id: &str, sessions: Vec<String>) {
        let reply_tx = self.pending_sessions.lock().await.get(request_id).cloned();
        if let Some(reply_tx) = reply_tx {
            let _ = reply_tx.try_send(sessions);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_link() -> (OutboundSender, mpsc::Receiver<Outbound>, CancellationToken) {
        let (tx, rx) = mpsc::channel(8);
        (tx, rx, CancellationToken::new())
    }

    fn test_client(hub: &Hub, tx: OutboundSender) -> ClientHandle {
        ClientHandle {
            id: hub.next_client_id(),
            tx,
            protocol_version: 1,
            claim_session: "ai".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn client_ids_are_monotonic() {
        let hub = Hub::new();
        assert_eq!(hub.next_client_id(), "c-1");
        assert_eq!(hub.next_client_id(), "c-2");
    }

    #[tokio::test]
    async fn writer_slot_is_exclusive() {
        let hub = Hub::new();
        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx.clone(), cancel).await;

        assert!(!hub.has_writer("agent1").await);
        hub.set_writer("agent1", "c-1").await;
        assert!(hub.has_writer("agent1").await);
        assert!(hub.is_writer("agent1", "c-1").await);
        assert!(!hub.is_writer("agent1", "c-2").await);

        hub.clear_writer("agent1").await;
        assert!(!hub.has_writer("agent1").await);
    }

    #[tokio::test]
    async fn is_writer_never_matches_empty_id() {
        let hub = Hub::new();
        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;
        assert!(!hub.is_writer("agent1", "").await);
    }

    #[tokio::test]
    async fn removing_the_writer_clears_the_slot() {
        let hub = Hub::new();
        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;
        let (ctx, _crx, _) = test_link();
        let client = test_client(&hub, ctx);
        let client_id = client.id.clone();
        assert!(hub.add_client("agent1", client).await);

        hub.set_writer("agent1", &client_id).await;
        assert!(hub.remove_client("agent1", &client_id).await);
        assert!(!hub.has_writer("agent1").await);
    }

    #[tokio::test]
    async fn removing_a_viewer_leaves_the_writer() {
        let hub = Hub::new();
        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;
        let (c1_tx, _c1_rx, _) = test_link();
        let (c2_tx, _c2_rx, _) = test_link();
        let writer = test_client(&hub, c1_tx);
        let viewer = test_client(&hub, c2_tx);
        let writer_id = writer.id.clone();
        let viewer_id = viewer.id.clone();
        hub.add_client("agent1", writer).await;
        hub.add_client("agent1", viewer).await;
        hub.set_writer("agent1", &writer_id).await;

        assert!(!hub.remove_client("agent1", &viewer_id).await);
        assert!(hub.is_writer("agent1", &writer_id).await);
    }

    #[tokio::test]
    async fn add_client_fails_when_agent_is_gone() {
        let hub = Hub::new();
        let (tx, _rx, _) = test_link();
        assert!(!hub.add_client("ghost", test_client(&hub, tx)).await);
    }

    #[tokio::test]
    async fn replacement_evicts_prior_link_and_clients() {
        let hub = Hub::new();
        let (old_tx, _old_rx, old_cancel) = test_link();
        hub.register_agent("agent1", old_tx, old_cancel.clone()).await;
        let (c_tx, _c_rx, _) = test_link();
        let client = test_client(&hub, c_tx);
        let client_cancel = client.cancel.clone();
        hub.add_client("agent1", client).await;

        let (new_tx, _new_rx, new_cancel) = test_link();
        hub.register_agent("agent1", new_tx, new_cancel).await;

        assert!(old_cancel.is_cancelled());
        assert!(client_cancel.is_cancelled());
        assert!(hub.client_snapshot("agent1").await.is_empty());
    }

    #[tokio::test]
    async fn stale_link_cannot_unregister_its_replacement() {
        let hub = Hub::new();
        let (old_tx, _old_rx, old_cancel) = test_link();
        hub.register_agent("agent1", old_tx.clone(), old_cancel).await;
        let (new_tx, _new_rx, new_cancel) = test_link();
        hub.register_agent("agent1", new_tx.clone(), new_cancel).await;

        hub.unregister_agent("agent1", &old_tx).await;
        assert!(hub.agent_tx("agent1").await.is_some());

        hub.unregister_agent("agent1", &new_tx).await;
        assert!(hub.agent_tx("agent1").await.is_none());
    }

    #[tokio::test]
    async fn unregister_evicts_clients() {
        let hub = Hub::new();
        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx.clone(), cancel).await;
        let (c_tx, _c_rx, _) = test_link();
        let client = test_client(&hub, c_tx);
        let client_cancel = client.cancel.clone();
        hub.add_client("agent1", client).await;

        hub.unregister_agent("agent1", &tx).await;
        assert!(client_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn web_writable_gated_by_session_hint() {
        let hub = Hub::new();
        assert!(!hub.set_web_writable("ghost", "ai", false).await);

        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;

        // No hint yet: any session id applies.
        assert!(hub.set_web_writable("agent1", "anything", false).await);
        assert!(!hub.web_writable("agent1").await);

        hub.set_active_session_hint("agent1", "ai").await;
        assert!(!hub.set_web_writable("agent1", "ops", true).await);
        assert!(!hub.web_writable("agent1").await);
        assert!(hub.set_web_writable("agent1", "ai", true).await);
        assert!(hub.web_writable("agent1").await);
    }

    #[tokio::test]
    async fn broadcast_write_status_marks_only_the_writer() {
        let hub = Hub::new();
        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;
        let (c1_tx, mut c1_rx, _) = test_link();
        let (c2_tx, mut c2_rx, _) = test_link();
        let c1 = test_client(&hub, c1_tx);
        let c2 = test_client(&hub, c2_tx);
        let c1_id = c1.id.clone();
        hub.add_client("agent1", c1).await;
        hub.add_client("agent1", c2).await;

        hub.set_writer("agent1", &c1_id).await;
        hub.broadcast_write_status("agent1").await;

        assert_eq!(
            c1_rx.recv().await,
            Some(Outbound::Control(ControlMessage::WriteStatus { write: true }))
        );
        assert_eq!(
            c2_rx.recv().await,
            Some(Outbound::Control(ControlMessage::WriteStatus { write: false }))
        );
    }

    #[tokio::test]
    async fn deliver_to_unknown_request_is_dropped() {
        let hub = Hub::new();
        hub.deliver_sessions("req-404", vec!["ai".to_string()]).await;
    }

    #[tokio::test]
    async fn request_sessions_roundtrip() {
        let hub = Hub::new();
        let (tx, mut rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;

        let request = tokio::spawn(async move {
            // The agent side: answer the list_sessions we are about to see.
            match rx.recv().await {
                Some(Outbound::Control(ControlMessage::ListSessions { request_id })) => request_id,
                other => panic!("expected list_sessions, got {:?}", other),
            }
        });

        let hub = std::sync::Arc::new(hub);
        let responder_hub = hub.clone();
        tokio::spawn(async move {
            let request_id = request.await.unwrap();
            responder_hub
                .deliver_sessions(&request_id, vec!["ai".to_string(), "ops".to_string()])
                .await;
        });

        let sessions = hub.request_sessions("agent1").await;
        assert_eq!(sessions, Some(vec!["ai".to_string(), "ops".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn request_sessions_times_out_after_two_seconds() {
        let hub = Hub::new();
        let (tx, _rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;

        let started = tokio::time::Instant::now();
        assert_eq!(hub.request_sessions("agent1").await, None);
        assert_eq!(started.elapsed(), SESSION_SYNC_TIMEOUT);
    }

    #[tokio::test]
    async fn request_sessions_requires_a_connected_agent() {
        let hub = Hub::new();
        assert_eq!(hub.request_sessions("ghost").await, None);
    }

    #[tokio::test]
    async fn concurrent_requests_use_distinct_ids() {
        let hub = std::sync::Arc::new(Hub::new());
        let (tx, mut rx, cancel) = test_link();
        hub.register_agent("agent1", tx, cancel).await;

        let responder_hub = hub.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for reply in ["one", "two"] {
                match rx.recv().await {
                    Some(Outbound::Control(ControlMessage::ListSessions { request_id })) => {
                        assert!(!seen.contains(&request_id));
                        seen.push(request_id.clone());
                        responder_hub
                            .deliver_sessions(&request_id, vec![reply.to_string()])
                            .await;
                    }
                    other => panic!("expected list_sessions, got {:?}", other),
                }
            }
        });

        let first = hub.request_sessions("agent1").await;
        let second = hub.request_sessions("agent1").await;
        assert_eq!(first, Some(vec!["one".to_string()]));
        assert_eq!(second, Some(vec!["two".to_string()]));
    }
}

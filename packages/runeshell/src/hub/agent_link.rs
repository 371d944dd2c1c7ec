//! Hub side of an agent connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::link::{Inbound, Outbound, OutboundSender};
use super::protocol::ControlMessage;
use super::registry::Hub;

/// Serve a registered agent link until its socket closes or the link is
/// replaced.
///
/// Binary frames fan out to the agent's current clients: protocol-1 clients
/// get the bare payload, filtered by their pinned session; protocol-2
/// clients get the framed bytes verbatim. Text frames are parsed as
/// control; only `sessions` replies with a request id are consumed here —
/// everything else from an agent is ignored.
pub async fn run_agent(
    hub: Arc<Hub>,
    agent_id: String,
    tx: OutboundSender,
    mut rx: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
) {
    hub.register_agent(&agent_id, tx.clone(), cancel.clone()).await;
    info!(agent = %agent_id, "agent connected");

    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        match inbound {
            Inbound::Binary(frame) => {
                let (session_id, payload) = match mux_frame::decode(&frame) {
                    Ok(decoded) => decoded,
                    Err(_) => continue,
                };
                let clients = hub.client_snapshot(&agent_id).await;
                if clients.is_empty() {
                    continue;
                }
                let session_id = session_id.to_string();
                let payload = payload.to_vec();
                for client in clients {
                    if client.protocol_version < 2 {
                        if !client.claim_session.is_empty() && client.claim_session != session_id {
                            continue;
                        }
                        let _ = client.tx.send(Outbound::Data(payload.clone())).await;
                    } else {
                        let _ = client.tx.send(Outbound::Data(frame.clone())).await;
                    }
                }
            }
            Inbound::Text(text) => {
                let Ok(msg) = serde_json::from_str::<ControlMessage>(&text) else {
                    continue;
                };
                if let ControlMessage::Sessions { request_id, sessions } = msg {
                    if !request_id.is_empty() {
                        hub.deliver_sessions(&request_id, sessions).await;
                    }
                }
            }
        }
    }

    hub.unregister_agent(&agent_id, &tx).await;
    info!(agent = %agent_id, "agent disconnected");
}

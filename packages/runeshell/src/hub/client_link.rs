//! Hub side of a client connection: handshake, control dispatch, input
//! gating.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::Claims;

use super::link::{Inbound, Outbound, OutboundSender};
use super::protocol::{ControlMessage, ErrorCode};
use super::registry::{ClientHandle, Hub};

async fn send_control(tx: &OutboundSender, msg: ControlMessage) {
    let _ = tx.send(Outbound::Control(msg)).await;
}

async fn send_error(tx: &OutboundSender, code: ErrorCode, message: &str) {
    send_control(
        tx,
        ControlMessage::Error {
            code,
            message: message.to_string(),
        },
    )
    .await;
}

/// Serve a client link from its first message (which must be `attach`) until
/// the socket closes or a protocol violation ends it.
///
/// The handshake reconciles the authorization claims with the attach
/// message: empty claims (tailnet mode) are materialized from the attach
/// with write access implied; otherwise the attach may not name a different
/// agent, and in protocol 1 must name exactly the claimed session.
pub async fn run_client(
    hub: Arc<Hub>,
    mut claims: Claims,
    tx: OutboundSender,
    mut rx: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
) {
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        inbound = rx.recv() => match inbound {
            Some(inbound) => inbound,
            None => return,
        },
    };
    let attach = match first {
        Inbound::Text(text) => serde_json::from_str::<ControlMessage>(&text).ok(),
        Inbound::Binary(_) => None,
    };
    let Some(ControlMessage::Attach { session_id, agent_id, protocol_version }) = attach else {
        send_error(&tx, ErrorCode::BadRequest, "first message must be attach").await;
        return;
    };
    if protocol_version > 2 {
        send_error(&tx, ErrorCode::BadVersion, "unsupported protocol version").await;
        return;
    }
    let proto = if protocol_version == 0 { 1 } else { protocol_version };

    let attach_session = session_id.unwrap_or_default();
    let attach_agent = agent_id.unwrap_or_default();

    if claims.agent_id.is_empty() && claims.session_id.is_empty() {
        // Tailnet mode: authorization did not pin a target, the attach
        // supplies it and write access is implied.
        if attach_agent.is_empty() || attach_session.is_empty() {
            send_error(&tx, ErrorCode::BadRequest, "agent_id and session_id required").await;
            return;
        }
        claims = Claims {
            agent_id: attach_agent.clone(),
            session_id: String::new(),
            write: true,
            expires_at: None,
        };
        if proto < 2 {
            claims.session_id = attach_session.clone();
        }
    }
    if !attach_agent.is_empty() && attach_agent != claims.agent_id {
        send_error(&tx, ErrorCode::NotAuthorized, "agent mismatch").await;
        return;
    }
    if proto < 2 {
        if attach_session != claims.session_id {
            send_error(&tx, ErrorCode::NotAuthorized, "session mismatch").await;
            return;
        }
    } else if !claims.session_id.is_empty() && attach_session != claims.session_id {
        send_error(&tx, ErrorCode::NotAuthorized, "session mismatch").await;
        return;
    }

    let Some(agent) = hub.agent_tx(&claims.agent_id).await else {
        send_error(&tx, ErrorCode::AgentOffline, "agent not connected").await;
        return;
    };

    let client_id = hub.next_client_id();
    let mut claim_session = claims.session_id.clone();
    if proto < 2 && claim_session.is_empty() {
        claim_session = attach_session.clone();
    }
    let handle = ClientHandle {
        id: client_id.clone(),
        tx: tx.clone(),
        protocol_version: proto,
        claim_session,
        cancel: cancel.clone(),
    };
    // The agent may have dropped between lookup and registration; that race
    // surfaces as a second agent_offline rather than widening the lock.
    if !hub.add_client(&claims.agent_id, handle).await {
        send_error(&tx, ErrorCode::AgentOffline, "agent not connected").await;
        return;
    }
    info!(client = %client_id, agent = %claims.agent_id, proto, "client attached");

    hub.set_active_session_hint(&claims.agent_id, &claims.session_id).await;

    let first_session = if attach_session.is_empty() {
        claims.session_id.clone()
    } else {
        attach_session.clone()
    };
    send_control(
        &agent,
        ControlMessage::Attach {
            session_id: Some(first_session.clone()),
            agent_id: None,
            protocol_version: proto,
        },
    )
    .await;
    send_control(
        &tx,
        ControlMessage::Attached {
            write: claims.write,
            status: "ok".to_string(),
        },
    )
    .await;
    let write = hub.is_writer(&claims.agent_id, &client_id).await;
    send_control(&tx, ControlMessage::WriteStatus { write }).await;
    spawn_session_sync(&hub, &claims.agent_id);

    let mut focus_active = true;
    let mut active_session = if claims.session_id.is_empty() {
        first_session
    } else {
        claims.session_id.clone()
    };

    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        match inbound {
            Inbound::Text(text) => {
                let Ok(msg) = serde_json::from_str::<ControlMessage>(&text) else {
                    send_error(&tx, ErrorCode::BadRequest, "invalid json").await;
                    break;
                };
                match msg {
                    ControlMessage::Attach { session_id, .. } => {
                        if proto < 2 {
                            continue;
                        }
                        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
                            send_error(&tx, ErrorCode::BadRequest, "session_id required").await;
                            break;
                        };
                        if !claims.session_id.is_empty() && session_id != claims.session_id {
                            send_error(&tx, ErrorCode::NotAuthorized, "session mismatch").await;
                            break;
                        }
                        send_control(
                            &agent,
                            ControlMessage::Attach {
                                session_id: Some(session_id.clone()),
                                agent_id: None,
                                protocol_version: proto,
                            },
                        )
                        .await;
                        if active_session.is_empty() {
                            active_session = session_id;
                        }
                        spawn_session_sync(&hub, &claims.agent_id);
                    }
                    ControlMessage::Detach { session_id } => {
                        if proto < 2 {
                            continue;
                        }
                        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
                            send_error(&tx, ErrorCode::BadRequest, "session_id required").await;
                            break;
                        };
                        send_control(
                            &agent,
                            ControlMessage::Detach { session_id: Some(session_id) },
                        )
                        .await;
                        spawn_session_sync(&hub, &claims.agent_id);
                    }
                    ControlMessage::Active { session_id } => {
                        if proto < 2 {
                            continue;
                        }
                        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
                            send_error(&tx, ErrorCode::BadRequest, "session_id required").await;
                            break;
                        };
                        active_session = session_id;
                    }
                    ControlMessage::Resize { session_id, cols, rows } => {
                        let mut session_id = session_id.unwrap_or_default();
                        if proto >= 2 && session_id.is_empty() {
                            session_id = active_session.clone();
                        }
                        send_control(
                            &agent,
                            ControlMessage::Resize {
                                session_id: (!session_id.is_empty()).then_some(session_id),
                                cols,
                                rows,
                            },
                        )
                        .await;
                    }
                    ControlMessage::Focus { state } => match state.as_str() {
                        "on" => focus_active = true,
                        "off" => focus_active = false,
                        _ => {}
                    },
                    ControlMessage::RequestWrite => {
                        if !claims.write {
                            send_control(
                                &tx,
                                ControlMessage::WriteDenied {
                                    code: ErrorCode::NotAuthorized,
                                    message: "not authorized for write".to_string(),
                                },
                            )
                            .await;
                        } else if !hub.web_writable(&claims.agent_id).await {
                            send_control(
                                &tx,
                                ControlMessage::WriteDenied {
                                    code: ErrorCode::Locked,
                                    message: "web input locked".to_string(),
                                },
                            )
                            .await;
                        } else if hub.has_writer(&claims.agent_id).await
                            && !hub.is_writer(&claims.agent_id, &client_id).await
                        {
                            send_control(
                                &tx,
                                ControlMessage::WriteDenied {
                                    code: ErrorCode::AnotherWriter,
                                    message: "another writer active".to_string(),
                                },
                            )
                            .await;
                        } else {
                            hub.set_writer(&claims.agent_id, &client_id).await;
                            hub.broadcast_write_status(&claims.agent_id).await;
                        }
                    }
                    ControlMessage::ReleaseWrite => {
                        if hub.is_writer(&claims.agent_id, &client_id).await {
                            hub.clear_writer(&claims.agent_id).await;
                            hub.broadcast_write_status(&claims.agent_id).await;
                        }
                    }
                    ControlMessage::Heartbeat | ControlMessage::Unknown => {}
                    // Server-originated types echoed back by a confused
                    // client are harmless; drop them.
                    _ => {}
                }
            }
            Inbound::Binary(data) => {
                if !claims.write {
                    continue;
                }
                if !focus_active || !hub.web_writable(&claims.agent_id).await {
                    continue;
                }
                if !hub.is_writer(&claims.agent_id, &client_id).await {
                    continue;
                }
                if proto < 2 {
                    let Ok(frame) = mux_frame::encode(&claims.session_id, &data) else {
                        continue;
                    };
                    let _ = agent.send(Outbound::Data(frame)).await;
                    continue;
                }
                let Ok((session_id, payload)) = mux_frame::decode(&data) else {
                    continue;
                };
                if session_id != active_session {
                    debug!(client = %client_id, session = session_id, "dropping input for inactive session");
                    continue;
                }
                let Ok(frame) = mux_frame::encode(session_id, payload) else {
                    continue;
                };
                let _ = agent.send(Outbound::Data(frame)).await;
            }
        }
    }

    let was_writer = hub.remove_client(&claims.agent_id, &client_id).await;
    if was_writer {
        // Remaining viewers must learn the slot is free.
        hub.broadcast_write_status(&claims.agent_id).await;
    }
    info!(client = %client_id, "client disconnected");
}

fn spawn_session_sync(hub: &Arc<Hub>, agent_id: &str) {
    let hub = hub.clone();
    let agent_id = agent_id.to_string();
    tokio::spawn(async move {
        hub.sync_sessions(&agent_id).await;
    });
}

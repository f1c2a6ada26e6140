//! Mesh I/O task -- owns the relay socket and drives the session machine.
//!
//! The session state machine in `fieldlink-mesh` decides what to do; this
//! task does it: dialing, handshaking, heartbeats, the read loop and the
//! fixed reconnect backoff. Inbound broadcasts are normalized into ingest
//! events tagged with the mesh ingress so the merge engine treats them
//! exactly like remote deltas.

use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use fieldlink_api::{IngestRequest, IngestTx};
use fieldlink_mesh::{MeshRoster, MeshSession, MeshStatus, NetMode, SessionAction};
use fieldlink_protocol::codec::MeshFrameCodec;
use fieldlink_protocol::frames::MeshFrame;
use fieldlink_protocol::{GeoPoint, MeshPeerId, CURRENT_PARAMS};
use fieldlink_store::{ChatMessage, IncidentEvent, Ingress, IngressEvent, Notice};

/// Structured payload carried in an emergency broadcast's `content` field.
/// Peers running older builds send plain text, which falls through to a
/// notification-only alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshPayload {
    Incident { incident: IncidentEvent },
    Chat { message: ChatMessage },
    Text { text: String },
}

impl MeshPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshPayload::Incident { .. } => "incident",
            MeshPayload::Chat { .. } => "chat",
            MeshPayload::Text { .. } => "text",
        }
    }

    /// Short human-readable line for the outgoing broadcast log.
    pub fn summary(&self) -> String {
        match self {
            MeshPayload::Incident { incident } => {
                format!("{:?} incident {}", incident.kind, incident.id)
            }
            MeshPayload::Chat { message } => message.payload.content().to_string(),
            MeshPayload::Text { text } => text.clone(),
        }
    }
}

pub struct MeshDeps {
    pub relay_addr: String,
    pub peer_id: MeshPeerId,
    pub own_location: GeoPoint,
    pub simulate_when_unreachable: bool,
    pub roster: MeshRoster,
    pub ingest: IngestTx,
    pub notice_tx: mpsc::Sender<Notice>,
    pub status_tx: watch::Sender<MeshStatus>,
}

enum LinkEnd {
    Shutdown,
    Actions(Vec<SessionAction>),
}

pub async fn run_mesh_task(
    deps: MeshDeps,
    mut outbound_rx: mpsc::Receiver<MeshFrame>,
    mut net_rx: watch::Receiver<NetMode>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut session = MeshSession::new(NetMode::Online, deps.simulate_when_unreachable);
    let backoff = Duration::from_secs(CURRENT_PARAMS.reconnect_backoff_secs);
    let mut reconnect_at: Option<Instant> = None;
    let mut pending: Vec<SessionAction> = session.on_net_change(*net_rx.borrow_and_update());

    loop {
        while let Some(action) = pending.pop() {
            match action {
                SessionAction::Dial => {
                    let _ = deps.status_tx.send(session.status());
                    match dial(&deps.relay_addr).await {
                        Ok(stream) => {
                            session.on_dial_ok();
                            let _ = deps.status_tx.send(session.status());
                            tracing::info!(relay = %deps.relay_addr, "mesh link up");
                            match run_link(
                                stream,
                                &deps,
                                &mut session,
                                &mut outbound_rx,
                                &mut net_rx,
                                &mut shutdown,
                            )
                            .await
                            {
                                LinkEnd::Shutdown => return,
                                LinkEnd::Actions(actions) => pending.extend(actions),
                            }
                        }
                        Err(e) => {
                            tracing::warn!(relay = %deps.relay_addr, error = %e, "mesh dial failed");
                            pending.extend(session.on_dial_failed());
                            let _ = deps.status_tx.send(session.status());
                        }
                    }
                }
                SessionAction::ScheduleReconnect => {
                    reconnect_at = Some(Instant::now() + backoff);
                    let _ = deps.status_tx.send(session.status());
                }
                SessionAction::TearDown => {
                    deps.roster.clear().await;
                    reconnect_at = None;
                    let _ = deps.status_tx.send(session.status());
                    tracing::info!("mesh link stood down");
                }
                SessionAction::StartSimulated => {
                    deps.roster.seed_simulated().await;
                    let _ = deps.status_tx.send(session.status());
                }
            }
        }

        tokio::select! {
            _ = shutdown.recv() => return,
            changed = net_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                pending.extend(session.on_net_change(*net_rx.borrow_and_update()));
            }
            _ = sleep_until_opt(reconnect_at), if reconnect_at.is_some() => {
                reconnect_at = None;
                pending.extend(session.on_reconnect_due());
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { return };
                // No live link here, by construction.
                tracing::debug!(frame = frame.frame_type(), "mesh not live, broadcast dropped");
            }
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn dial(relay_addr: &str) -> std::io::Result<TcpStream> {
    let timeout = Duration::from_secs(CURRENT_PARAMS.dial_timeout_secs);
    match tokio::time::timeout(timeout, TcpStream::connect(relay_addr)).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "relay dial timed out",
        )),
    }
}

async fn send_frame(
    stream: &mut TcpStream,
    codec: &mut MeshFrameCodec,
    frame: MeshFrame,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Pump the established link until it drops, connectivity returns, or the
/// node shuts down.
async fn run_link(
    mut stream: TcpStream,
    deps: &MeshDeps,
    session: &mut MeshSession,
    outbound_rx: &mut mpsc::Receiver<MeshFrame>,
    net_rx: &mut watch::Receiver<NetMode>,
    shutdown: &mut broadcast::Receiver<()>,
) -> LinkEnd {
    let mut codec = MeshFrameCodec;
    let mut read_buf = BytesMut::with_capacity(8 * 1024);

    let handshake = MeshFrame::Handshake {
        peer_id: deps.peer_id.clone(),
        location: deps.own_location,
        timestamp: Utc::now().timestamp_millis(),
    };
    if send_frame(&mut stream, &mut codec, handshake).await.is_err() {
        return LinkEnd::Actions(session.on_link_lost());
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(
        CURRENT_PARAMS.heartbeat_interval_secs,
    ));
    // The first tick fires immediately; the handshake already announced us.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return LinkEnd::Shutdown,
            changed = net_rx.changed() => {
                if changed.is_err() {
                    return LinkEnd::Shutdown;
                }
                let actions = session.on_net_change(*net_rx.borrow_and_update());
                if !actions.is_empty() {
                    return LinkEnd::Actions(actions);
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut stream, &mut codec, MeshFrame::Heartbeat).await.is_err() {
                    return LinkEnd::Actions(session.on_link_lost());
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { return LinkEnd::Shutdown };
                if !session.can_broadcast() {
                    tracing::debug!(frame = frame.frame_type(), "mesh not live, broadcast dropped");
                    continue;
                }
                if send_frame(&mut stream, &mut codec, frame).await.is_err() {
                    return LinkEnd::Actions(session.on_link_lost());
                }
            }
            read = stream.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        tracing::info!("mesh link closed by relay");
                        return LinkEnd::Actions(session.on_link_lost());
                    }
                    Ok(_) => loop {
                        match codec.decode(&mut read_buf) {
                            Ok(Some(frame)) => handle_frame(deps, frame).await,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "mesh frame decode failed, dropping link");
                                return LinkEnd::Actions(session.on_link_lost());
                            }
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "mesh read failed");
                        return LinkEnd::Actions(session.on_link_lost());
                    }
                }
            }
        }
    }
}

async fn handle_frame(deps: &MeshDeps, frame: MeshFrame) {
    match frame {
        MeshFrame::PeerList { peers } => {
            deps.roster
                .apply_peer_list(peers, Some(deps.own_location))
                .await;
        }
        MeshFrame::LocationUpdate { peer_id, location } => {
            deps.roster
                .update_location(&peer_id, location, Some(deps.own_location))
                .await;
        }
        MeshFrame::Heartbeat => tracing::trace!("relay heartbeat"),
        MeshFrame::Handshake { peer_id, .. } => {
            tracing::debug!(%peer_id, "peer handshake observed");
        }
        MeshFrame::ResourceShare { resource } => {
            let body = resource
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| resource.to_string());
            notify(deps, "Resource Shared via Mesh", summarize(&body)).await;
        }
        MeshFrame::EmergencyBroadcast {
            content, sender, ..
        } => {
            if sender == deps.peer_id {
                // Relay floods to every client, including the sender.
                return;
            }
            deliver_broadcast(deps, content, &sender).await;
        }
    }
}

async fn deliver_broadcast(deps: &MeshDeps, content: String, sender: &str) {
    let event = match serde_json::from_str::<MeshPayload>(&content) {
        Ok(MeshPayload::Incident { incident }) => {
            notify(
                deps,
                "Emergency Alert via Mesh",
                format!("{:?} incident reported by {sender}", incident.kind),
            )
            .await;
            Some(IngressEvent::IncidentUpsert {
                incident,
                source: Ingress::Mesh,
            })
        }
        Ok(MeshPayload::Chat { message }) => Some(IngressEvent::ChatArrived {
            message,
            source: Ingress::Mesh,
        }),
        Ok(MeshPayload::Text { text }) => {
            notify(deps, "Emergency Alert via Mesh", summarize(&text)).await;
            None
        }
        Err(_) => {
            // Older peers broadcast bare text.
            notify(deps, "Emergency Alert via Mesh", summarize(&content)).await;
            None
        }
    };

    if let Some(event) = event {
        let _ = deps
            .ingest
            .send(IngestRequest { event, reply: None })
            .await;
    }
}

async fn notify(deps: &MeshDeps, title: &str, body: String) {
    let _ = deps
        .notice_tx
        .send(Notice {
            title: title.to_string(),
            body,
            at: Utc::now(),
        })
        .await;
}

fn summarize(text: &str) -> String {
    const MAX: usize = 140;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    }
}

//! Remote Store seam -- the cloud document store behind a narrow trait.
//!
//! The node only needs two things from the cloud: a subscription stream of
//! incident/chat documents and a write-behind path for local mutations.
//! `InMemoryRemote` implements the same contract in-process; integration
//! tests use it as the shared "cloud" between nodes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use fieldlink_store::{is_provisional, ChatMessage, IncidentEvent, Ingress, IngressEvent};
use fieldlink_protocol::IncidentId;
use tokio::sync::{broadcast, mpsc, Mutex};

use fieldlink_api::{IngestRequest, IngestTx};

/// A document pushed down the subscription stream.
#[derive(Debug, Clone)]
pub enum RemoteDoc {
    Incident(IncidentEvent),
    Chat(ChatMessage),
    Deleted { id: IncidentId },
    MediaRemoved { incident_id: IncidentId, path: String },
}

/// A local mutation written behind to the cloud.
#[derive(Debug, Clone)]
pub enum RemoteWrite {
    UpsertIncident(IncidentEvent),
    AppendChat(ChatMessage),
    TombstoneIncident { id: IncidentId },
    RemoveMedia { incident_id: IncidentId, path: String },
}

#[derive(Debug, Clone, Default)]
pub struct RemoteAck {
    /// Server-issued id when an incident was created under a provisional one.
    pub assigned_id: Option<IncidentId>,
}

pub trait RemoteSyncChannel: Clone + Send + Sync + 'static {
    /// Open the document stream: a snapshot of current state followed by
    /// live updates.
    fn subscribe(&self) -> impl Future<Output = mpsc::Receiver<RemoteDoc>> + Send;

    /// Write one local mutation. Errors are retried by the caller.
    fn write(&self, op: RemoteWrite) -> impl Future<Output = anyhow::Result<RemoteAck>> + Send;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct RemoteState {
    incidents: HashMap<IncidentId, IncidentEvent>,
    chats: Vec<ChatMessage>,
    /// Provisional id -> server-issued id, from past creates.
    aliases: HashMap<IncidentId, IncidentId>,
    subscribers: Vec<mpsc::Sender<RemoteDoc>>,
    next_id: u64,
    unreachable: bool,
}

/// In-process Remote Store. Every subscribed node sees every accepted write,
/// including an echo of its own.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
    inner: Arc<Mutex<RemoteState>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, as a severed uplink would.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().await.unreachable = unreachable;
    }

    pub async fn incident_count(&self) -> usize {
        self.inner.lock().await.incidents.len()
    }

    pub async fn incident(&self, id: &str) -> Option<IncidentEvent> {
        self.inner.lock().await.incidents.get(id).cloned()
    }

    async fn publish(state: &mut RemoteState, doc: RemoteDoc) {
        state.subscribers.retain(|sub| !sub.is_closed());
        for sub in &state.subscribers {
            let _ = sub.send(doc.clone()).await;
        }
    }
}

impl RemoteSyncChannel for InMemoryRemote {
    async fn subscribe(&self) -> mpsc::Receiver<RemoteDoc> {
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.inner.lock().await;
        for incident in state.incidents.values() {
            let _ = tx.send(RemoteDoc::Incident(incident.clone())).await;
        }
        for chat in &state.chats {
            let _ = tx.send(RemoteDoc::Chat(chat.clone())).await;
        }
        state.subscribers.push(tx);
        rx
    }

    async fn write(&self, op: RemoteWrite) -> anyhow::Result<RemoteAck> {
        let mut state = self.inner.lock().await;
        if state.unreachable {
            anyhow::bail!("remote store unreachable");
        }

        match op {
            RemoteWrite::UpsertIncident(mut incident) => {
                let mut ack = RemoteAck::default();
                if let Some(server_id) = state.aliases.get(&incident.id) {
                    incident.id = server_id.clone();
                } else if is_provisional(&incident.id) {
                    state.next_id += 1;
                    let server_id = format!("srv-{}", state.next_id);
                    state
                        .aliases
                        .insert(incident.id.clone(), server_id.clone());
                    incident.id = server_id.clone();
                    ack.assigned_id = Some(server_id);
                }

                let keep = match state.incidents.get(&incident.id) {
                    Some(existing) if existing.updated_at > incident.updated_at => existing.clone(),
                    _ => {
                        state
                            .incidents
                            .insert(incident.id.clone(), incident.clone());
                        incident
                    }
                };
                Self::publish(&mut state, RemoteDoc::Incident(keep)).await;
                Ok(ack)
            }
            RemoteWrite::AppendChat(mut chat) => {
                if let Some(server_id) = state.aliases.get(&chat.incident_id) {
                    chat.incident_id = server_id.clone();
                }
                state.chats.push(chat.clone());
                Self::publish(&mut state, RemoteDoc::Chat(chat)).await;
                Ok(RemoteAck::default())
            }
            RemoteWrite::TombstoneIncident { id } => {
                let id = state.aliases.get(&id).cloned().unwrap_or(id);
                if let Some(incident) = state.incidents.get_mut(&id) {
                    incident.tombstoned = true;
                }
                Self::publish(&mut state, RemoteDoc::Deleted { id }).await;
                Ok(RemoteAck::default())
            }
            RemoteWrite::RemoveMedia { incident_id, path } => {
                let incident_id = state
                    .aliases
                    .get(&incident_id)
                    .cloned()
                    .unwrap_or(incident_id);
                // Two independent steps, like the real store.
                if let Some(incident) = state.incidents.get_mut(&incident_id) {
                    incident.attachments.retain(|a| a.path != path);
                }
                state
                    .chats
                    .retain(|m| m.payload.media_path() != Some(path.as_str()));
                Self::publish(
                    &mut state,
                    RemoteDoc::MediaRemoved { incident_id, path },
                )
                .await;
                Ok(RemoteAck::default())
            }
        }
    }
}

// ============================================================================
// Subscription pump
// ============================================================================

/// Normalize the remote document stream into ingest events.
pub async fn run_remote_task<R: RemoteSyncChannel>(
    remote: R,
    ingest: IngestTx,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut rx = remote.subscribe().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            doc = rx.recv() => {
                let Some(doc) = doc else { return };
                let event = match doc {
                    RemoteDoc::Incident(incident) => IngressEvent::IncidentUpsert {
                        incident,
                        source: Ingress::Remote,
                    },
                    RemoteDoc::Chat(message) => IngressEvent::ChatArrived {
                        message,
                        source: Ingress::Remote,
                    },
                    RemoteDoc::Deleted { id } => IngressEvent::IncidentTombstone {
                        id,
                        at: chrono::Utc::now(),
                        source: Ingress::Remote,
                    },
                    RemoteDoc::MediaRemoved { incident_id, path } => IngressEvent::MediaRemoved {
                        incident_id,
                        path,
                        source: Ingress::Remote,
                    },
                };
                if ingest
                    .send(IngestRequest { event, reply: None })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

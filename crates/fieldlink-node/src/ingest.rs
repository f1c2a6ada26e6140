//! Merge loop -- the single consumer of both ingress paths.
//!
//! All writes funnel through one bounded channel into this task, which is
//! the only holder of the store's write lock. Effects from each merge are
//! dispatched from here: enrichment jobs, notifications, the remote
//! write-behind and mesh broadcasts of local mutations made offline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use fieldlink_api::IngestRequest;
use fieldlink_mesh::{MeshOutbox, NetMode};
use fieldlink_protocol::{GeoPoint, MeshFrame};
use fieldlink_store::{
    IncidentStore, Ingress, IngressEvent, MergeOutcome, Notice, StoreEffect,
};

use crate::geocode::GeocodeJob;
use crate::mesh_task::MeshPayload;
use crate::remote::{RemoteSyncChannel, RemoteWrite};

const WRITE_BEHIND_ATTEMPTS: u32 = 3;

pub struct MergeDeps<R: RemoteSyncChannel> {
    pub store: Arc<RwLock<IncidentStore>>,
    pub geocode_tx: mpsc::Sender<GeocodeJob>,
    pub geocode_enabled: bool,
    pub notice_tx: mpsc::Sender<Notice>,
    pub mesh_tx: mpsc::Sender<MeshFrame>,
    pub outbox: MeshOutbox,
    pub remote: R,
    pub net: watch::Receiver<NetMode>,
    pub node_id: String,
    pub own_location: GeoPoint,
}

pub async fn run_merge_loop<R: RemoteSyncChannel>(
    mut rx: mpsc::Receiver<IngestRequest>,
    deps: MergeDeps<R>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            req = rx.recv() => {
                let Some(IngestRequest { event, reply }) = req else { return };
                let (outcome, effects) = {
                    let mut store = deps.store.write().await;
                    store.apply(event.clone())
                };
                tracing::debug!(?outcome, "merge applied");
                if let Some(reply) = reply {
                    let _ = reply.send(outcome.clone());
                }

                for effect in effects {
                    match effect {
                        StoreEffect::GeocodeNeeded { incident_id, location } => {
                            if deps.geocode_enabled {
                                if let Err(e) = deps.geocode_tx.try_send(GeocodeJob { incident_id, location }) {
                                    tracing::warn!(error = %e, "geocode queue full, job dropped");
                                }
                            }
                        }
                        StoreEffect::Notify(notice) => {
                            let _ = deps.notice_tx.send(notice).await;
                        }
                        StoreEffect::Reconciled { retired_id, canonical_id } => {
                            tracing::info!(%retired_id, %canonical_id, "incident id reconciled");
                        }
                    }
                }

                dispatch_local(&deps, &event, &outcome).await;
            }
        }
    }
}

/// Propagate a locally originated mutation: write-behind to the Remote
/// Store and, while offline, broadcast over the mesh.
async fn dispatch_local<R: RemoteSyncChannel>(
    deps: &MergeDeps<R>,
    event: &IngressEvent,
    outcome: &MergeOutcome,
) {
    let write = match event {
        IngressEvent::IncidentUpsert {
            incident,
            source: Ingress::Local,
        } => {
            if matches!(
                outcome,
                MergeOutcome::InsertedIncident | MergeOutcome::UpdatedIncident
            ) {
                broadcast_offline(
                    deps,
                    MeshPayload::Incident {
                        incident: incident.clone(),
                    },
                    incident.location,
                )
                .await;
            }
            Some(RemoteWrite::UpsertIncident(incident.clone()))
        }
        IngressEvent::ChatArrived {
            message,
            source: Ingress::Local,
        } if *outcome == MergeOutcome::MessageInserted => {
            broadcast_offline(
                deps,
                MeshPayload::Chat {
                    message: message.clone(),
                },
                deps.own_location,
            )
            .await;
            Some(RemoteWrite::AppendChat(message.clone()))
        }
        IngressEvent::IncidentTombstone {
            id,
            source: Ingress::Local,
            ..
        } if *outcome == MergeOutcome::Tombstoned => {
            Some(RemoteWrite::TombstoneIncident { id: id.clone() })
        }
        IngressEvent::MediaRemoved {
            incident_id,
            path,
            source: Ingress::Local,
        } => Some(RemoteWrite::RemoveMedia {
            incident_id: incident_id.clone(),
            path: path.clone(),
        }),
        // Respond, enrichment and attachment changes ride as full-record
        // upserts: the post-merge snapshot carries the accumulated state.
        IngressEvent::Respond { incident_id, .. }
            if *outcome == MergeOutcome::RespondRecorded =>
        {
            snapshot_upsert(deps, incident_id).await
        }
        IngressEvent::AddressResolved { id, .. }
            if *outcome == MergeOutcome::AddressApplied =>
        {
            snapshot_upsert(deps, id).await
        }
        IngressEvent::MediaAdded { incident_id, .. }
            if *outcome == MergeOutcome::MediaAdded =>
        {
            snapshot_upsert(deps, incident_id).await
        }
        _ => None,
    };

    if let Some(op) = write {
        spawn_write_behind(deps.remote.clone(), op, deps.notice_tx.clone());
    }
}

async fn snapshot_upsert<R: RemoteSyncChannel>(
    deps: &MergeDeps<R>,
    incident_id: &str,
) -> Option<RemoteWrite> {
    deps.store
        .read()
        .await
        .incident(incident_id)
        .cloned()
        .map(RemoteWrite::UpsertIncident)
}

async fn broadcast_offline<R: RemoteSyncChannel>(
    deps: &MergeDeps<R>,
    payload: MeshPayload,
    location: GeoPoint,
) {
    if *deps.net.borrow() != NetMode::Offline {
        return;
    }
    // Logged at queue time; whether the link accepts the frame is the mesh
    // task's problem.
    deps.outbox.record(payload.kind(), payload.summary()).await;
    let content = match serde_json::to_string(&payload) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(error = %e, "mesh payload serialisation failed");
            return;
        }
    };
    let frame = MeshFrame::EmergencyBroadcast {
        content,
        location,
        timestamp: Utc::now().timestamp_millis(),
        sender: deps.node_id.clone(),
    };
    if deps.mesh_tx.try_send(frame).is_err() {
        tracing::warn!("mesh outbound queue full, broadcast dropped");
    }
}

/// Retry the remote write a few times, then surface the failure as a
/// notification. The local copy is already committed either way.
fn spawn_write_behind<R: RemoteSyncChannel>(
    remote: R,
    op: RemoteWrite,
    notice_tx: mpsc::Sender<Notice>,
) {
    tokio::spawn(async move {
        for attempt in 1..=WRITE_BEHIND_ATTEMPTS {
            match remote.write(op.clone()).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "remote write failed");
                    if attempt < WRITE_BEHIND_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }
        let _ = notice_tx
            .send(Notice {
                title: "Sync Failed".to_string(),
                body: "Update saved locally but could not reach the server".to_string(),
                at: Utc::now(),
            })
            .await;
    });
}

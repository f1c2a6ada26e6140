//! The merge engine: one mutable state, one consumer, explicit outcomes.
//!
//! Every mutation flows through [`IncidentStore::apply`]. The store never
//! performs I/O; enrichment, notification delivery and remote write-behind
//! are returned as [`StoreEffect`] values for the caller to dispatch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fieldlink_protocol::{GeoPoint, IncidentId, CURRENT_PARAMS};

use crate::model::{is_provisional, ChatMessage, IncidentEvent, MediaAttachment};
use crate::{
    content_hash, dedup_bucket, dedup_key, Ingress, IngressEvent, MergeOutcome, Notice,
    StoreEffect,
};

/// Dedup keys this many buckets behind the newest message are pruned.
/// Generous next to the +-1 bucket match so clock skew between the mesh and
/// remote copies of a message never defeats deduplication.
const SEEN_RETAIN_BUCKETS: i64 = 30;

/// In-memory incident cache with last-write-wins merge semantics.
pub struct IncidentStore {
    incidents: HashMap<IncidentId, IncidentEvent>,
    chats: HashMap<IncidentId, Vec<ChatMessage>>,
    /// Composite dedup key -> timestamp bucket of each recent chat message.
    /// Entries well past the dedup window are pruned on insert.
    seen: HashMap<String, i64>,
    /// Retired provisional id -> server-issued id.
    aliases: HashMap<IncidentId, IncidentId>,
    /// Arrival counter for chat ordering ties. Never reassigned.
    next_seq: u64,
    own_location: Option<GeoPoint>,
    nearby_radius_km: f64,
}

impl IncidentStore {
    pub fn new(own_location: Option<GeoPoint>, nearby_radius_km: f64) -> Self {
        IncidentStore {
            incidents: HashMap::new(),
            chats: HashMap::new(),
            seen: HashMap::new(),
            aliases: HashMap::new(),
            next_seq: 0,
            own_location,
            nearby_radius_km,
        }
    }

    pub fn set_own_location(&mut self, location: GeoPoint) {
        self.own_location = Some(location);
    }

    /// Follow the alias chain for a possibly-retired provisional id.
    pub fn resolve_id(&self, id: &str) -> IncidentId {
        match self.aliases.get(id) {
            Some(canonical) => canonical.clone(),
            None => id.to_string(),
        }
    }

    pub fn incident(&self, id: &str) -> Option<&IncidentEvent> {
        self.incidents.get(&self.resolve_id(id))
    }

    /// Live (non-tombstoned) incidents, newest creation first.
    pub fn live_incidents(&self) -> Vec<&IncidentEvent> {
        let mut out: Vec<&IncidentEvent> =
            self.incidents.values().filter(|i| !i.tombstoned).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub fn incident_count(&self) -> usize {
        self.incidents.values().filter(|i| !i.tombstoned).count()
    }

    pub fn messages(&self, incident_id: &str) -> &[ChatMessage] {
        self.chats
            .get(&self.resolve_id(incident_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message_count(&self) -> usize {
        self.chats.values().map(Vec::len).sum()
    }

    #[cfg(test)]
    fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Physically drop an incident and its chat stream once the deletion has
    /// been acknowledged everywhere it needs to be.
    pub fn purge(&mut self, id: &str) {
        let canonical = self.resolve_id(id);
        self.incidents.remove(&canonical);
        self.chats.remove(&canonical);
        self.aliases.retain(|_, target| *target != canonical);
    }

    /// Apply one ingress event. Returns what happened and the side effects
    /// the caller must dispatch.
    pub fn apply(&mut self, event: IngressEvent) -> (MergeOutcome, Vec<StoreEffect>) {
        let mut effects = Vec::new();
        let outcome = match event {
            IngressEvent::IncidentUpsert { incident, source } => {
                self.merge_incident(incident, source, &mut effects)
            }
            IngressEvent::IncidentTombstone { id, at, .. } => self.tombstone(&id, at),
            IngressEvent::ChatArrived { message, .. } => self.insert_message(message),
            IngressEvent::AddressResolved { id, address, city } => {
                self.apply_address(&id, address, city)
            }
            IngressEvent::Respond {
                incident_id,
                user_id,
                at,
            } => self.respond(&incident_id, &user_id, at),
            IngressEvent::MediaAdded {
                incident_id,
                attachment,
            } => self.add_attachment(&incident_id, attachment),
            IngressEvent::MediaRemoved {
                incident_id, path, ..
            } => self.remove_media(&incident_id, &path),
        };
        (outcome, effects)
    }

    fn merge_incident(
        &mut self,
        mut incoming: IncidentEvent,
        source: Ingress,
        effects: &mut Vec<StoreEffect>,
    ) -> MergeOutcome {
        incoming.id = self.resolve_id(&incoming.id);

        // A server-issued record may be the canonical form of an incident we
        // created offline under a provisional id. Match on creator plus a
        // creation-timestamp tolerance, retire the provisional entry, and
        // re-key its chat stream before the normal merge runs.
        if source == Ingress::Remote
            && !is_provisional(&incoming.id)
            && !self.incidents.contains_key(&incoming.id)
        {
            if let Some(old_id) = self.find_provisional_match(&incoming) {
                self.reconcile(&old_id, &mut incoming);
                effects.push(StoreEffect::Reconciled {
                    retired_id: old_id,
                    canonical_id: incoming.id.clone(),
                });
            }
        }

        let merged_id = incoming.id.clone();
        let outcome = match self.incidents.get_mut(&incoming.id) {
            Some(existing) => {
                if existing.tombstoned {
                    // Tombstones outlive any late update.
                    tracing::debug!(id = %incoming.id, "update for tombstoned incident dropped");
                    return MergeOutcome::Tombstoned;
                }
                if incoming.tombstoned {
                    existing.tombstoned = true;
                    existing.updated_at = existing.updated_at.max(incoming.updated_at);
                    return MergeOutcome::Tombstoned;
                }
                if incoming.updated_at > existing.updated_at {
                    // Incoming wins; enrichment and accumulated sets survive.
                    if incoming.address.is_none() {
                        incoming.address = existing.address.take();
                        incoming.city = existing.city.take();
                    }
                    incoming.created_by = existing.created_by.clone();
                    incoming.created_at = incoming.created_at.min(existing.created_at);
                    incoming
                        .responders
                        .extend(std::mem::take(&mut existing.responders));
                    merge_attachments(&mut incoming.attachments, std::mem::take(&mut existing.attachments));
                    *existing = incoming;
                    MergeOutcome::UpdatedIncident
                } else {
                    // Losing record can still contribute what the winner lacks.
                    if existing.address.is_none() {
                        existing.address = incoming.address;
                        existing.city = incoming.city;
                    }
                    existing.responders.extend(incoming.responders);
                    merge_attachments(&mut existing.attachments, incoming.attachments);
                    MergeOutcome::StaleIncident
                }
            }
            None => {
                let id = incoming.id.clone();
                if !incoming.tombstoned && source != Ingress::Local {
                    if let Some(notice) = self.nearby_notice(&incoming) {
                        effects.push(StoreEffect::Notify(notice));
                    }
                }
                self.incidents.insert(id.clone(), incoming);
                self.chats.entry(id).or_default();
                MergeOutcome::InsertedIncident
            }
        };

        // Enrichment is re-requested on every merge that leaves the address
        // empty; the queue enforces at-most-one in-flight per incident.
        if matches!(
            outcome,
            MergeOutcome::InsertedIncident | MergeOutcome::UpdatedIncident
        ) {
            if let Some(record) = self.incidents.get(&merged_id) {
                if !record.tombstoned && record.address.is_none() {
                    effects.push(StoreEffect::GeocodeNeeded {
                        incident_id: merged_id,
                        location: record.location,
                    });
                }
            }
        }
        outcome
    }

    fn find_provisional_match(&self, incoming: &IncidentEvent) -> Option<IncidentId> {
        let tolerance = CURRENT_PARAMS.reconcile_tolerance_secs;
        self.incidents
            .values()
            .filter(|cand| {
                cand.is_provisional()
                    && cand.created_by == incoming.created_by
                    && (cand.created_at - incoming.created_at)
                        .num_seconds()
                        .abs()
                        <= tolerance
            })
            .min_by_key(|cand| (cand.created_at - incoming.created_at).num_seconds().abs())
            .map(|cand| cand.id.clone())
    }

    fn reconcile(&mut self, old_id: &str, incoming: &mut IncidentEvent) {
        let Some(provisional) = self.incidents.remove(old_id) else {
            return;
        };
        tracing::info!(retired = %old_id, canonical = %incoming.id, "provisional incident reconciled");

        if incoming.address.is_none() {
            incoming.address = provisional.address;
            incoming.city = provisional.city;
        }
        incoming.created_at = incoming.created_at.min(provisional.created_at);
        incoming.responders.extend(provisional.responders);
        merge_attachments(&mut incoming.attachments, provisional.attachments);

        // Re-key the provisional chat stream under the canonical id,
        // preserving arrival order within equal timestamps.
        let moved = self.chats.remove(old_id).unwrap_or_default();
        let target = self.chats.entry(incoming.id.clone()).or_default();
        for mut msg in moved {
            msg.incident_id = incoming.id.clone();
            let at = target.partition_point(|m| (m.timestamp, m.seq) <= (msg.timestamp, msg.seq));
            target.insert(at, msg);
        }

        self.aliases.insert(old_id.to_string(), incoming.id.clone());
    }

    fn tombstone(&mut self, id: &str, at: DateTime<Utc>) -> MergeOutcome {
        let canonical = self.resolve_id(id);
        match self.incidents.get_mut(&canonical) {
            Some(existing) => {
                existing.tombstoned = true;
                existing.updated_at = existing.updated_at.max(at);
                MergeOutcome::Tombstoned
            }
            None => {
                tracing::warn!(id = %canonical, "tombstone for unknown incident dropped");
                MergeOutcome::NotFound
            }
        }
    }

    fn insert_message(&mut self, mut msg: ChatMessage) -> MergeOutcome {
        msg.incident_id = self.resolve_id(&msg.incident_id);

        match self.incidents.get(&msg.incident_id) {
            None => {
                tracing::warn!(incident = %msg.incident_id, "chat for unknown incident dropped");
                return MergeOutcome::OrphanDropped;
            }
            Some(parent) if parent.tombstoned => {
                tracing::debug!(incident = %msg.incident_id, "chat for tombstoned incident dropped");
                return MergeOutcome::TombstonedParent;
            }
            Some(_) => {}
        }

        // Composite key: sender, content hash, coarse timestamp bucket. Two
        // timestamps within the window land in the same or adjacent buckets,
        // so both neighbours are checked.
        let hash = content_hash(msg.payload.content());
        let bucket = dedup_bucket(msg.timestamp);
        for b in [bucket - 1, bucket, bucket + 1] {
            if self.seen.contains_key(&dedup_key(&msg.sender_id, &hash, b)) {
                tracing::debug!(sender = %msg.sender_id, "duplicate chat message dropped");
                return MergeOutcome::DuplicateMessage;
            }
        }
        self.seen
            .insert(dedup_key(&msg.sender_id, &hash, bucket), bucket);
        // Echoes land within seconds of the original; keys from much older
        // buckets can no longer match and are dropped here.
        self.seen
            .retain(|_, b| bucket - *b <= SEEN_RETAIN_BUCKETS);

        msg.seq = self.next_seq;
        self.next_seq += 1;

        // Ordered insert: already-rendered messages never reorder, a late
        // older message slots in at its timestamp position.
        let stream = self
            .chats
            .entry(msg.incident_id.clone())
            .or_default();
        let at = stream.partition_point(|m| (m.timestamp, m.seq) <= (msg.timestamp, msg.seq));
        stream.insert(at, msg);
        MergeOutcome::MessageInserted
    }

    fn apply_address(&mut self, id: &str, address: String, city: Option<String>) -> MergeOutcome {
        let canonical = self.resolve_id(id);
        match self.incidents.get_mut(&canonical) {
            None => MergeOutcome::NotFound,
            Some(existing) if existing.tombstoned || existing.address.is_some() => {
                MergeOutcome::AddressMoot
            }
            Some(existing) => {
                existing.address = Some(address);
                existing.city = city;
                existing.updated_at = existing.updated_at.max(Utc::now());
                MergeOutcome::AddressApplied
            }
        }
    }

    fn respond(&mut self, incident_id: &str, user_id: &str, at: DateTime<Utc>) -> MergeOutcome {
        let canonical = self.resolve_id(incident_id);
        match self.incidents.get_mut(&canonical) {
            None => MergeOutcome::NotFound,
            Some(existing) if existing.tombstoned => MergeOutcome::TombstonedParent,
            Some(existing) => {
                if existing.responders.insert(user_id.to_string()) {
                    existing.updated_at = existing.updated_at.max(at);
                    MergeOutcome::RespondRecorded
                } else {
                    MergeOutcome::AlreadyResponded
                }
            }
        }
    }

    fn add_attachment(&mut self, incident_id: &str, attachment: MediaAttachment) -> MergeOutcome {
        let canonical = self.resolve_id(incident_id);
        match self.incidents.get_mut(&canonical) {
            None => MergeOutcome::NotFound,
            Some(existing) => {
                if !existing.attachments.iter().any(|a| a.path == attachment.path) {
                    existing.updated_at = existing.updated_at.max(attachment.uploaded_at);
                    existing.attachments.push(attachment);
                }
                MergeOutcome::MediaAdded
            }
        }
    }

    /// Step one of media removal: drop the attachment from the incident's
    /// list. Independent of [`Self::strip_media_messages`]; a failure in one
    /// step never blocks the other.
    pub fn remove_attachment(&mut self, incident_id: &str, path: &str) -> bool {
        let canonical = self.resolve_id(incident_id);
        match self.incidents.get_mut(&canonical) {
            None => false,
            Some(existing) => {
                let before = existing.attachments.len();
                existing.attachments.retain(|a| a.path != path);
                existing.attachments.len() < before
            }
        }
    }

    /// Step two of media removal: drop every chat message referencing the
    /// attachment path.
    pub fn strip_media_messages(&mut self, incident_id: &str, path: &str) -> usize {
        let canonical = self.resolve_id(incident_id);
        match self.chats.get_mut(&canonical) {
            None => 0,
            Some(stream) => {
                let before = stream.len();
                stream.retain(|m| m.payload.media_path() != Some(path));
                before - stream.len()
            }
        }
    }

    fn remove_media(&mut self, incident_id: &str, path: &str) -> MergeOutcome {
        let canonical = self.resolve_id(incident_id);
        if !self.incidents.contains_key(&canonical) && !self.chats.contains_key(&canonical) {
            return MergeOutcome::NotFound;
        }
        let from_incident = self.remove_attachment(incident_id, path);
        if !from_incident {
            tracing::warn!(incident = %canonical, %path, "attachment not on incident, continuing removal");
        }
        let messages_removed = self.strip_media_messages(incident_id, path);
        MergeOutcome::MediaRemoved {
            from_incident,
            messages_removed,
        }
    }

    fn nearby_notice(&self, incoming: &IncidentEvent) -> Option<Notice> {
        let own = self.own_location?;
        let distance = own.distance_km(&incoming.location);
        if distance > self.nearby_radius_km {
            return None;
        }
        Some(Notice {
            title: "Nearby Incident Reported".to_string(),
            body: format!("{:?} reported {distance:.1} km away", incoming.kind),
            at: Utc::now(),
        })
    }
}

/// Union by attachment path, keeping the receiver's order.
fn merge_attachments(into: &mut Vec<MediaAttachment>, from: Vec<MediaAttachment>) {
    for att in from {
        if !into.iter().any(|a| a.path == att.path) {
            into.push(att);
        }
    }
}

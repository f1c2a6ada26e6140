//! Fieldlink Dispatch -- countdown timers for dispatched emergency services.
//!
//! Each call to a service starts a timer with a fixed per-service ETA.
//! When it elapses the registry emits an arrival event; callers turn that
//! into a notification and a service-status update on the incident. Timers
//! can be cancelled while the service is still en route.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fieldlink_protocol::{service_eta, service_name, IncidentId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

pub type DispatchId = String;

/// Emitted when a dispatch timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub dispatch_id: DispatchId,
    pub service_code: String,
    pub incident_id: Option<IncidentId>,
}

/// Lifecycle of a dispatch timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    EnRoute,
    Arrived,
}

/// Read-only view of a timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerDetail {
    pub dispatch_id: DispatchId,
    pub service_code: String,
    pub service_name: String,
    pub incident_id: Option<IncidentId>,
    pub status: TimerStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Derived from the deadline at snapshot time, never from a countdown.
    pub remaining_secs: i64,
}

struct TimerEntry {
    service_code: String,
    incident_id: Option<IncidentId>,
    status: TimerStatus,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Registry of dispatch timers. An elapsed timer flips to Arrived and stays
/// visible; cancellation removes the entry, and only while still en route.
#[derive(Clone)]
pub struct EmergencyTimerRegistry {
    inner: Arc<RwLock<HashMap<DispatchId, TimerEntry>>>,
    arrivals: mpsc::Sender<Arrival>,
}

impl EmergencyTimerRegistry {
    pub fn new(arrivals: mpsc::Sender<Arrival>) -> Self {
        EmergencyTimerRegistry {
            inner: Arc::new(RwLock::new(HashMap::new())),
            arrivals,
        }
    }

    /// Start a timer for a dialed service. Returns the dispatch id used to
    /// cancel or inspect it.
    pub async fn start(&self, service_code: &str, incident_id: Option<IncidentId>) -> DispatchId {
        let eta = service_eta(service_code);
        let now = Utc::now();
        let deadline = now
            + ChronoDuration::from_std(eta).unwrap_or_else(|_| ChronoDuration::seconds(300));
        let dispatch_id = new_dispatch_id();

        let task_id = dispatch_id.clone();
        let task_code = service_code.to_string();
        let task_incident = incident_id.clone();
        let registry = self.inner.clone();
        let arrivals = self.arrivals.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(eta).await;
            // Flipping under the write lock makes cancellation race-free: a
            // cancel that got there before us already took the entry, and
            // then no arrival is emitted.
            {
                let mut timers = registry.write().await;
                match timers.get_mut(&task_id) {
                    Some(entry) => entry.status = TimerStatus::Arrived,
                    None => return,
                }
            }
            tracing::info!(
                dispatch = %task_id,
                service = %task_code,
                "dispatch timer elapsed, service arrived"
            );
            let _ = arrivals
                .send(Arrival {
                    dispatch_id: task_id,
                    service_code: task_code,
                    incident_id: task_incident,
                })
                .await;
        });

        tracing::info!(
            dispatch = %dispatch_id,
            service = service_name(service_code),
            eta_secs = eta.as_secs(),
            "dispatch timer started"
        );
        self.inner.write().await.insert(
            dispatch_id.clone(),
            TimerEntry {
                service_code: service_code.to_string(),
                incident_id,
                status: TimerStatus::EnRoute,
                started_at: now,
                deadline,
                handle,
            },
        );
        dispatch_id
    }

    /// Cancel an en-route timer. Returns false when no such timer is
    /// running (already arrived, already cancelled, or never existed).
    pub async fn cancel(&self, dispatch_id: &str) -> bool {
        let mut timers = self.inner.write().await;
        match timers.get(dispatch_id) {
            Some(entry) if entry.status == TimerStatus::EnRoute => {
                entry.handle.abort();
                timers.remove(dispatch_id);
                tracing::info!(dispatch = %dispatch_id, "dispatch timer cancelled");
                true
            }
            _ => false,
        }
    }

    /// Seconds left for one timer, derived from its wall-clock deadline.
    pub async fn remaining_secs(&self, dispatch_id: &str) -> Option<i64> {
        self.inner
            .read()
            .await
            .get(dispatch_id)
            .map(|e| (e.deadline - Utc::now()).num_seconds().max(0))
    }

    /// Snapshot of all timers, arrived ones included, soonest deadline
    /// first.
    pub async fn snapshot(&self) -> Vec<TimerDetail> {
        let now = Utc::now();
        let mut out: Vec<TimerDetail> = self
            .inner
            .read()
            .await
            .iter()
            .map(|(id, e)| TimerDetail {
                dispatch_id: id.clone(),
                service_code: e.service_code.clone(),
                service_name: service_name(&e.service_code).to_string(),
                incident_id: e.incident_id.clone(),
                status: e.status,
                started_at: e.started_at,
                deadline: e.deadline,
                remaining_secs: (e.deadline - now).num_seconds().max(0),
            })
            .collect();
        out.sort_by_key(|t| t.deadline);
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

fn new_dispatch_id() -> DispatchId {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("dispatch-{suffix}")
}

//! Outgoing broadcast log.
//!
//! Every broadcast handed to the mesh is recorded here at queue time,
//! before the link gets a say. Send success or failure reflects only local
//! link state, so the log is the node's own view of what it shouted.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Oldest records are dropped past this many entries.
const LOG_CAP: usize = 64;

/// One outgoing broadcast, recorded when it was queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub kind: String,
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// Shared, capped log of outgoing mesh broadcasts.
#[derive(Clone, Default)]
pub struct MeshOutbox {
    inner: Arc<RwLock<VecDeque<BroadcastRecord>>>,
}

impl MeshOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, kind: &str, summary: String) {
        let mut log = self.inner.write().await;
        log.push_back(BroadcastRecord {
            kind: kind.to_string(),
            summary,
            at: Utc::now(),
        });
        while log.len() > LOG_CAP {
            log.pop_front();
        }
    }

    /// Oldest first.
    pub async fn snapshot(&self) -> Vec<BroadcastRecord> {
        self.inner.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

//! Notification collector -- bounded history of delivered notices.
//!
//! Delivery to the OS/browser layer is an external collaborator; this task
//! records what was handed over so the API can expose it.

use std::collections::VecDeque;
use std::sync::Arc;

use fieldlink_store::Notice;
use tokio::sync::{broadcast, mpsc, RwLock};

pub type NoticeLog = Arc<RwLock<VecDeque<Notice>>>;

pub fn new_notice_log() -> NoticeLog {
    Arc::new(RwLock::new(VecDeque::new()))
}

pub async fn run_notice_collector(
    mut rx: mpsc::Receiver<Notice>,
    log: NoticeLog,
    history: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            notice = rx.recv() => {
                let Some(notice) = notice else { return };
                tracing::info!(title = %notice.title, body = %notice.body, "notification");
                let mut log = log.write().await;
                log.push_back(notice);
                while log.len() > history {
                    log.pop_front();
                }
            }
        }
    }
}

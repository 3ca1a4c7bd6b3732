//! Liveness sweep for subscriber connections.
//!
//! Every interval: purge connections silent for longer than `stale_after`,
//! then queue a ping on the survivors. A pong (or any inbound frame) refreshes
//! a connection's last-seen time.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::gateway::connections::ConnectionRegistry;
use crate::task::PeriodicTask;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeatReport {
    pub purged: usize,
    pub pinged: usize,
}

/// One heartbeat pass at `now`.
pub fn beat_at(connections: &ConnectionRegistry, now: u64, stale_after: Duration) -> BeatReport {
    let purged = connections.sweep_stale_at(now, stale_after);
    if !purged.is_empty() {
        info!(count = purged.len(), "purged stale connections");
    }
    let pinged = connections.ping_all();
    debug!(pinged, "heartbeat");
    BeatReport { purged: purged.len(), pinged }
}

pub struct Heartbeat {
    task: PeriodicTask,
}

impl Heartbeat {
    pub fn start(
        connections: Arc<ConnectionRegistry>,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        let task = PeriodicTask::spawn("heartbeat", interval, move || {
            beat_at(&connections, crate::now_ms(), stale_after);
        });
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub async fn stop(self) {
        self.task.stop().await;
    }
}

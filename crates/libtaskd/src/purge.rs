use std::time::{Duration, SystemTime};

use taskd_protocol::TaskId;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::TaskController;

/// Periodic eviction of terminal tasks whose retention window has elapsed.
pub struct PurgeScheduler {
    controller: TaskController,
    interval: Duration,
}

impl PurgeScheduler {
    pub fn new(controller: TaskController, interval: Duration) -> Self {
        Self {
            controller,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One sweep against an explicit clock. Returns the ids it evicted.
    pub async fn sweep(&self, now: SystemTime) -> Vec<TaskId> {
        let mut purged = Vec::new();
        for id in self.controller.registry().expired(now) {
            if self.controller.purge(&id).await {
                purged.push(id);
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "purged expired tasks");
        }
        purged
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep(SystemTime::now()).await;
                }
            }
        }
        debug!("purge scheduler stopped");
    }

    /// Run on the current runtime, stopping with the controller.
    pub fn spawn(self) -> JoinHandle<()> {
        let shutdown = self.controller.shutdown_token();
        tokio::spawn(self.run(shutdown))
    }
}

//! Channel sweep loop
//!
//! Periodically drops update channels whose peer sessions went away
//! without disconnecting.

use meshplane_management::PeersUpdateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Sweeper {
    updates: Arc<PeersUpdateManager>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(updates: Arc<PeersUpdateManager>, interval: Duration) -> Self {
        Self {
            updates,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    /// One pass. Returns the number of channels removed.
    pub fn sweep(&self) -> usize {
        let removed = self.updates.prune_closed();
        if removed > 0 {
            info!("Removed {} abandoned update channel(s)", removed);
        } else {
            debug!("{} update channel(s) open", self.updates.channel_count());
        }
        removed
    }

    /// Run until cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Channel sweeper started");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        info!("Channel sweeper stopped");
    }
}

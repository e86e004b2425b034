//! Background TTL decay and eviction.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resolver::Resolver;

pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the sweeper and waits for its task to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("sweeper task ended abnormally: {e}");
        }
    }
}

/// Spawns a task sweeping `resolver` every `interval` until shut down.
///
/// The sweep only touches settled entries, so it never waits on a fetch.
pub fn spawn_sweeper(resolver: Arc<Resolver>, interval: Duration) -> SweeperHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let interval = interval.max(Duration::from_millis(1));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        info!("cache sweeper started, interval {interval:?}");
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = resolver.sweep().await;
                    if stats.evicted > 0 {
                        debug!(
                            evicted = stats.evicted,
                            kept = stats.decayed - stats.evicted,
                            in_flight = stats.skipped,
                            "swept cache"
                        );
                    }
                }
            }
        }
        info!("cache sweeper stopped");
    });

    SweeperHandle { token, task }
}

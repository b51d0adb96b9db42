use crate::api::Digest;
use crate::backend::CircuitBreaker;
use crate::config::{self, Timings};
use crate::engine::{Engine, EngineError};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Remembers since when completed images are orphaned.
#[derive(Debug, Default)]
pub struct CleanupTracker {
    first_seen: HashMap<Digest, Instant>,
}

impl CleanupTracker {
    /// Record the completed orphans of a pruning pass.
    ///
    /// Returns the ones which stayed orphaned for at least `grace`, and forgets about them.
    /// Images missing from `orphans` are referenced again, and start over.
    pub fn update(&mut self, orphans: Vec<Digest>, now: Instant, grace: Duration) -> Vec<Digest> {
        let current: HashSet<Digest> = orphans.into_iter().collect();
        self.first_seen.retain(|digest, _| current.contains(digest));
        for digest in current {
            self.first_seen.entry(digest).or_insert(now);
        }

        let due: Vec<Digest> = self
            .first_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= grace)
            .map(|(digest, _)| digest.clone())
            .collect();

        for digest in &due {
            self.first_seen.remove(digest);
        }

        due
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }
}

/// Periodic self-healing of the engine.
#[derive(Clone, Debug)]
pub struct Housekeeping {
    engine: Engine,
    breaker: CircuitBreaker,
    timings: watch::Receiver<Timings>,
    stop: CancellationToken,
}

impl Housekeeping {
    pub fn new(
        engine: Engine,
        breaker: CircuitBreaker,
        timings: watch::Receiver<Timings>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            engine,
            breaker,
            timings,
            stop,
        }
    }

    pub fn run(self) -> impl Future<Output = anyhow::Result<()>> {
        async move {
            info!("Starting housekeeping");
            let result = tokio::try_join!(
                self.stall_loop(),
                self.prune_loop(),
                self.metrics_loop()
            );
            if let Err(err) = result {
                info!("Housekeeping ending: {err}");
            }
            Ok(())
        }
    }

    fn timings(&self) -> Timings {
        self.timings.borrow().clone()
    }

    async fn pause(&self, pick: fn(&Timings) -> Duration) -> bool {
        config::pause(&self.timings, &self.stop, pick).await
    }

    async fn stall_loop(&self) -> Result<(), EngineError> {
        while self.pause(|t| t.stall_check_pause).await {
            self.engine.requeue_stalled_scans().await?;
        }
        Ok(())
    }

    async fn prune_loop(&self) -> Result<(), EngineError> {
        let mut tracker = CleanupTracker::default();

        while self.pause(|t| t.orphan_prune_pause).await {
            let orphans = self.engine.prune_orphaned_images().await?;
            let due = tracker.update(
                orphans,
                Instant::now(),
                self.timings().orphan_cleanup_grace,
            );
            debug!(pending = tracker.len(), due = due.len(), "Completed orphans");

            if !due.is_empty() {
                info!(images = due.len(), "Forgetting orphaned images");
                self.engine.forget_images(due).await?;
            }
        }
        Ok(())
    }

    async fn metrics_loop(&self) -> Result<(), EngineError> {
        while self.pause(|t| t.metrics_pause).await {
            let mut metrics = self.engine.metrics().await?;
            metrics.breaker = Some(self.breaker.snapshot());

            info!(
                workloads = metrics.number_of_workloads,
                images = metrics.number_of_images,
                in_progress = metrics.in_progress_scans,
                limit = metrics.concurrent_scan_limit,
                scan_queue = metrics.scan_queue_length,
                check_queue = metrics.backend_check_queue_length,
                breaker = %self.breaker.state(),
                "Engine state"
            );
            debug!(?metrics, "Metrics snapshot");
        }
        Ok(())
    }
}

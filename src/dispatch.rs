use crate::api::{Image, ScanState};
use crate::backend::{BreakerError, CircuitBreaker, ScanBackend};
use crate::config::{self, Timings};
use crate::engine::{Engine, EngineError};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of images refreshed per pass.
const REFRESH_BATCH: usize = 10;

#[derive(Debug)]
struct Inventory {
    keys: HashSet<String>,
    fetched_at: Instant,
}

/// The workers talking to the scanning backend on behalf of the engine.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    engine: Engine,
    backend: Arc<dyn ScanBackend>,
    breaker: CircuitBreaker,
    timings: watch::Receiver<Timings>,
    stop: CancellationToken,
    inventory: Arc<RwLock<Option<Inventory>>>,
}

impl Dispatcher {
    pub fn new(
        engine: Engine,
        backend: Arc<dyn ScanBackend>,
        breaker: CircuitBreaker,
        timings: watch::Receiver<Timings>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            engine,
            backend,
            breaker,
            timings,
            stop,
            inventory: Default::default(),
        }
    }

    /// Run all workers, until stopped.
    pub fn run(self) -> impl Future<Output = anyhow::Result<()>> {
        async move {
            info!("Starting dispatcher");
            let result = tokio::try_join!(
                self.backend_check_loop(),
                self.scan_dispatch_loop(),
                self.completion_poll_loop(),
                self.refresh_loop(),
                self.inventory_loop(),
            );
            if let Err(err) = result {
                info!("Dispatcher ending: {err}");
            }
            Ok(())
        }
    }

    fn timings(&self) -> Timings {
        self.timings.borrow().clone()
    }

    /// Sleep, returns `false` if stopped meanwhile.
    async fn pause(&self, pick: fn(&Timings) -> Duration) -> bool {
        config::pause(&self.timings, &self.stop, pick).await
    }

    async fn backend_check_loop(&self) -> Result<(), EngineError> {
        loop {
            let pause: fn(&Timings) -> Duration =
                match self.engine.next_image_for_backend_check().await? {
                    Some(image) => {
                        self.check_image(image).await?;
                        |t| t.backend_throttle
                    }
                    None => |t| t.backend_check_pause,
                };
            if !self.pause(pause).await {
                return Ok(());
            }
        }
    }

    /// A fresh inventory which does not know the image, saves us a lookup.
    fn known_missing(&self, image: &Image) -> bool {
        let max_age = self.timings().inventory_pause * 2;
        match &*self.inventory.read() {
            Some(inventory) if inventory.fetched_at.elapsed() <= max_age => {
                !inventory.keys.contains(image.search_key())
            }
            _ => false,
        }
    }

    async fn check_image(&self, image: Image) -> Result<(), EngineError> {
        let digest = image.digest.clone();

        if self.known_missing(&image) {
            debug!(%digest, "Not in backend inventory");
            return self.engine.backend_check_result(digest, None).await;
        }

        let result = self
            .breaker
            .issue_request("check scan status", || {
                self.backend.fetch_scan_status(image.search_key())
            })
            .await;

        if self.stop.is_cancelled() {
            return Ok(());
        }

        match result {
            Ok(state) => self.engine.backend_check_result(digest, state).await,
            Err(err) => {
                debug!(%digest, "Backend check not possible: {err}");
                self.engine.backend_check_failed(digest).await
            }
        }
    }

    async fn scan_dispatch_loop(&self) -> Result<(), EngineError> {
        loop {
            if !self.breaker.is_open() {
                if let Some(image) = self.engine.next_image_for_scanning().await? {
                    self.spawn_submit(image);
                    continue;
                }
            }

            if !self.pause(|t| t.scan_dispatch_pause).await {
                return Ok(());
            }
        }
    }

    fn spawn_submit(&self, image: Image) {
        let this = self.clone();
        tokio::spawn(async move {
            info!(digest = %image.digest, name = %image.human_readable_name(), "Submitting scan");

            let result = this
                .breaker
                .issue_request("submit scan", || this.backend.submit_scan(&image))
                .await;

            if this.stop.is_cancelled() {
                return;
            }

            let outcome = result.map_err(|err| err.to_string());
            if let Err(err) = this
                .engine
                .report_scan_outcome(image.digest.clone(), outcome)
                .await
            {
                debug!(digest = %image.digest, "Unable to report scan outcome: {err}");
            }
        });
    }

    async fn completion_poll_loop(&self) -> Result<(), EngineError> {
        loop {
            for image in self.engine.running_backend_scans().await? {
                let result = self
                    .breaker
                    .issue_request("poll scan status", || {
                        self.backend.fetch_scan_status(image.search_key())
                    })
                    .await;

                if self.stop.is_cancelled() {
                    return Ok(());
                }

                match result {
                    Ok(state) => self.engine.backend_poll_result(image.digest, state).await?,
                    Err(BreakerError::Open { .. }) => {
                        debug!("Circuit open, postponing completion polling");
                        break;
                    }
                    Err(err) => debug!(digest = %image.digest, "Polling failed: {err}"),
                }
            }

            if !self.pause(|t| t.completion_poll_pause).await {
                return Ok(());
            }
        }
    }

    async fn refresh_loop(&self) -> Result<(), EngineError> {
        loop {
            let threshold = self.timings().refresh_threshold;
            let stale = self
                .engine
                .images_needing_refresh(threshold, REFRESH_BATCH)
                .await?;

            for image in stale {
                let result = self
                    .breaker
                    .issue_request("refresh scan results", || {
                        self.backend.fetch_scan_status(image.search_key())
                    })
                    .await;

                if self.stop.is_cancelled() {
                    return Ok(());
                }

                match result {
                    Ok(Some(ScanState::Complete(result))) => {
                        self.engine.refresh_results(image.digest, result).await?
                    }
                    Ok(other) => {
                        warn!(digest = %image.digest, ?other, "No results to refresh from")
                    }
                    Err(BreakerError::Open { .. }) => break,
                    Err(err) => debug!(digest = %image.digest, "Refresh failed: {err}"),
                }
            }

            if !self.pause(|t| t.refresh_pause).await {
                return Ok(());
            }
        }
    }

    async fn inventory_loop(&self) -> Result<(), EngineError> {
        loop {
            let result = self
                .breaker
                .issue_request("list known scans", || self.backend.list_all_known_scans())
                .await;

            match result {
                Ok(keys) => {
                    info!(scans = keys.len(), "Refreshed backend inventory");
                    *self.inventory.write() = Some(Inventory {
                        keys: keys.into_iter().collect(),
                        fetched_at: Instant::now(),
                    });
                }
                Err(err) => debug!("Inventory refresh failed: {err}"),
            }

            if !self.pause(|t| t.inventory_pause).await {
                return Ok(());
            }
        }
    }
}

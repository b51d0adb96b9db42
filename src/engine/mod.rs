mod action;
mod model;
mod queue;
mod results;
mod status;

use action::{Action, Processor};
pub use model::{Model, ModelConfig};
pub use status::ScanStatus;

use crate::api::{Digest, Image, ScanResult, ScanState, Workload, WorkloadRef};
use crate::config::Timings;
use crate::metrics::Metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Capacity of the action intake. Producers wait while it is full.
const INTAKE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine stopped")]
    Stopped,
}

/// Handle to the serial processor. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Engine {
    tx: mpsc::Sender<Action>,
}

/// Create the engine, returning its handle and the processing loop.
///
/// The loop ends when the stop token fires, or all handles are dropped.
pub fn engine(
    model: Model,
    timings: watch::Sender<Timings>,
    metrics: Arc<dyn Metrics>,
    stop: CancellationToken,
) -> (Engine, impl Future<Output = anyhow::Result<()>>) {
    let (tx, mut rx) = mpsc::channel::<Action>(INTAKE_CAPACITY);

    let mut processor = Processor {
        model,
        timings,
        metrics,
    };

    let runner = async move {
        info!("Starting engine");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                action = rx.recv() => match action {
                    Some(action) => action.apply(&mut processor),
                    None => break,
                },
            }
        }
        info!("Engine stopped");
        Ok(())
    };

    (Engine { tx }, runner)
}

impl Engine {
    async fn send(&self, action: Action) -> Result<(), EngineError> {
        self.tx.send(action).await.map_err(|_| EngineError::Stopped)
    }

    async fn request<T>(&self, f: impl FnOnce(oneshot::Sender<T>) -> Action) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(f(tx)).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn add_workload(&self, workload: Workload) -> Result<(), EngineError> {
        self.send(Action::AddWorkload(workload)).await
    }

    pub async fn update_workload(&self, workload: Workload) -> Result<(), EngineError> {
        self.send(Action::UpdateWorkload(workload)).await
    }

    pub async fn delete_workload(&self, key: WorkloadRef) -> Result<(), EngineError> {
        self.send(Action::DeleteWorkload(key)).await
    }

    pub async fn all_workloads(&self, workloads: Vec<Workload>) -> Result<(), EngineError> {
        self.send(Action::AllWorkloads(workloads)).await
    }

    pub async fn add_image(&self, image: Image) -> Result<(), EngineError> {
        self.send(Action::AddImage(image)).await
    }

    pub async fn set_image_priority(&self, digest: Digest, priority: i32) -> Result<(), EngineError> {
        self.send(Action::SetImagePriority { digest, priority }).await
    }

    pub async fn next_image_for_backend_check(&self) -> Result<Option<Image>, EngineError> {
        self.request(Action::GetNextImageForBackendCheck).await
    }

    pub async fn backend_check_result(
        &self,
        digest: Digest,
        state: Option<ScanState>,
    ) -> Result<(), EngineError> {
        self.send(Action::BackendCheckResult { digest, state }).await
    }

    pub async fn backend_check_failed(&self, digest: Digest) -> Result<(), EngineError> {
        self.send(Action::BackendCheckFailed(digest)).await
    }

    /// Admission controlled dequeue.
    pub async fn next_image_for_scanning(&self) -> Result<Option<Image>, EngineError> {
        self.request(Action::GetNextImageForScanning).await
    }

    pub async fn report_scan_outcome(
        &self,
        digest: Digest,
        outcome: Result<(), String>,
    ) -> Result<(), EngineError> {
        self.send(Action::ReportScanOutcome { digest, outcome }).await
    }

    pub async fn running_backend_scans(&self) -> Result<Vec<Image>, EngineError> {
        self.request(Action::GetRunningBackendScans).await
    }

    pub async fn backend_poll_result(
        &self,
        digest: Digest,
        state: Option<ScanState>,
    ) -> Result<(), EngineError> {
        self.send(Action::BackendPollResult { digest, state }).await
    }

    pub async fn images_needing_refresh(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<Image>, EngineError> {
        self.request(|reply| Action::GetImagesNeedingRefresh {
            threshold,
            limit,
            reply,
        })
        .await
    }

    pub async fn refresh_results(&self, digest: Digest, result: ScanResult) -> Result<(), EngineError> {
        self.send(Action::RefreshResults { digest, result }).await
    }

    pub async fn requeue_stalled_scans(&self) -> Result<(), EngineError> {
        self.send(Action::RequeueStalledScans).await
    }

    /// Returns the completed orphans, which are left in place.
    pub async fn prune_orphaned_images(&self) -> Result<Vec<Digest>, EngineError> {
        self.request(Action::PruneOrphanedImages).await
    }

    pub async fn forget_images(&self, digests: Vec<Digest>) -> Result<(), EngineError> {
        self.send(Action::ForgetImages(digests)).await
    }

    pub async fn set_config(&self, update: scanherd_api::ConfigUpdate) -> Result<(), EngineError> {
        self.send(Action::SetConfig(update)).await
    }

    pub async fn aggregated_results(&self) -> Result<scanherd_api::ScanResults, EngineError> {
        self.request(Action::GetAggregatedResults).await
    }

    pub async fn metrics(&self) -> Result<scanherd_api::Metrics, EngineError> {
        self.request(Action::GetMetrics).await
    }

    pub async fn model(&self) -> Result<scanherd_api::Model, EngineError> {
        self.request(Action::GetModel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Container, PolicyStatus};
    use crate::metrics::NoopMetrics;

    fn start(limit: usize) -> (Engine, CancellationToken, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let stop = CancellationToken::new();
        let (timings, _) = watch::channel(Timings::default());
        let model = Model::new(
            ModelConfig {
                concurrent_scan_limit: limit,
                ..Default::default()
            },
            Arc::new(NoopMetrics),
        );
        let (engine, runner) = engine(model, timings, Arc::new(NoopMetrics), stop.clone());
        (engine, stop, tokio::spawn(runner))
    }

    #[tokio::test]
    async fn happy_path_through_the_handle() {
        let (engine, stop, task) = start(1);

        engine
            .add_workload(Workload {
                namespace: "default".into(),
                name: "pod".into(),
                uid: "uid".into(),
                containers: vec![Container {
                    image: Image::new("docker.io/app", "sha1"),
                    name: "app".into(),
                }],
            })
            .await
            .unwrap();

        let image = engine.next_image_for_backend_check().await.unwrap().unwrap();
        engine
            .backend_check_result(image.digest.clone(), None)
            .await
            .unwrap();

        let image = engine.next_image_for_scanning().await.unwrap().unwrap();
        assert_eq!(image.digest, Digest::from("sha1"));
        assert!(engine.next_image_for_scanning().await.unwrap().is_none());

        engine
            .report_scan_outcome(image.digest.clone(), Ok(()))
            .await
            .unwrap();
        let running = engine.running_backend_scans().await.unwrap();
        assert_eq!(running.len(), 1);

        engine
            .backend_poll_result(image.digest, Some(ScanState::Complete(ScanResult::clean())))
            .await
            .unwrap();

        let results = engine.aggregated_results().await.unwrap();
        assert_eq!(results.workloads.len(), 1);
        assert_eq!(
            results.workloads[0].overall_status,
            PolicyStatus::NotInViolation
        );
        assert_eq!(results.workloads[0].policy_violations, 0);

        stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stopped_engine_reports_stopped() {
        let (engine, stop, task) = start(1);
        stop.cancel();
        task.await.unwrap().unwrap();

        assert!(matches!(engine.metrics().await, Err(EngineError::Stopped)));
    }
}

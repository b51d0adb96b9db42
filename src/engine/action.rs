use super::model::{Model, ModelError};
use crate::api::{Digest, Image, ScanResult, ScanState, Workload, WorkloadRef};
use crate::config::Timings;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

type Reply<T> = oneshot::Sender<T>;

/// Everything the serial processor can be asked to do.
#[derive(Debug)]
pub enum Action {
    AddWorkload(Workload),
    UpdateWorkload(Workload),
    DeleteWorkload(WorkloadRef),
    AllWorkloads(Vec<Workload>),
    AddImage(Image),
    SetImagePriority {
        digest: Digest,
        priority: i32,
    },

    GetNextImageForBackendCheck(Reply<Option<Image>>),
    BackendCheckResult {
        digest: Digest,
        state: Option<ScanState>,
    },
    BackendCheckFailed(Digest),

    GetNextImageForScanning(Reply<Option<Image>>),
    ReportScanOutcome {
        digest: Digest,
        outcome: Result<(), String>,
    },

    GetRunningBackendScans(Reply<Vec<Image>>),
    BackendPollResult {
        digest: Digest,
        state: Option<ScanState>,
    },

    GetImagesNeedingRefresh {
        threshold: Duration,
        limit: usize,
        reply: Reply<Vec<Image>>,
    },
    RefreshResults {
        digest: Digest,
        result: ScanResult,
    },

    RequeueStalledScans,
    PruneOrphanedImages(Reply<Vec<Digest>>),
    ForgetImages(Vec<Digest>),

    SetConfig(scanherd_api::ConfigUpdate),

    GetAggregatedResults(Reply<scanherd_api::ScanResults>),
    GetMetrics(Reply<scanherd_api::Metrics>),
    GetModel(Reply<scanherd_api::Model>),
}

/// State owned by the processing loop.
pub struct Processor {
    pub model: Model,
    pub timings: watch::Sender<Timings>,
    pub metrics: Arc<dyn Metrics>,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddWorkload(_) => "AddWorkload",
            Self::UpdateWorkload(_) => "UpdateWorkload",
            Self::DeleteWorkload(_) => "DeleteWorkload",
            Self::AllWorkloads(_) => "AllWorkloads",
            Self::AddImage(_) => "AddImage",
            Self::SetImagePriority { .. } => "SetImagePriority",
            Self::GetNextImageForBackendCheck(_) => "GetNextImageForBackendCheck",
            Self::BackendCheckResult { .. } => "BackendCheckResult",
            Self::BackendCheckFailed(_) => "BackendCheckFailed",
            Self::GetNextImageForScanning(_) => "GetNextImageForScanning",
            Self::ReportScanOutcome { .. } => "ReportScanOutcome",
            Self::GetRunningBackendScans(_) => "GetRunningBackendScans",
            Self::BackendPollResult { .. } => "BackendPollResult",
            Self::GetImagesNeedingRefresh { .. } => "GetImagesNeedingRefresh",
            Self::RefreshResults { .. } => "RefreshResults",
            Self::RequeueStalledScans => "RequeueStalledScans",
            Self::PruneOrphanedImages(_) => "PruneOrphanedImages",
            Self::ForgetImages(_) => "ForgetImages",
            Self::SetConfig(_) => "SetConfig",
            Self::GetAggregatedResults(_) => "GetAggregatedResults",
            Self::GetMetrics(_) => "GetMetrics",
            Self::GetModel(_) => "GetModel",
        }
    }

    /// Apply the action. Failures are logged and dropped, never propagated.
    pub fn apply(self, processor: &mut Processor) {
        let name = self.name();
        let model = &mut processor.model;

        let result = match self {
            Self::AddWorkload(workload) => {
                model.add_workload(workload);
                Ok(())
            }
            Self::UpdateWorkload(workload) => {
                model.update_workload(workload);
                Ok(())
            }
            Self::DeleteWorkload(key) => model.delete_workload(&key),
            Self::AllWorkloads(workloads) => {
                model.set_all_workloads(workloads);
                Ok(())
            }
            Self::AddImage(image) => {
                model.add_image(image);
                Ok(())
            }
            Self::SetImagePriority { digest, priority } => {
                model.set_image_priority(&digest, priority)
            }

            Self::GetNextImageForBackendCheck(reply) => {
                send(name, reply, model.next_image_for_backend_check());
                Ok(())
            }
            Self::BackendCheckResult { digest, state } => {
                model.backend_check_result(&digest, state)
            }
            Self::BackendCheckFailed(digest) => model.backend_check_failed(&digest),

            Self::GetNextImageForScanning(reply) => {
                // hand the image back if nobody is waiting for it any more
                if let Some(image) = model.next_image_for_scanning() {
                    if let Err(Some(image)) = reply.send(Some(image)) {
                        debug!(digest = %image.digest, "Requester gone, requeueing");
                        if let Err(err) =
                            model.finish_scan_client(&image.digest, Err("requester gone".into()))
                        {
                            warn!("Failed to requeue: {err}");
                        }
                    }
                } else {
                    send(name, reply, None);
                }
                Ok(())
            }
            Self::ReportScanOutcome { digest, outcome } => {
                model.finish_scan_client(&digest, outcome)
            }

            Self::GetRunningBackendScans(reply) => {
                send(
                    name,
                    reply,
                    model.images_in_status(super::ScanStatus::RunningBackendScan),
                );
                Ok(())
            }
            Self::BackendPollResult { digest, state } => model.backend_poll_result(&digest, state),

            Self::GetImagesNeedingRefresh {
                threshold,
                limit,
                reply,
            } => {
                send(name, reply, model.images_needing_refresh(threshold, limit));
                Ok(())
            }
            Self::RefreshResults { digest, result } => model.refresh_results(&digest, result),

            Self::RequeueStalledScans => {
                model.requeue_stalled_scans();
                Ok(())
            }
            Self::PruneOrphanedImages(reply) => {
                send(name, reply, model.prune_orphaned_images());
                Ok(())
            }
            Self::ForgetImages(digests) => {
                let forgotten = model.forget_images(&digests);
                debug!(requested = digests.len(), forgotten = forgotten.len(), "Forgot images");
                Ok(())
            }

            Self::SetConfig(update) => {
                if let Some(limit) = update.concurrent_scan_limit {
                    model.set_concurrent_scan_limit(limit);
                }
                model.set_stalled_timeouts(
                    update
                        .stalled_scan_client_timeout_secs
                        .filter(|secs| *secs > 0)
                        .map(Duration::from_secs),
                    update
                        .stalled_backend_scan_timeout_secs
                        .filter(|secs| *secs > 0)
                        .map(Duration::from_secs),
                );
                processor.timings.send_modify(|timings| timings.apply(&update));
                Ok(())
            }

            Self::GetAggregatedResults(reply) => {
                send(name, reply, model.scan_results());
                Ok(())
            }
            Self::GetMetrics(reply) => {
                send(name, reply, model.metrics_snapshot());
                Ok(())
            }
            Self::GetModel(reply) => {
                send(name, reply, model.dump());
                Ok(())
            }
        };

        if let Err(err) = result {
            dropped(name, &err, processor.metrics.as_ref());
        }
    }
}

fn send<T>(action: &'static str, reply: Reply<T>, value: T) {
    if reply.send(value).is_err() {
        debug!(action, "Requester gone, dropping reply");
    }
}

fn dropped(action: &'static str, err: &ModelError, metrics: &dyn Metrics) {
    match err {
        ModelError::Inconsistent(_) => tracing::error!(action, "Dropped action: {err}"),
        _ => warn!(action, "Dropped action: {err}"),
    }
    metrics.record_dropped_action(action, &err.to_string());
}

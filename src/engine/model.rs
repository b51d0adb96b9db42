use super::queue::PriorityQueue;
use super::status::ScanStatus;
use crate::api::{
    Digest, Image, RepoTag, ScanResult, ScanState, Workload, WorkloadRef, DEFAULT_PRIORITY,
};
use crate::metrics::Metrics;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Number of transitions kept for diagnosis.
const MAX_TRANSITIONS: usize = 500;

/// Higher priority first, then first come, first served.
type QueuePriority = (i32, Reverse<u64>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown image: {0}")]
    UnknownImage(Digest),
    #[error("Unknown workload: {0}")]
    UnknownWorkload(WorkloadRef),
    #[error("Illegal transition of {digest}: {from} -> {to}")]
    IllegalTransition {
        digest: Digest,
        from: ScanStatus,
        to: ScanStatus,
    },
    #[error("Unexpected status of {digest}: expected {expected}, found {found}")]
    UnexpectedStatus {
        digest: Digest,
        expected: ScanStatus,
        found: ScanStatus,
    },
    #[error("Model inconsistency: {0}")]
    Inconsistent(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelConfig {
    pub concurrent_scan_limit: usize,
    pub stalled_scan_client_timeout: Duration,
    pub stalled_backend_scan_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            concurrent_scan_limit: 2,
            stalled_scan_client_timeout: Duration::from_secs(2 * 60 * 60),
            stalled_backend_scan_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Everything the model knows about one image.
#[derive(Clone, Debug)]
pub struct ImageInfo {
    pub digest: Digest,
    /// aliases, in order of discovery
    pub repo_tags: Vec<RepoTag>,
    pub priority: i32,
    pub status: ScanStatus,
    pub status_changed_at: Instant,
    pub results: Option<ScanResult>,
    pub results_refreshed_at: Option<Instant>,
}

impl ImageInfo {
    fn new(image: &Image) -> Self {
        Self {
            digest: image.digest.clone(),
            repo_tags: vec![image.repo_tag.clone()],
            priority: image.priority.unwrap_or(DEFAULT_PRIORITY),
            status: ScanStatus::Unknown,
            status_changed_at: Instant::now(),
            results: None,
            results_refreshed_at: None,
        }
    }

    /// The image, named by its first known alias.
    pub fn image(&self) -> Image {
        Image {
            digest: self.digest.clone(),
            repo_tag: self.repo_tags.first().cloned().unwrap_or_else(|| RepoTag {
                repository: self.digest.to_string(),
                tag: None,
            }),
            priority: Some(self.priority),
        }
    }

    pub fn time_in_current_status(&self) -> Duration {
        Instant::now().saturating_duration_since(self.status_changed_at)
    }
}

#[derive(Clone, Debug)]
pub struct TransitionRecord {
    pub digest: Digest,
    pub from: ScanStatus,
    pub to: ScanStatus,
    pub legal: bool,
    pub at: Instant,
}

/// The single owner of the orchestration state.
///
/// Queue membership of an image is derived from its status, and only changed by
/// [`Model::set_status`].
#[derive(Debug)]
pub struct Model {
    /// workloads, by `namespace/name`
    workloads: HashMap<WorkloadRef, Workload>,
    images: HashMap<Digest, ImageInfo>,

    /// images waiting to be looked up in the backend, FIFO
    check_queue: VecDeque<Digest>,
    /// images waiting for a scan client
    scan_queue: PriorityQueue<QueuePriority, Digest>,
    /// tie breaker for equal priorities
    enqueued: u64,

    transitions: VecDeque<TransitionRecord>,
    config: ModelConfig,
    metrics: Arc<dyn Metrics>,
}

impl Model {
    pub fn new(config: ModelConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            workloads: Default::default(),
            images: Default::default(),
            check_queue: Default::default(),
            scan_queue: Default::default(),
            enqueued: 0,
            transitions: Default::default(),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn set_concurrent_scan_limit(&mut self, limit: usize) {
        info!(from = self.config.concurrent_scan_limit, to = limit, "Concurrent scan limit");
        self.config.concurrent_scan_limit = limit;
    }

    pub fn set_stalled_timeouts(&mut self, scan_client: Option<Duration>, backend: Option<Duration>) {
        if let Some(timeout) = scan_client {
            self.config.stalled_scan_client_timeout = timeout;
        }
        if let Some(timeout) = backend {
            self.config.stalled_backend_scan_timeout = timeout;
        }
    }

    pub fn workload(&self, key: &WorkloadRef) -> Option<&Workload> {
        self.workloads.get(key)
    }

    pub fn workloads(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    pub fn image(&self, digest: &Digest) -> Option<&ImageInfo> {
        self.images.get(digest)
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageInfo> {
        self.images.values()
    }

    pub fn backend_check_queue(&self) -> impl Iterator<Item = &Digest> {
        self.check_queue.iter()
    }

    /// Entries of the scan queue, in no particular order.
    pub fn scan_queue(&self) -> impl Iterator<Item = (&Digest, i32)> {
        self.scan_queue.iter().map(|(_, (priority, _), digest)| (digest, *priority))
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.transitions.iter()
    }

    pub fn in_progress_count(&self) -> usize {
        self.images
            .values()
            .filter(|info| info.status.is_in_progress())
            .count()
    }

    pub fn images_in_status(&self, status: ScanStatus) -> Vec<Image> {
        self.images
            .values()
            .filter(|info| info.status == status)
            .map(ImageInfo::image)
            .collect()
    }

    // workloads

    /// Add a workload, replacing any workload with the same key.
    pub fn add_workload(&mut self, workload: Workload) {
        debug!(workload = %workload.key(), uid = %workload.uid, "Adding workload");

        for container in &workload.containers {
            self.add_image(container.image.clone());
        }

        self.workloads.insert(workload.key(), workload);
    }

    pub fn update_workload(&mut self, workload: Workload) {
        if !self.workloads.contains_key(&workload.key()) {
            debug!(workload = %workload.key(), "Updating unknown workload, adding it");
        }
        self.add_workload(workload);
    }

    /// Remove a workload. Its images stay until they get pruned.
    pub fn delete_workload(&mut self, key: &WorkloadRef) -> Result<(), ModelError> {
        match self.workloads.remove(key) {
            Some(_) => {
                debug!(workload = %key, "Deleted workload");
                Ok(())
            }
            None => Err(ModelError::UnknownWorkload(key.clone())),
        }
    }

    /// Replace the full set of workloads.
    pub fn set_all_workloads(&mut self, workloads: Vec<Workload>) {
        info!(count = workloads.len(), "Replacing all workloads");
        self.workloads.clear();
        for workload in workloads {
            self.add_workload(workload);
        }
    }

    // images

    /// Add an image, queueing it for a backend check if it is new.
    ///
    /// Returns `true` if the image was not known before.
    pub fn add_image(&mut self, image: Image) -> bool {
        if let Some(info) = self.images.get_mut(&image.digest) {
            if !info.repo_tags.contains(&image.repo_tag) {
                debug!(digest = %image.digest, name = %image.human_readable_name(), "New alias");
                info.repo_tags.push(image.repo_tag.clone());
            }
            let current = info.priority;
            if let Some(priority) = image.priority.filter(|p| *p > current) {
                if let Err(err) = self.set_image_priority(&image.digest, priority) {
                    error!(digest = %image.digest, "Failed to raise priority: {err}");
                }
            }
            return false;
        }

        self.create_image(&image);
        if let Err(err) = self.set_status(&image.digest, ScanStatus::InBackendCheckQueue) {
            error!(digest = %image.digest, "Failed to queue new image: {err}");
        }
        true
    }

    fn create_image(&mut self, image: &Image) {
        debug!(digest = %image.digest, name = %image.human_readable_name(), "Adding image");
        self.images
            .insert(image.digest.clone(), ImageInfo::new(image));
    }

    fn delete_image(&mut self, digest: &Digest) -> Result<(), ModelError> {
        let status = self
            .images
            .get(digest)
            .map(|info| info.status)
            .ok_or_else(|| ModelError::UnknownImage(digest.clone()))?;

        self.leave_state(digest, status);
        self.images.remove(digest);
        debug!(%digest, %status, "Deleted image");

        Ok(())
    }

    pub fn set_image_priority(&mut self, digest: &Digest, priority: i32) -> Result<(), ModelError> {
        let info = self
            .images
            .get_mut(digest)
            .ok_or_else(|| ModelError::UnknownImage(digest.clone()))?;

        self.metrics.record_priority_change(info.priority, priority);
        info.priority = priority;

        if let Some((_, seq)) = self.scan_queue.priority(digest).copied() {
            self.scan_queue
                .set(digest, (priority, seq))
                .map_err(|err| ModelError::Inconsistent(err.to_string()))?;
        }

        Ok(())
    }

    // state machine

    /// Move an image into a new status, keeping the queues in line.
    ///
    /// Illegal transitions and unknown images leave the model untouched.
    pub fn set_status(&mut self, digest: &Digest, to: ScanStatus) -> Result<(), ModelError> {
        let Some(from) = self.images.get(digest).map(|info| info.status) else {
            error!(%digest, %to, "Can't set status, unknown image");
            return Err(ModelError::UnknownImage(digest.clone()));
        };

        let legal = from.can_transition_to(to);
        self.record_transition(digest, from, to, legal);

        if !legal {
            warn!(%digest, %from, %to, "Illegal image state transition");
            return Err(ModelError::IllegalTransition {
                digest: digest.clone(),
                from,
                to,
            });
        }

        info!(%digest, %from, %to, "Image state transition");

        self.leave_state(digest, from);
        self.enter_state(digest, to);

        if let Some(info) = self.images.get_mut(digest) {
            info.status = to;
            info.status_changed_at = Instant::now();
        }

        Ok(())
    }

    fn record_transition(&mut self, digest: &Digest, from: ScanStatus, to: ScanStatus, legal: bool) {
        self.metrics.record_transition(from, to, legal);

        if self.transitions.len() >= MAX_TRANSITIONS {
            self.transitions.pop_front();
        }
        self.transitions.push_back(TransitionRecord {
            digest: digest.clone(),
            from,
            to,
            legal,
            at: Instant::now(),
        });
    }

    fn leave_state(&mut self, digest: &Digest, status: ScanStatus) {
        match status {
            ScanStatus::InBackendCheckQueue => {
                match self.check_queue.iter().position(|d| d == digest) {
                    Some(index) => {
                        self.check_queue.remove(index);
                    }
                    None => error!(%digest, "Model inconsistency: not in backend check queue"),
                }
            }
            ScanStatus::InScanQueue => {
                if let Err(err) = self.scan_queue.remove(digest) {
                    error!(%digest, "Model inconsistency: {err}");
                }
            }
            ScanStatus::Unknown
            | ScanStatus::RunningScanClient
            | ScanStatus::RunningBackendScan
            | ScanStatus::Complete => {}
        }
    }

    fn enter_state(&mut self, digest: &Digest, status: ScanStatus) {
        match status {
            ScanStatus::InBackendCheckQueue => {
                self.check_queue.push_back(digest.clone());
            }
            ScanStatus::InScanQueue => {
                let priority = self
                    .images
                    .get(digest)
                    .map(|info| info.priority)
                    .unwrap_or(DEFAULT_PRIORITY);
                self.enqueued += 1;
                let key = (priority, Reverse(self.enqueued));
                if let Err(err) = self.scan_queue.add(digest.to_string(), key, digest.clone()) {
                    error!(%digest, "Model inconsistency: {err}");
                }
            }
            ScanStatus::Unknown
            | ScanStatus::RunningScanClient
            | ScanStatus::RunningBackendScan
            | ScanStatus::Complete => {}
        }
    }

    fn expect_status(&self, digest: &Digest, expected: ScanStatus) -> Result<(), ModelError> {
        let info = self
            .images
            .get(digest)
            .ok_or_else(|| ModelError::UnknownImage(digest.clone()))?;

        if info.status != expected {
            return Err(ModelError::UnexpectedStatus {
                digest: digest.clone(),
                expected,
                found: info.status,
            });
        }

        Ok(())
    }

    fn store_results(&mut self, digest: &Digest, result: ScanResult) {
        if let Some(info) = self.images.get_mut(digest) {
            info.results = Some(result);
            info.results_refreshed_at = Some(Instant::now());
        }
    }

    // backend check

    /// The image at the front of the backend check queue. It stays queued.
    pub fn next_image_for_backend_check(&self) -> Option<Image> {
        let digest = self.check_queue.front()?;
        match self.images.get(digest) {
            Some(info) => Some(info.image()),
            None => {
                error!(%digest, "Model inconsistency: queued for backend check but unknown");
                None
            }
        }
    }

    /// The check could not be performed. Moves the image to the back of the queue.
    pub fn backend_check_failed(&mut self, digest: &Digest) -> Result<(), ModelError> {
        self.expect_status(digest, ScanStatus::InBackendCheckQueue)?;

        if let Some(index) = self.check_queue.iter().position(|d| d == digest) {
            self.check_queue.remove(index);
            self.check_queue.push_back(digest.clone());
        }

        Ok(())
    }

    /// Apply the answer of the initial "was it already scanned?" check.
    pub fn backend_check_result(
        &mut self,
        digest: &Digest,
        state: Option<ScanState>,
    ) -> Result<(), ModelError> {
        self.expect_status(digest, ScanStatus::InBackendCheckQueue)?;

        match state {
            None => {
                debug!(%digest, "Not known to backend, needs scanning");
                self.set_status(digest, ScanStatus::InScanQueue)
            }
            Some(ScanState::Failed) => {
                info!(%digest, "Found failed scan, rescanning");
                self.set_status(digest, ScanStatus::InScanQueue)
            }
            Some(ScanState::InProgress) => {
                info!(%digest, "Found running scan");
                self.set_status(digest, ScanStatus::RunningBackendScan)
            }
            Some(ScanState::Complete(result)) => {
                info!(%digest, ?result, "Found finished scan");
                self.store_results(digest, result);
                self.set_status(digest, ScanStatus::Complete)
            }
        }
    }

    // scanning

    /// Hand out the next image to scan, unless the concurrency limit is reached.
    pub fn next_image_for_scanning(&mut self) -> Option<Image> {
        let in_progress = self.in_progress_count();
        let limit = self.config.concurrent_scan_limit;

        if in_progress >= limit {
            debug!(in_progress, limit, "Concurrent scan limit reached");
            self.metrics.record_admission(false, in_progress, limit);
            return None;
        }

        let digest = self.scan_queue.peek().cloned()?;

        if let Err(err) = self.set_status(&digest, ScanStatus::RunningScanClient) {
            error!(%digest, "Failed to start scan: {err}");
            return None;
        }
        self.metrics.record_admission(true, in_progress + 1, limit);

        self.images.get(&digest).map(ImageInfo::image)
    }

    /// Record the outcome of running the scan client on an image.
    pub fn finish_scan_client(
        &mut self,
        digest: &Digest,
        outcome: Result<(), String>,
    ) -> Result<(), ModelError> {
        self.expect_status(digest, ScanStatus::RunningScanClient)?;

        match outcome {
            Ok(()) => self.set_status(digest, ScanStatus::RunningBackendScan),
            Err(err) => {
                warn!(%digest, "Scan client failed: {err}");
                self.set_status(digest, ScanStatus::InScanQueue)
            }
        }
    }

    /// Apply the answer of polling the backend for a running scan.
    pub fn backend_poll_result(
        &mut self,
        digest: &Digest,
        state: Option<ScanState>,
    ) -> Result<(), ModelError> {
        self.expect_status(digest, ScanStatus::RunningBackendScan)?;

        match state {
            None | Some(ScanState::InProgress) => {
                debug!(%digest, "Backend scan not finished yet");
                Ok(())
            }
            Some(ScanState::Failed) => {
                warn!(%digest, "Backend scan failed, requeueing");
                self.set_status(digest, ScanStatus::InScanQueue)
            }
            Some(ScanState::Complete(result)) => {
                info!(%digest, ?result, "Backend scan finished");
                self.store_results(digest, result);
                self.set_status(digest, ScanStatus::Complete)
            }
        }
    }

    // refresh

    /// Completed images with results older than `threshold`, oldest first.
    pub fn images_needing_refresh(&self, threshold: Duration, limit: usize) -> Vec<Image> {
        let now = Instant::now();
        let mut stale: Vec<_> = self
            .images
            .values()
            .filter(|info| info.status == ScanStatus::Complete)
            .filter_map(|info| {
                let refreshed = info.results_refreshed_at?;
                (now.saturating_duration_since(refreshed) >= threshold).then_some((refreshed, info))
            })
            .collect();

        stale.sort_by_key(|(refreshed, _)| *refreshed);
        stale
            .into_iter()
            .take(limit)
            .map(|(_, info)| info.image())
            .collect()
    }

    pub fn refresh_results(&mut self, digest: &Digest, result: ScanResult) -> Result<(), ModelError> {
        self.expect_status(digest, ScanStatus::Complete)?;
        debug!(%digest, ?result, "Refreshed results");
        self.store_results(digest, result);
        Ok(())
    }

    // housekeeping

    /// Put images stuck in a running status for too long back into the scan queue.
    pub fn requeue_stalled_scans(&mut self) -> Vec<Digest> {
        let stalled: Vec<Digest> = self
            .images
            .values()
            .filter(|info| match info.status {
                ScanStatus::RunningScanClient => {
                    info.time_in_current_status() > self.config.stalled_scan_client_timeout
                }
                ScanStatus::RunningBackendScan => {
                    info.time_in_current_status() > self.config.stalled_backend_scan_timeout
                }
                _ => false,
            })
            .map(|info| info.digest.clone())
            .collect();

        for digest in &stalled {
            warn!(%digest, "Requeueing stalled scan");
            if let Err(err) = self.set_status(digest, ScanStatus::InScanQueue) {
                error!(%digest, "Failed to requeue stalled scan: {err}");
            }
        }

        stalled
    }

    fn referenced_images(&self) -> HashSet<&Digest> {
        self.workloads
            .values()
            .flat_map(|w| w.containers.iter().map(|c| &c.image.digest))
            .collect()
    }

    /// Drop images no workload references any more.
    ///
    /// Unknown and queued images are deleted. Completed ones are returned, for deferred
    /// cleanup. Running scans are left alone.
    pub fn prune_orphaned_images(&mut self) -> Vec<Digest> {
        let referenced = self.referenced_images();

        let mut delete = Vec::new();
        let mut completed = Vec::new();

        for info in self.images.values() {
            if referenced.contains(&info.digest) {
                continue;
            }
            match info.status {
                ScanStatus::Unknown | ScanStatus::InScanQueue => delete.push(info.digest.clone()),
                ScanStatus::Complete => completed.push(info.digest.clone()),
                ScanStatus::InBackendCheckQueue
                | ScanStatus::RunningScanClient
                | ScanStatus::RunningBackendScan => {}
            }
        }

        for digest in &delete {
            if let Err(err) = self.delete_image(digest) {
                error!(%digest, "Failed to delete orphaned image: {err}");
            }
        }

        if !delete.is_empty() || !completed.is_empty() {
            info!(
                deleted = delete.len(),
                completed = completed.len(),
                "Pruned orphaned images"
            );
        }

        completed
    }

    /// Delete completed images which are still not referenced. Returns the deleted ones.
    pub fn forget_images(&mut self, digests: &[Digest]) -> Vec<Digest> {
        let referenced: HashSet<Digest> = self.referenced_images().into_iter().cloned().collect();

        let forget: Vec<Digest> = digests
            .iter()
            .filter(|digest| !referenced.contains(*digest))
            .filter(|digest| {
                self.images
                    .get(*digest)
                    .is_some_and(|info| info.status == ScanStatus::Complete)
            })
            .cloned()
            .collect();

        for digest in &forget {
            if let Err(err) = self.delete_image(digest) {
                error!(%digest, "Failed to forget image: {err}");
            }
        }

        forget
    }

    /// Check that queue membership matches the status of every image.
    #[cfg(test)]
    pub fn check_consistency(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for info in self.images.values() {
            let in_check = self.check_queue.contains(&info.digest);
            let in_scan = self.scan_queue.has_key(&info.digest);
            let expected = (
                info.status == ScanStatus::InBackendCheckQueue,
                info.status == ScanStatus::InScanQueue,
            );
            if (in_check, in_scan) != expected {
                errors.push(format!(
                    "{} in status {} has queue membership {:?}",
                    info.digest,
                    info.status,
                    (in_check, in_scan)
                ));
            }
        }

        if self.check_queue.len() + self.scan_queue.len()
            != self
                .images
                .values()
                .filter(|i| {
                    matches!(
                        i.status,
                        ScanStatus::InBackendCheckQueue | ScanStatus::InScanQueue
                    )
                })
                .count()
        {
            errors.push("queues hold entries without a matching image".into());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Container, PolicyStatus};
    use crate::metrics::{NoopMetrics, RecordingMetrics};
    use proptest::prelude::*;

    fn model(limit: usize) -> Model {
        Model::new(
            ModelConfig {
                concurrent_scan_limit: limit,
                ..Default::default()
            },
            Arc::new(NoopMetrics),
        )
    }

    fn image(sha: &str) -> Image {
        Image::new(format!("repo/{sha}"), sha)
    }

    fn workload(name: &str, shas: &[&str]) -> Workload {
        Workload {
            namespace: "default".into(),
            name: name.into(),
            uid: format!("uid-{name}"),
            containers: shas
                .iter()
                .enumerate()
                .map(|(i, sha)| Container {
                    image: image(sha),
                    name: format!("c{i}"),
                })
                .collect(),
        }
    }

    fn digest(sha: &str) -> Digest {
        Digest::from(sha)
    }

    fn status(model: &Model, sha: &str) -> Option<ScanStatus> {
        model.image(&digest(sha)).map(|i| i.status)
    }

    /// Drive a freshly added image into `target`, along legal transitions.
    fn drive(model: &mut Model, sha: &str, target: ScanStatus) {
        use ScanStatus::*;
        let d = digest(sha);
        let path: &[ScanStatus] = match target {
            Unknown => {
                model.create_image(&image(sha));
                return;
            }
            InBackendCheckQueue => &[],
            InScanQueue => &[InScanQueue],
            RunningScanClient => &[InScanQueue, RunningScanClient],
            RunningBackendScan => &[RunningBackendScan],
            Complete => &[Complete],
        };
        model.add_image(image(sha));
        for step in path {
            model.set_status(&d, *step).unwrap();
        }
    }

    #[test]
    fn new_image_goes_to_backend_check_queue() {
        let mut model = model(1);
        assert!(model.add_image(image("sha1")));
        assert!(!model.add_image(image("sha1")));

        assert_eq!(status(&model, "sha1"), Some(ScanStatus::InBackendCheckQueue));
        assert_eq!(
            model.backend_check_queue().collect::<Vec<_>>(),
            vec![&digest("sha1")]
        );
        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn aliases_are_merged() {
        let mut model = model(1);
        model.add_image(Image::new("docker.io/nginx", "sha1").with_tag("1"));
        model.add_image(Image::new("quay.io/nginx", "sha1").with_tag("1"));
        model.add_image(Image::new("docker.io/nginx", "sha1").with_tag("1"));

        let info = model.image(&digest("sha1")).unwrap();
        assert_eq!(info.repo_tags.len(), 2);
        assert_eq!(info.image().repo_tag.repository, "docker.io/nginx");
        assert_eq!(model.images().count(), 1);
    }

    #[test]
    fn unknown_image_is_rejected() {
        let metrics = Arc::new(RecordingMetrics::default());
        let mut model = Model::new(ModelConfig::default(), metrics.clone());

        assert_eq!(
            model.set_status(&digest("nope"), ScanStatus::InScanQueue),
            Err(ModelError::UnknownImage(digest("nope")))
        );
        assert!(metrics.transitions.lock().is_empty());
        assert_eq!(model.images().count(), 0);
    }

    #[test]
    fn illegal_transition_is_recorded_and_rejected() {
        let metrics = Arc::new(RecordingMetrics::default());
        let mut model = Model::new(ModelConfig::default(), metrics.clone());
        model.add_image(image("sha1"));

        let result = model.set_status(&digest("sha1"), ScanStatus::RunningScanClient);
        assert!(matches!(result, Err(ModelError::IllegalTransition { .. })));
        assert_eq!(status(&model, "sha1"), Some(ScanStatus::InBackendCheckQueue));
        assert!(model.check_consistency().is_empty());

        let transitions = metrics.transitions.lock();
        assert_eq!(
            *transitions,
            vec![
                (ScanStatus::Unknown, ScanStatus::InBackendCheckQueue, true),
                (
                    ScanStatus::InBackendCheckQueue,
                    ScanStatus::RunningScanClient,
                    false
                ),
            ]
        );
        assert_eq!(model.transitions().count(), 2);
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut model = model(1);
        model.add_workload(workload("pod", &["sha1"]));
        assert_eq!(status(&model, "sha1"), Some(ScanStatus::InBackendCheckQueue));

        let next = model.next_image_for_backend_check().unwrap();
        assert_eq!(next.digest, digest("sha1"));

        model.backend_check_result(&digest("sha1"), None).unwrap();
        assert_eq!(status(&model, "sha1"), Some(ScanStatus::InScanQueue));

        let next = model.next_image_for_scanning().unwrap();
        assert_eq!(next.digest, digest("sha1"));
        assert_eq!(status(&model, "sha1"), Some(ScanStatus::RunningScanClient));
        assert_eq!(model.scan_queue().count(), 0);

        model.finish_scan_client(&digest("sha1"), Ok(())).unwrap();
        assert_eq!(status(&model, "sha1"), Some(ScanStatus::RunningBackendScan));

        model
            .backend_poll_result(&digest("sha1"), Some(ScanState::Complete(ScanResult::clean())))
            .unwrap();
        assert_eq!(status(&model, "sha1"), Some(ScanStatus::Complete));

        let result = model
            .workload_result(&WorkloadRef::new("default", "pod"))
            .unwrap()
            .unwrap();
        assert_eq!(result.overall_status, PolicyStatus::NotInViolation);
        assert_eq!(result.policy_violations, 0);
        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn backend_check_outcomes() {
        let mut model = model(5);
        for sha in ["a", "b", "c", "d"] {
            model.add_image(image(sha));
        }

        model
            .backend_check_result(&digest("a"), Some(ScanState::InProgress))
            .unwrap();
        model
            .backend_check_result(&digest("b"), Some(ScanState::Failed))
            .unwrap();
        let result = ScanResult {
            overall_status: PolicyStatus::InViolation,
            policy_violations: 1,
            vulnerabilities: 7,
        };
        model
            .backend_check_result(&digest("c"), Some(ScanState::Complete(result)))
            .unwrap();

        assert_eq!(status(&model, "a"), Some(ScanStatus::RunningBackendScan));
        assert_eq!(status(&model, "b"), Some(ScanStatus::InScanQueue));
        assert_eq!(status(&model, "c"), Some(ScanStatus::Complete));
        assert_eq!(model.image(&digest("c")).unwrap().results, Some(result));
        assert_eq!(status(&model, "d"), Some(ScanStatus::InBackendCheckQueue));

        // late duplicate answer
        assert!(matches!(
            model.backend_check_result(&digest("c"), None),
            Err(ModelError::UnexpectedStatus { .. })
        ));
        assert_eq!(status(&model, "c"), Some(ScanStatus::Complete));
        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn failed_check_rotates_queue() {
        let mut model = model(1);
        model.add_image(image("a"));
        model.add_image(image("b"));

        model.backend_check_failed(&digest("a")).unwrap();

        assert_eq!(
            model.next_image_for_backend_check().map(|i| i.digest),
            Some(digest("b"))
        );
        assert_eq!(status(&model, "a"), Some(ScanStatus::InBackendCheckQueue));
        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn failed_scan_client_requeues() {
        let mut model = model(1);
        drive(&mut model, "sha1", ScanStatus::RunningScanClient);

        model
            .finish_scan_client(&digest("sha1"), Err("pull failed".into()))
            .unwrap();
        assert_eq!(status(&model, "sha1"), Some(ScanStatus::InScanQueue));
        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn poll_failures_and_unknowns() {
        let mut model = model(2);
        drive(&mut model, "a", ScanStatus::RunningBackendScan);

        model.backend_poll_result(&digest("a"), None).unwrap();
        model
            .backend_poll_result(&digest("a"), Some(ScanState::InProgress))
            .unwrap();
        assert_eq!(status(&model, "a"), Some(ScanStatus::RunningBackendScan));

        model
            .backend_poll_result(&digest("a"), Some(ScanState::Failed))
            .unwrap();
        assert_eq!(status(&model, "a"), Some(ScanStatus::InScanQueue));

        assert_eq!(
            model.backend_poll_result(&digest("zzz"), None),
            Err(ModelError::UnknownImage(digest("zzz")))
        );
    }

    #[test]
    fn concurrency_limit_is_enforced() {
        let metrics = Arc::new(RecordingMetrics::default());
        let mut model = Model::new(
            ModelConfig {
                concurrent_scan_limit: 2,
                ..Default::default()
            },
            metrics.clone(),
        );
        for sha in ["a", "b", "c"] {
            drive(&mut model, sha, ScanStatus::InScanQueue);
        }

        assert!(model.next_image_for_scanning().is_some());
        assert!(model.next_image_for_scanning().is_some());
        assert!(model.next_image_for_scanning().is_none());
        assert_eq!(model.in_progress_count(), 2);
        assert_eq!(*metrics.admissions.lock(), vec![true, true, false]);

        model.set_concurrent_scan_limit(3);
        assert!(model.next_image_for_scanning().is_some());
        // queue empty now
        assert!(model.next_image_for_scanning().is_none());
    }

    #[test]
    fn scan_queue_order_is_priority_then_fifo() {
        let mut model = model(10);
        drive(&mut model, "first", ScanStatus::InScanQueue);
        drive(&mut model, "second", ScanStatus::InScanQueue);
        model.add_image(image("urgent").with_priority(5));
        model
            .set_status(&digest("urgent"), ScanStatus::InScanQueue)
            .unwrap();
        drive(&mut model, "third", ScanStatus::InScanQueue);

        model.set_image_priority(&digest("third"), 3).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| model.next_image_for_scanning())
            .map(|i| i.digest.to_string())
            .collect();
        assert_eq!(order, vec!["urgent", "third", "first", "second"]);
    }

    #[test]
    fn re_adding_with_higher_priority_bumps_queue() {
        let mut model = model(10);
        drive(&mut model, "a", ScanStatus::InScanQueue);
        drive(&mut model, "b", ScanStatus::InScanQueue);

        model.add_image(image("b").with_priority(9));
        // lower priorities never demote
        model.add_image(image("b").with_priority(0));

        assert_eq!(model.image(&digest("b")).unwrap().priority, 9);
        assert_eq!(
            model.next_image_for_scanning().map(|i| i.digest),
            Some(digest("b"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_scan_recovery() {
        let mut model = Model::new(
            ModelConfig {
                concurrent_scan_limit: 5,
                stalled_scan_client_timeout: Duration::from_secs(60),
                stalled_backend_scan_timeout: Duration::from_secs(600),
            },
            Arc::new(NoopMetrics),
        );
        drive(&mut model, "client", ScanStatus::RunningScanClient);
        drive(&mut model, "backend", ScanStatus::RunningBackendScan);

        assert!(model.requeue_stalled_scans().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(model.requeue_stalled_scans(), vec![digest("client")]);
        assert_eq!(status(&model, "client"), Some(ScanStatus::InScanQueue));
        assert_eq!(status(&model, "backend"), Some(ScanStatus::RunningBackendScan));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(model.requeue_stalled_scans(), vec![digest("backend")]);
        assert_eq!(status(&model, "backend"), Some(ScanStatus::InScanQueue));
        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn orphan_pruning() {
        for (target, deleted, reported) in [
            (ScanStatus::InScanQueue, true, false),
            (ScanStatus::Unknown, true, false),
            (ScanStatus::RunningScanClient, false, false),
            (ScanStatus::RunningBackendScan, false, false),
            (ScanStatus::InBackendCheckQueue, false, false),
            (ScanStatus::Complete, false, true),
        ] {
            let mut model = model(5);
            drive(&mut model, "orphan", target);
            model.add_workload(workload("pod", &["kept"]));
            drive(&mut model, "kept-queued", ScanStatus::InScanQueue);
            model.add_workload(workload("other", &["kept-queued"]));

            let completed = model.prune_orphaned_images();

            assert_eq!(status(&model, "orphan").is_none(), deleted, "{target}");
            assert_eq!(completed.contains(&digest("orphan")), reported, "{target}");
            assert!(status(&model, "kept").is_some());
            assert!(status(&model, "kept-queued").is_some());
            assert!(model.check_consistency().is_empty(), "{target}");
        }
    }

    #[test]
    fn forget_only_unreferenced_completed() {
        let mut model = model(5);
        drive(&mut model, "done", ScanStatus::Complete);
        drive(&mut model, "queued", ScanStatus::InScanQueue);
        model.add_workload(workload("pod", &["used"]));
        model
            .set_status(&digest("used"), ScanStatus::Complete)
            .unwrap();

        let forgotten =
            model.forget_images(&[digest("done"), digest("queued"), digest("used")]);

        assert_eq!(forgotten, vec![digest("done")]);
        assert!(status(&model, "done").is_none());
        assert!(status(&model, "queued").is_some());
        assert!(status(&model, "used").is_some());
    }

    #[test]
    fn workloads_are_replaced_and_deleted() {
        let mut model = model(1);
        model.add_workload(workload("pod", &["a"]));
        model.update_workload(workload("pod", &["a", "b"]));

        let key = WorkloadRef::new("default", "pod");
        assert_eq!(model.workload(&key).unwrap().containers.len(), 2);
        assert!(status(&model, "b").is_some());

        model.delete_workload(&key).unwrap();
        assert_eq!(
            model.delete_workload(&key),
            Err(ModelError::UnknownWorkload(key))
        );
        // images are left for pruning
        assert_eq!(model.images().count(), 2);

        model.set_all_workloads(vec![workload("x", &["c"]), workload("y", &["a"])]);
        assert_eq!(model.workloads().count(), 2);
        assert_eq!(model.images().count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_picks_oldest_completed() {
        let mut model = model(5);
        drive(&mut model, "old", ScanStatus::InBackendCheckQueue);
        model
            .backend_check_result(&digest("old"), Some(ScanState::Complete(ScanResult::clean())))
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        drive(&mut model, "new", ScanStatus::InBackendCheckQueue);
        model
            .backend_check_result(&digest("new"), Some(ScanState::Complete(ScanResult::clean())))
            .unwrap();

        assert!(model
            .images_needing_refresh(Duration::from_secs(30), 10)
            .is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        let stale = model.images_needing_refresh(Duration::from_secs(30), 10);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].digest, digest("old"));

        let updated = ScanResult {
            overall_status: PolicyStatus::InViolation,
            policy_violations: 4,
            vulnerabilities: 2,
        };
        model.refresh_results(&digest("old"), updated).unwrap();
        assert_eq!(model.image(&digest("old")).unwrap().results, Some(updated));
        assert!(model
            .images_needing_refresh(Duration::from_secs(30), 10)
            .is_empty());
    }

    fn any_status() -> impl Strategy<Value = ScanStatus> {
        prop::sample::select(ScanStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn set_status_is_sound(
            statuses in prop::collection::vec(any_status(), 1..8),
            target in 0usize..8,
            to in any_status(),
        ) {
            let mut model = model(100);
            for (i, status) in statuses.iter().enumerate() {
                drive(&mut model, &format!("img{i}"), *status);
            }
            let target = target % statuses.len();
            let d = digest(&format!("img{target}"));

            let before: HashMap<Digest, ScanStatus> =
                model.images().map(|i| (i.digest.clone(), i.status)).collect();
            let from = before[&d];

            let result = model.set_status(&d, to);

            if from.can_transition_to(to) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(status(&model, &d), Some(to));
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(status(&model, &d), Some(from));
            }

            for (other, status) in &before {
                if other != &d {
                    prop_assert_eq!(model.image(other).map(|i| i.status), Some(*status));
                }
            }
            let errors = model.check_consistency();
            prop_assert!(errors.is_empty(), "{:?}", errors);
        }
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u8),
        NotFound(u8),
        Dequeue,
        Finish(u8, bool),
        Complete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Add),
            (0u8..16).prop_map(Op::NotFound),
            Just(Op::Dequeue),
            (0u8..16, any::<bool>()).prop_map(|(k, ok)| Op::Finish(k, ok)),
            (0u8..16).prop_map(Op::Complete),
        ]
    }

    proptest! {
        #[test]
        fn admission_never_exceeds_limit(
            limit in 1usize..4,
            ops in prop::collection::vec(op(), 0..200),
        ) {
            let mut model = model(limit);

            for op in ops {
                // rejected operations are part of the fuzzing
                match op {
                    Op::Add(k) => {
                        model.add_image(image(&k.to_string()));
                    }
                    Op::NotFound(k) => {
                        let _ = model.backend_check_result(&digest(&k.to_string()), None);
                    }
                    Op::Dequeue => {
                        model.next_image_for_scanning();
                    }
                    Op::Finish(k, ok) => {
                        let outcome = if ok { Ok(()) } else { Err("failed".to_string()) };
                        let _ = model.finish_scan_client(&digest(&k.to_string()), outcome);
                    }
                    Op::Complete(k) => {
                        let _ = model.backend_poll_result(
                            &digest(&k.to_string()),
                            Some(ScanState::Complete(ScanResult::clean())),
                        );
                    }
                }

                prop_assert!(model.in_progress_count() <= limit);
                let errors = model.check_consistency();
                prop_assert!(errors.is_empty(), "{:?}", errors);
            }
        }
    }
}

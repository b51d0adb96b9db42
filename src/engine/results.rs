use super::model::{ImageInfo, Model, ModelError};
use super::status::ScanStatus;
use crate::api::{Digest, ScanResult, WorkloadRef};
use std::collections::{BTreeMap, HashMap};
use tracing::error;

/// Histogram key for "no results yet".
const UNKNOWN_BUCKET: i64 = -1;
const UNKNOWN_STATUS: &str = "UNKNOWN";

impl Model {
    /// Results of a single image, `None` until it is scanned.
    pub fn image_result(&self, digest: &Digest) -> Result<Option<ScanResult>, ModelError> {
        let info = self
            .image(digest)
            .ok_or_else(|| ModelError::UnknownImage(digest.clone()))?;
        stored_result(info)
    }

    /// Worst-case roll-up over all images of a workload.
    ///
    /// `None` as long as any of its images is not scanned yet.
    pub fn workload_result(&self, key: &WorkloadRef) -> Result<Option<ScanResult>, ModelError> {
        let workload = self
            .workload(key)
            .ok_or_else(|| ModelError::UnknownWorkload(key.clone()))?;

        let mut result = ScanResult::clean();
        for container in &workload.containers {
            match self.image_result(&container.image.digest)? {
                Some(image) => result = result.combine(image),
                None => return Ok(None),
            }
        }

        Ok(Some(result))
    }

    /// Results of all fully scanned workloads and images.
    pub fn scan_results(&self) -> scanherd_api::ScanResults {
        let mut workloads = Vec::new();
        for workload in self.workloads() {
            match self.workload_result(&workload.key()) {
                Ok(Some(result)) => workloads.push(scanherd_api::ScannedWorkload {
                    namespace: workload.namespace.clone(),
                    name: workload.name.clone(),
                    policy_violations: result.policy_violations,
                    vulnerabilities: result.vulnerabilities,
                    overall_status: result.overall_status,
                }),
                Ok(None) => {}
                Err(err) => error!(workload = %workload.key(), "Unable to aggregate results: {err}"),
            }
        }
        workloads.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        let mut images = Vec::new();
        for info in self.images() {
            let result = match stored_result(info) {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(err) => {
                    error!(digest = %info.digest, "Unable to report results: {err}");
                    continue;
                }
            };
            for repo_tag in &info.repo_tags {
                images.push(scanherd_api::ScannedImage {
                    repository: repo_tag.repository.clone(),
                    tag: repo_tag.tag.clone(),
                    sha: info.digest.to_string(),
                    policy_violations: result.policy_violations,
                    vulnerabilities: result.vulnerabilities,
                    overall_status: result.overall_status,
                });
            }
        }
        images.sort_by(|a, b| (&a.sha, &a.repository, &a.tag).cmp(&(&b.sha, &b.repository, &b.tag)));

        scanherd_api::ScanResults { workloads, images }
    }

    /// Counters of the current state. The breaker status is filled in by the caller.
    pub fn metrics_snapshot(&self) -> scanherd_api::Metrics {
        let mut metrics = scanherd_api::Metrics {
            number_of_workloads: self.workloads().count(),
            number_of_images: self.images().count(),
            in_progress_scans: self.in_progress_count(),
            concurrent_scan_limit: self.config().concurrent_scan_limit,
            scan_queue_length: self.scan_queue().count(),
            backend_check_queue_length: self.backend_check_queue().count(),
            ..Default::default()
        };

        for status in ScanStatus::ALL {
            metrics.scan_status_counts.insert(status.to_string(), 0);
        }

        let mut references: HashMap<&Digest, usize> = HashMap::new();
        for workload in self.workloads() {
            *metrics
                .container_counts
                .entry(workload.containers.len())
                .or_default() += 1;
            for container in &workload.containers {
                *references.entry(&container.image.digest).or_default() += 1;
            }

            let result = self.workload_result(&workload.key()).ok().flatten();
            record_result(
                result,
                &mut metrics.workload_status,
                &mut metrics.workload_policy_violations,
                &mut metrics.workload_vulnerabilities,
            );
        }

        for info in self.images() {
            *metrics
                .scan_status_counts
                .entry(info.status.to_string())
                .or_default() += 1;
            *metrics
                .image_reference_counts
                .entry(references.get(&info.digest).copied().unwrap_or_default())
                .or_default() += 1;

            record_result(
                stored_result(info).ok().flatten(),
                &mut metrics.image_status,
                &mut metrics.image_policy_violations,
                &mut metrics.image_vulnerabilities,
            );
        }

        metrics
    }

    /// A full dump of the state, for debugging.
    pub fn dump(&self) -> scanherd_api::Model {
        let workloads: BTreeMap<String, scanherd_api::Workload> = self
            .workloads()
            .map(|w| (w.key().to_string(), w.clone().into()))
            .collect();

        let images = self
            .images()
            .map(|info| {
                let results = info.results;
                (
                    info.digest.to_string(),
                    scanherd_api::ModelImage {
                        sha: info.digest.to_string(),
                        repo_tags: info
                            .repo_tags
                            .iter()
                            .map(|rt| scanherd_api::RepoTag {
                                repository: rt.repository.clone(),
                                tag: rt.tag.clone(),
                            })
                            .collect(),
                        scan_status: info.status.to_string(),
                        priority: info.priority,
                        secs_in_current_status: info.time_in_current_status().as_secs(),
                        policy_violations: results.map(|r| r.policy_violations),
                        vulnerabilities: results.map(|r| r.vulnerabilities),
                        overall_status: results.map(|r| r.overall_status),
                    },
                )
            })
            .collect();

        let mut scan_queue: Vec<_> = self
            .scan_queue()
            .map(|(digest, priority)| scanherd_api::QueueEntry {
                sha: digest.to_string(),
                priority,
            })
            .collect();
        scan_queue.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.sha.cmp(&b.sha)));

        let now = tokio::time::Instant::now();
        let transitions = self
            .transitions()
            .map(|t| scanherd_api::Transition {
                sha: t.digest.to_string(),
                from: t.from.to_string(),
                to: t.to.to_string(),
                legal: t.legal,
                secs_ago: now.saturating_duration_since(t.at).as_secs(),
            })
            .collect();

        scanherd_api::Model {
            workloads,
            images,
            scan_queue,
            backend_check_queue: self.backend_check_queue().map(|d| d.to_string()).collect(),
            transitions,
            concurrent_scan_limit: self.config().concurrent_scan_limit,
        }
    }
}

fn stored_result(info: &ImageInfo) -> Result<Option<ScanResult>, ModelError> {
    if info.status != ScanStatus::Complete {
        return Ok(None);
    }
    match info.results {
        Some(result) => Ok(Some(result)),
        None => {
            error!(digest = %info.digest, "Model inconsistency: complete, but no results");
            Err(ModelError::Inconsistent(format!(
                "{} is complete without results",
                info.digest
            )))
        }
    }
}

fn record_result(
    result: Option<ScanResult>,
    status: &mut BTreeMap<String, usize>,
    violations: &mut BTreeMap<i64, usize>,
    vulnerabilities: &mut BTreeMap<i64, usize>,
) {
    let (name, v, vulns) = match result {
        Some(result) => (
            result.overall_status.to_string(),
            i64::from(result.policy_violations),
            i64::from(result.vulnerabilities),
        ),
        None => (UNKNOWN_STATUS.to_string(), UNKNOWN_BUCKET, UNKNOWN_BUCKET),
    };
    *status.entry(name).or_default() += 1;
    *violations.entry(v).or_default() += 1;
    *vulnerabilities.entry(vulns).or_default() += 1;
}

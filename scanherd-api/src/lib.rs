//! Wire types of the scanherd HTTP surface.

use std::collections::BTreeMap;
use std::fmt;

/// An image, as submitted by a workload source or handed to a scan client.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// The content digest, without any `sha256:` prefix.
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: Image,
    pub name: String,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub containers: Vec<Container>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextImage {
    pub image: Option<Image>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePriority {
    pub priority: i32,
}

/// Reported by a scan client once it finished (or gave up on) an image.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedScan {
    pub image: Image,
    #[serde(default)]
    pub error: Option<String>,
}

/// Policy compliance of a scanned image, ordered from best to worst.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyStatus {
    NotInViolation,
    InViolationOverridden,
    InViolation,
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInViolation => f.write_str("NOT_IN_VIOLATION"),
            Self::InViolationOverridden => f.write_str("IN_VIOLATION_OVERRIDDEN"),
            Self::InViolation => f.write_str("IN_VIOLATION"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedWorkload {
    pub namespace: String,
    pub name: String,
    pub policy_violations: u32,
    pub vulnerabilities: u32,
    pub overall_status: PolicyStatus,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedImage {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub sha: String,
    pub policy_violations: u32,
    pub vulnerabilities: u32,
    pub overall_status: PolicyStatus,
}

/// Aggregated results. Only workloads whose images all finished scanning are listed.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResults {
    pub workloads: Vec<ScannedWorkload>,
    pub images: Vec<ScannedImage>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub state: String,
    pub consecutive_failures: u32,
    /// Seconds until the next trial call is let through, if the breaker is open.
    pub next_check_in_secs: Option<u64>,
}

/// Point-in-time counters of the orchestration state.
///
/// Histogram keys of `-1` count workloads/images without known results.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub scan_status_counts: BTreeMap<String, usize>,
    pub number_of_workloads: usize,
    pub number_of_images: usize,
    pub in_progress_scans: usize,
    pub concurrent_scan_limit: usize,
    pub scan_queue_length: usize,
    pub backend_check_queue_length: usize,
    pub container_counts: BTreeMap<usize, usize>,
    pub image_reference_counts: BTreeMap<usize, usize>,
    pub workload_status: BTreeMap<String, usize>,
    pub image_status: BTreeMap<String, usize>,
    pub workload_policy_violations: BTreeMap<i64, usize>,
    pub image_policy_violations: BTreeMap<i64, usize>,
    pub workload_vulnerabilities: BTreeMap<i64, usize>,
    pub image_vulnerabilities: BTreeMap<i64, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerStatus>,
}

/// Runtime configuration change. Absent fields are left untouched.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub concurrent_scan_limit: Option<usize>,
    pub stalled_scan_client_timeout_secs: Option<u64>,
    pub stalled_backend_scan_timeout_secs: Option<u64>,
    pub backend_check_pause_millis: Option<u64>,
    pub backend_throttle_millis: Option<u64>,
    pub scan_dispatch_pause_secs: Option<u64>,
    pub completion_poll_pause_secs: Option<u64>,
    pub stall_check_pause_secs: Option<u64>,
    pub orphan_prune_pause_secs: Option<u64>,
    pub orphan_cleanup_grace_secs: Option<u64>,
    pub refresh_pause_secs: Option<u64>,
    pub refresh_threshold_secs: Option<u64>,
    pub inventory_pause_secs: Option<u64>,
    pub metrics_pause_secs: Option<u64>,
    /// Upper bound of the circuit breaker backoff.
    pub max_backoff_secs: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoTag {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelImage {
    pub sha: String,
    pub repo_tags: Vec<RepoTag>,
    pub scan_status: String,
    pub priority: i32,
    pub secs_in_current_status: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_violations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_status: Option<PolicyStatus>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub sha: String,
    pub priority: i32,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub sha: String,
    pub from: String,
    pub to: String,
    pub legal: bool,
    pub secs_ago: u64,
}

/// Debug view of the whole orchestration state.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub workloads: BTreeMap<String, Workload>,
    pub images: BTreeMap<String, ModelImage>,
    pub scan_queue: Vec<QueueEntry>,
    pub backend_check_queue: Vec<String>,
    pub transitions: Vec<Transition>,
    pub concurrent_scan_limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_status_orders_worst_last() {
        assert!(PolicyStatus::NotInViolation < PolicyStatus::InViolationOverridden);
        assert!(PolicyStatus::InViolationOverridden < PolicyStatus::InViolation);
    }

    #[test]
    fn policy_status_display_matches_wire_format() {
        for status in [
            PolicyStatus::NotInViolation,
            PolicyStatus::InViolationOverridden,
            PolicyStatus::InViolation,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn image_priority_is_optional() {
        let image: Image =
            serde_json::from_str(r#"{"repository":"docker.io/nginx","sha":"abc"}"#).unwrap();
        assert_eq!(image.priority, None);
        assert_eq!(image.tag, None);
    }
}

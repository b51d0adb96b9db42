use std::fmt;
use std::ops::Deref;

pub use scanherd_api::PolicyStatus;

/// Queue priority of images which did not ask for one.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Content digest of an image, without the `sha256:` prefix.
///
/// This is the only identity of an image. Repository and tag are aliases.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct Digest(pub String);

impl Deref for Digest {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A reference to a workload
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RepoTag {
    pub repository: String,
    pub tag: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Image {
    pub digest: Digest,
    pub repo_tag: RepoTag,
    pub priority: Option<i32>,
}

impl Image {
    pub fn new(repository: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            digest: Digest(digest.into()),
            repo_tag: RepoTag {
                repository: repository.into(),
                tag: None,
            },
            priority: None,
        }
    }

    #[cfg(test)]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.repo_tag.tag = Some(tag.into());
        self
    }

    #[cfg(test)]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// The key under which the backend knows the scan of this image.
    pub fn search_key(&self) -> &str {
        &self.digest
    }

    /// A reference a container runtime can pull.
    pub fn pull_spec(&self) -> String {
        format!("{}@sha256:{}", self.repo_tag.repository, self.digest)
    }

    pub fn human_readable_name(&self) -> String {
        match &self.repo_tag.tag {
            Some(tag) => format!("{}:{}", self.repo_tag.repository, tag),
            None => self.repo_tag.repository.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Container {
    pub image: Image,
    pub name: String,
}

/// A pod-like unit of containers, keyed by namespace and name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub containers: Vec<Container>,
}

impl Workload {
    pub fn key(&self) -> WorkloadRef {
        WorkloadRef::new(self.namespace.clone(), self.name.clone())
    }
}

/// Results of a finished scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanResult {
    pub overall_status: PolicyStatus,
    pub policy_violations: u32,
    pub vulnerabilities: u32,
}

impl ScanResult {
    pub fn clean() -> Self {
        Self {
            overall_status: PolicyStatus::NotInViolation,
            policy_violations: 0,
            vulnerabilities: 0,
        }
    }

    /// Worst-case roll-up: the worst status wins, counts add up.
    pub fn combine(self, other: ScanResult) -> Self {
        Self {
            overall_status: self.overall_status.max(other.overall_status),
            policy_violations: self.policy_violations.saturating_add(other.policy_violations),
            vulnerabilities: self.vulnerabilities.saturating_add(other.vulnerabilities),
        }
    }
}

/// What the backend knows about the scan of an image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanState {
    InProgress,
    Failed,
    Complete(ScanResult),
}

impl From<scanherd_api::Image> for Image {
    fn from(image: scanherd_api::Image) -> Self {
        Self {
            digest: Digest(image.sha),
            repo_tag: RepoTag {
                repository: image.repository,
                tag: image.tag,
            },
            priority: image.priority,
        }
    }
}

impl From<Image> for scanherd_api::Image {
    fn from(image: Image) -> Self {
        Self {
            repository: image.repo_tag.repository,
            tag: image.repo_tag.tag,
            sha: image.digest.0,
            priority: image.priority,
        }
    }
}

impl From<scanherd_api::Workload> for Workload {
    fn from(workload: scanherd_api::Workload) -> Self {
        Self {
            namespace: workload.namespace,
            name: workload.name,
            uid: workload.uid,
            containers: workload
                .containers
                .into_iter()
                .map(|c| Container {
                    image: c.image.into(),
                    name: c.name,
                })
                .collect(),
        }
    }
}

impl From<Workload> for scanherd_api::Workload {
    fn from(workload: Workload) -> Self {
        Self {
            namespace: workload.namespace,
            name: workload.name,
            uid: workload.uid,
            containers: workload
                .containers
                .into_iter()
                .map(|c| scanherd_api::Container {
                    image: c.image.into(),
                    name: c.name,
                })
                .collect(),
        }
    }
}

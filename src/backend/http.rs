use super::{BackendError, ScanBackend};
use crate::api::{Image, PolicyStatus, ScanResult, ScanState};
use reqwest::{StatusCode, Url};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct HttpBackend {
    url: Url,
    client: reqwest::Client,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    search_key: &'a str,
    image: &'a str,
    repository: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<&'a str>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RemoteStatus {
    InProgress,
    Failed,
    Complete,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanStatusResponse {
    status: RemoteStatus,
    #[serde(default)]
    overall_status: Option<PolicyStatus>,
    #[serde(default)]
    policy_violations: u32,
    #[serde(default)]
    vulnerabilities: u32,
}

impl From<ScanStatusResponse> for ScanState {
    fn from(value: ScanStatusResponse) -> Self {
        match value.status {
            RemoteStatus::InProgress => ScanState::InProgress,
            RemoteStatus::Failed => ScanState::Failed,
            RemoteStatus::Complete => ScanState::Complete(ScanResult {
                overall_status: value.overall_status.unwrap_or(PolicyStatus::NotInViolation),
                policy_violations: value.policy_violations,
                vulnerabilities: value.vulnerabilities,
            }),
        }
    }
}

impl HttpBackend {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            url,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait::async_trait]
impl ScanBackend for HttpBackend {
    async fn submit_scan(&self, image: &Image) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url.join("/api/v1/scans")?)
            .json(&SubmitRequest {
                search_key: image.search_key(),
                image: &image.pull_spec(),
                repository: &image.repo_tag.repository,
                tag: image.repo_tag.tag.as_deref(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }

        Ok(())
    }

    async fn fetch_scan_status(&self, search_key: &str) -> Result<Option<ScanState>, BackendError> {
        let response = self
            .client
            .get(self.url.join("/api/v1/scans/")?.join(search_key)?)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let status: ScanStatusResponse = response.json().await?;
                Ok(Some(status.into()))
            }
            status => Err(BackendError::Status(status.as_u16())),
        }
    }

    async fn list_all_known_scans(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(self.url.join("/api/v1/scans")?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }
}

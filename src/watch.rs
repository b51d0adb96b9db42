use crate::api::{Container, Image, RepoTag, Workload, WorkloadRef};
use crate::engine::Engine;
use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use std::pin::pin;
use tracing::{debug, info};

/// Feed pod events into the engine, until the stream ends or fails.
pub async fn run<S>(engine: Engine, stream: S) -> anyhow::Result<()>
where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>>,
{
    let mut stream = pin!(stream);

    while let Some(evt) = stream.try_next().await? {
        match evt {
            watcher::Event::Applied(pod) => {
                if let Some(workload) = to_workload(&pod) {
                    engine.update_workload(workload).await?;
                }
            }
            watcher::Event::Deleted(pod) => {
                if let Some(key) = to_key(&pod) {
                    engine.delete_workload(key).await?;
                }
            }
            watcher::Event::Restarted(pods) => {
                let workloads: Vec<_> = pods.iter().filter_map(to_workload).collect();
                info!(workloads = workloads.len(), "Watch (re)started");
                engine.all_workloads(workloads).await?;
            }
        }
    }

    Ok(())
}

/// create a key for a pod
fn to_key(pod: &Pod) -> Option<WorkloadRef> {
    match (pod.namespace(), pod.meta().name.clone()) {
        (Some(namespace), Some(name)) => Some(WorkloadRef { namespace, name }),
        _ => None,
    }
}

fn to_workload(pod: &Pod) -> Option<Workload> {
    let key = to_key(pod)?;

    let containers = pod
        .status
        .iter()
        .flat_map(|s| {
            s.container_statuses
                .iter()
                .flatten()
                .chain(s.init_container_statuses.iter().flatten())
                .chain(s.ephemeral_container_statuses.iter().flatten())
        })
        .filter_map(to_container)
        .collect();

    Some(Workload {
        namespace: key.namespace,
        name: key.name,
        uid: pod.uid().unwrap_or_default(),
        containers,
    })
}

fn to_container(status: &ContainerStatus) -> Option<Container> {
    let Some((name, digest)) = parse_image_id(&status.image_id) else {
        debug!(container = %status.name, image_id = %status.image_id, "No usable image id (yet)");
        return None;
    };

    let repo_tag = if status.image.is_empty() {
        RepoTag {
            repository: name.to_string(),
            tag: None,
        }
    } else {
        parse_repo_tag(&status.image)
    };

    Some(Container {
        image: Image {
            digest: digest.into(),
            repo_tag,
            priority: None,
        },
        name: status.name.clone(),
    })
}

/// Split an image id into name and digest.
///
/// Accepts `docker-pullable://<name>@sha256:<hex>` as well as `<name>@sha256:<hex>`.
fn parse_image_id(image_id: &str) -> Option<(&str, &str)> {
    let id = image_id
        .strip_prefix("docker-pullable://")
        .unwrap_or(image_id);
    let (name, digest) = id.rsplit_once("@sha256:")?;

    if name.is_empty() || digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    Some((name, digest))
}

/// Split an image reference into repository and tag, dropping any digest.
fn parse_repo_tag(image: &str) -> RepoTag {
    let image = image.split_once('@').map(|(name, _)| name).unwrap_or(image);

    // a colon before the last slash belongs to the registry port
    let last_slash = image.rfind('/').unwrap_or(0);
    match image.rfind(':') {
        Some(colon) if colon > last_slash => RepoTag {
            repository: image[..colon].to_string(),
            tag: Some(image[colon + 1..].to_string()),
        },
        _ => RepoTag {
            repository: image.to_string(),
            tag: None,
        },
    }
}

//! Pod-based release image lookup
//!
//! Release image metadata lives inside the image itself, at
//! `/release-manifests/image-references`, as a serialized ImageStream. The
//! provider runs a short-lived pod from the release image that cats that
//! file, waits for it to succeed, and parses the component mapping out of
//! its logs. The pull secret of the ControlPlane authenticates the image
//! pull, so lookups work against private registries without any controller
//! level credentials.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{ReleaseImage, ReleaseImageLookup};
use crate::Error;

const IMAGE_REFERENCES_PATH: &str = "/release-manifests/image-references";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Resolves release metadata by running a pod from the release image
pub struct ReleasePodProvider {
    client: Client,
}

impl ReleasePodProvider {
    /// Create a provider using the given client to manage lookup pods
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn wait_for_completion(&self, pods: &Api<Pod>, name: &str) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + LOOKUP_TIMEOUT;
        loop {
            let pod = pods.get(name).await?;
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            match phase.as_str() {
                "Succeeded" => return Ok(()),
                "Failed" => {
                    return Err(Error::release_image(format!(
                        "release info pod {} failed",
                        name
                    )))
                }
                _ => debug!(pod = name, %phase, "waiting for release info pod"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::release_image(format!(
                    "timed out waiting for release info pod {}",
                    name
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Name of the lookup pod for a pull spec, stable so a retry after a
/// controller restart finds the pod it already created
pub fn pod_name(pull_spec: &str) -> String {
    let digest = Sha256::digest(pull_spec.as_bytes());
    format!("release-info-{:x}", digest)[..25].to_string()
}

/// Lookup pod manifest for a pull spec
pub fn lookup_pod(namespace: &str, pull_spec: &str, pull_secret_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(pull_spec)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "release-info".to_string(),
                image: Some(pull_spec.to_string()),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("cat {}", IMAGE_REFERENCES_PATH),
                ]),
                ..Default::default()
            }],
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: pull_secret_name.to_string(),
            }]),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Parse the image-references ImageStream into release metadata
pub fn parse_image_references(raw: &str) -> Result<ReleaseImage, Error> {
    let stream: serde_json::Value = serde_json::from_str(raw)?;
    let version = stream["metadata"]["name"]
        .as_str()
        .ok_or_else(|| Error::release_image("image-references has no version name"))?
        .to_string();

    let mut component_images = HashMap::new();
    for tag in stream["spec"]["tags"].as_array().into_iter().flatten() {
        let (Some(name), Some(image)) = (tag["name"].as_str(), tag["from"]["name"].as_str())
        else {
            continue;
        };
        component_images.insert(name.to_string(), image.to_string());
    }
    if component_images.is_empty() {
        return Err(Error::release_image(format!(
            "release {} lists no component images",
            version
        )));
    }
    Ok(ReleaseImage {
        version,
        component_images,
    })
}

#[async_trait]
impl ReleaseImageLookup for ReleasePodProvider {
    async fn lookup(
        &self,
        namespace: &str,
        pull_spec: &str,
        pull_secret_name: &str,
    ) -> Result<ReleaseImage, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = lookup_pod(namespace, pull_spec, pull_secret_name);
        let name = pod_name(pull_spec);

        if pods.get_opt(&name).await?.is_none() {
            pods.create(&PostParams::default(), &pod).await?;
        }
        let result = async {
            self.wait_for_completion(&pods, &name).await?;
            let logs = pods.logs(&name, &LogParams::default()).await?;
            parse_image_references(&logs)
        }
        .await;

        if let Err(err) = pods.delete(&name, &DeleteParams::default()).await {
            warn!(pod = %name, error = %err, "failed to clean up release info pod");
        }
        result
    }
}

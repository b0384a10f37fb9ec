//! Release image metadata lookup
//!
//! A release image is a pull spec whose metadata maps component names
//! (`hyperkube`, `cli`, `cluster-config-operator`) to the images that ship
//! them. Resolving that metadata means pulling from a registry, which is
//! slow and rate-limited, so results are cached for the lifetime of the
//! engine keyed by pull spec. Release images are immutable by convention;
//! the cache never expires entries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Error;

mod provider;

pub use provider::ReleasePodProvider;

/// Component image key for the combined apiserver/controller-manager binary
pub const COMPONENT_HYPERKUBE: &str = "hyperkube";
/// Component image key for the CLI image used by bootstrap containers
pub const COMPONENT_CLI: &str = "cli";
/// Component image key for the config-operator image used to render configs
pub const COMPONENT_CLUSTER_CONFIG_OPERATOR: &str = "cluster-config-operator";

/// Resolved metadata of a release image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ReleaseImage {
    /// Release version string, e.g. `4.8.0`
    pub version: String,

    /// Component name to image pull spec
    pub component_images: HashMap<String, String>,
}

impl ReleaseImage {
    /// Image for the named component, erroring when the release lacks it
    pub fn component_image(&self, component: &str) -> Result<&str, Error> {
        self.component_images
            .get(component)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::release_image(format!(
                    "release {} does not provide component image {}",
                    self.version, component
                ))
            })
    }
}

/// Resolves release image pull specs to their component image metadata
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseImageLookup: Send + Sync {
    /// Resolve the metadata of `pull_spec`, authenticating with the named
    /// pull secret in `namespace`
    async fn lookup(
        &self,
        namespace: &str,
        pull_spec: &str,
        pull_secret_name: &str,
    ) -> Result<ReleaseImage, Error>;
}

/// Engine-lifetime cache in front of a [`ReleaseImageLookup`]
///
/// The lock is held across the provider call, not just the map access, so
/// two reconcile passes racing on the same uncached pull spec perform a
/// single provider lookup between them.
pub struct ReleaseImageCache {
    provider: Arc<dyn ReleaseImageLookup>,
    cache: Mutex<HashMap<String, ReleaseImage>>,
}

impl ReleaseImageCache {
    /// Wrap a provider with a cache
    pub fn new(provider: Arc<dyn ReleaseImageLookup>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `pull_spec`, serving from cache when possible
    pub async fn get(
        &self,
        namespace: &str,
        pull_spec: &str,
        pull_secret_name: &str,
    ) -> Result<ReleaseImage, Error> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(pull_spec) {
            debug!(pull_spec, "release image served from cache");
            return Ok(cached.clone());
        }
        let resolved = self
            .provider
            .lookup(namespace, pull_spec, pull_secret_name)
            .await?;
        info!(pull_spec, version = %resolved.version, "resolved release image");
        cache.insert(pull_spec.to_string(), resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn release(version: &str) -> ReleaseImage {
        let mut component_images = HashMap::new();
        component_images.insert(
            COMPONENT_HYPERKUBE.to_string(),
            "quay.io/ocp/hyperkube:latest".to_string(),
        );
        ReleaseImage {
            version: version.to_string(),
            component_images,
        }
    }

    struct CountingProvider {
        calls: AtomicUsize,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl ReleaseImageLookup for CountingProvider {
        async fn lookup(
            &self,
            _namespace: &str,
            pull_spec: &str,
            _pull_secret_name: &str,
        ) -> Result<ReleaseImage, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(release(pull_spec))
        }
    }

    #[test]
    fn missing_component_image_is_an_error() {
        let release = release("4.8.0");
        assert!(release.component_image(COMPONENT_HYPERKUBE).is_ok());
        assert!(release.component_image(COMPONENT_CLI).is_err());
    }

    #[tokio::test]
    async fn second_get_hits_the_cache() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            delay: std::time::Duration::ZERO,
        });
        let cache = ReleaseImageCache::new(provider.clone());

        let first = cache.get("cp", "quay.io/release:4.8.0", "pull").await.unwrap();
        let second = cache.get("cp", "quay.io/release:4.8.0", "pull").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_pull_specs_are_cached_separately() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            delay: std::time::Duration::ZERO,
        });
        let cache = ReleaseImageCache::new(provider.clone());

        cache.get("cp", "quay.io/release:4.8.0", "pull").await.unwrap();
        cache.get("cp", "quay.io/release:4.8.1", "pull").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_lookups_for_one_spec_call_provider_once() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            delay: std::time::Duration::from_millis(20),
        });
        let cache = Arc::new(ReleaseImageCache::new(provider.clone()));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("cp", "quay.io/release:4.8.0", "pull").await })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("cp", "quay.io/release:4.8.0", "pull").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_errors_are_not_cached() {
        struct FailingOnce {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ReleaseImageLookup for FailingOnce {
            async fn lookup(
                &self,
                _namespace: &str,
                pull_spec: &str,
                _pull_secret_name: &str,
            ) -> Result<ReleaseImage, Error> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::release_image("registry unavailable"));
                }
                Ok(release(pull_spec))
            }
        }

        let provider = Arc::new(FailingOnce {
            calls: AtomicUsize::new(0),
        });
        let cache = ReleaseImageCache::new(provider.clone());

        assert!(cache.get("cp", "quay.io/release:4.8.0", "pull").await.is_err());
        assert!(cache.get("cp", "quay.io/release:4.8.0", "pull").await.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}

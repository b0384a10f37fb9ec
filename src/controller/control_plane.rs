//! ControlPlane controller implementation
//!
//! One reconciliation pass per triggering event, strictly ordered: refresh
//! the three subsystem conditions and the rollup from live workload state,
//! ensure the root CA, converge etcd, gate on `EtcdAvailable`, resolve the
//! release image, converge the API server, gate on
//! `KubeAPIServerAvailable`, then converge the controller manager. A failed
//! gate ends the pass early with a retrigger; it never touches a subsystem
//! downstream of it.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    get_condition, set_condition, ConditionStatus, ConditionType, ControlPlane,
    ControlPlaneCondition, ControlPlaneStatus, EtcdCluster,
};
use crate::releaseinfo::{ReleaseImage, ReleaseImageCache};
use crate::{etcd, kas, kcm, pki, Error};

/// Field manager used for all writes this controller performs
pub const FIELD_MANAGER: &str = "skylift-controller";

/// Trait abstracting the object store operations the engine performs
///
/// The engine's ordering, gating, and recovery policy is tested against a
/// mock of this trait; the real implementation talks to the cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Fetch the EtcdCluster in the namespace, if it exists
    async fn get_etcd_cluster(&self, namespace: &str) -> Result<Option<EtcdCluster>, Error>;

    /// True when any etcd member pod in the namespace has a terminated
    /// container
    async fn etcd_has_terminated_pods(&self, namespace: &str) -> Result<bool, Error>;

    /// Delete the EtcdCluster so the next pass recreates it
    async fn delete_etcd_cluster(&self, namespace: &str) -> Result<(), Error>;

    /// Fetch a deployment by name, if it exists
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Write the status subresource of the ControlPlane
    async fn update_status(&self, control_plane: &ControlPlane) -> Result<(), Error>;

    /// Ensure the root CA secret exists and is valid
    async fn ensure_root_ca(&self, control_plane: &ControlPlane) -> Result<(), Error>;

    /// Upsert every owned object of the etcd subsystem
    async fn apply_etcd(&self, control_plane: &ControlPlane) -> Result<(), Error>;

    /// Upsert every owned object of the API server subsystem
    async fn apply_kube_apiserver(
        &self,
        control_plane: &ControlPlane,
        release: &ReleaseImage,
    ) -> Result<(), Error>;

    /// Upsert every owned object of the controller manager subsystem
    async fn apply_kube_controller_manager(
        &self,
        control_plane: &ControlPlane,
        release: &ReleaseImage,
    ) -> Result<(), Error>;
}

/// Add or refresh the owning ControlPlane reference on an object
///
/// `blockOwnerDeletion` is set so the store will not remove the
/// ControlPlane while owned objects still exist mid-cascade.
pub fn ensure_owner_reference(owner: &ControlPlane, meta: &mut ObjectMeta) {
    let reference = OwnerReference {
        api_version: ControlPlane::api_version(&()).to_string(),
        kind: ControlPlane::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.metadata.uid.clone().unwrap_or_default(),
        block_owner_deletion: Some(true),
        ..Default::default()
    };
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs
        .iter_mut()
        .find(|r| r.kind == reference.kind && r.name == reference.name)
    {
        Some(existing) => *existing = reference,
        None => refs.push(reference),
    }
}

/// Real store implementation backed by a kube [`Client`]
pub struct ControlPlaneClientImpl {
    client: Client,
}

impl ControlPlaneClientImpl {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch-mutate-write a single owned object
    ///
    /// Mirrors the store's create-or-update contract: start from the live
    /// object when one exists, apply the mutation, then write only when the
    /// result differs. The unchanged case performs no write at all, which
    /// is what keeps repeated passes from churning certificate secrets.
    async fn create_or_update<K, F>(
        &self,
        owner: &ControlPlane,
        shell: K,
        mutate: F,
    ) -> Result<(), Error>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
        F: FnOnce(&mut K) -> Result<(), Error>,
    {
        let namespace = shell.namespace().unwrap_or_default();
        let name = shell.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);

        let existing = api.get_opt(&name).await?;
        let mut desired = existing.clone().unwrap_or(shell);
        ensure_owner_reference(owner, desired.meta_mut());
        mutate(&mut desired)?;

        match existing {
            None => {
                api.create(&PostParams::default(), &desired).await?;
                info!(kind = %K::kind(&()), %name, "created object");
            }
            Some(current) => {
                if serde_json::to_value(&current)? != serde_json::to_value(&desired)? {
                    api.replace(&name, &PostParams::default(), &desired).await?;
                    info!(kind = %K::kind(&()), %name, "updated object");
                } else {
                    debug!(kind = %K::kind(&()), %name, "object unchanged");
                }
            }
        }
        Ok(())
    }

    async fn get_root_ca(&self, namespace: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(pki::ROOT_CA_SECRET_NAME).await?)
    }
}

#[async_trait]
impl ControlPlaneClient for ControlPlaneClientImpl {
    async fn get_etcd_cluster(&self, namespace: &str) -> Result<Option<EtcdCluster>, Error> {
        let api: Api<EtcdCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(etcd::CLUSTER_NAME).await?)
    }

    async fn etcd_has_terminated_pods(&self, namespace: &str) -> Result<bool, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", etcd::CLUSTER_POD_LABEL, etcd::CLUSTER_NAME);
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(etcd::has_terminated_pods(&pods.items))
    }

    async fn delete_etcd_cluster(&self, namespace: &str) -> Result<(), Error> {
        let api: Api<EtcdCluster> = Api::namespaced(self.client.clone(), namespace);
        api.delete(etcd::CLUSTER_NAME, &Default::default()).await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_status(&self, control_plane: &ControlPlane) -> Result<(), Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let api: Api<ControlPlane> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &control_plane.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&serde_json::json!({
                "apiVersion": ControlPlane::api_version(&()),
                "kind": ControlPlane::kind(&()),
                "status": control_plane.status,
            })),
        )
        .await?;
        Ok(())
    }

    async fn ensure_root_ca(&self, control_plane: &ControlPlane) -> Result<(), Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let shell = Secret {
            metadata: ObjectMeta {
                name: Some(pki::ROOT_CA_SECRET_NAME.to_string()),
                namespace: Some(namespace),
                ..Default::default()
            },
            ..Default::default()
        };
        self.create_or_update(control_plane, shell, pki::reconcile_root_ca)
            .await
    }

    async fn apply_etcd(&self, control_plane: &ControlPlane) -> Result<(), Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let root_ca = self.get_root_ca(&namespace).await?;

        self.create_or_update(control_plane, etcd::client_secret(&namespace), |s| {
            etcd::reconcile_client_secret(s, &root_ca)
        })
        .await?;
        self.create_or_update(control_plane, etcd::server_secret(&namespace), |s| {
            etcd::reconcile_server_secret(s, &root_ca)
        })
        .await?;
        self.create_or_update(control_plane, etcd::peer_secret(&namespace), |s| {
            etcd::reconcile_peer_secret(s, &root_ca)
        })
        .await?;

        self.create_or_update::<ServiceAccount, _>(
            control_plane,
            etcd::operator_service_account(&namespace),
            |_| Ok(()),
        )
        .await?;
        self.create_or_update::<Role, _>(control_plane, etcd::operator_role(&namespace), |r| {
            etcd::reconcile_operator_role(r);
            Ok(())
        })
        .await?;
        self.create_or_update::<RoleBinding, _>(
            control_plane,
            etcd::operator_role_binding(&namespace),
            |b| {
                etcd::reconcile_operator_role_binding(b);
                Ok(())
            },
        )
        .await?;
        self.create_or_update::<Deployment, _>(
            control_plane,
            etcd::operator_deployment(&namespace),
            |d| {
                etcd::reconcile_operator_deployment(d, crate::ETCD_OPERATOR_IMAGE);
                Ok(())
            },
        )
        .await?;
        self.create_or_update::<EtcdCluster, _>(control_plane, etcd::cluster(&namespace), |c| {
            etcd::reconcile_cluster(c, crate::ETCD_CLUSTER_SIZE, crate::ETCD_VERSION);
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn apply_kube_apiserver(
        &self,
        control_plane: &ControlPlane,
        release: &ReleaseImage,
    ) -> Result<(), Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let root_ca = self.get_root_ca(&namespace).await?;

        self.create_or_update::<Service, _>(control_plane, kas::service(&namespace), |s| {
            kas::reconcile_service(s, crate::KAS_PORT, crate::KAS_PORT);
            Ok(())
        })
        .await?;
        self.create_or_update(control_plane, kas::server_cert_secret(&namespace), |s| {
            kas::reconcile_server_cert_secret(s, &root_ca, crate::DEFAULT_SERVICE_CIDR)
        })
        .await?;
        self.create_or_update(control_plane, kas::aggregator_cert_secret(&namespace), |s| {
            kas::reconcile_aggregator_cert_secret(s, &root_ca)
        })
        .await?;
        self.create_or_update(
            control_plane,
            kas::service_account_signing_key_secret(&namespace),
            kas::reconcile_service_account_signing_key_secret,
        )
        .await?;
        self.create_or_update(control_plane, kas::service_kubeconfig_secret(&namespace), |s| {
            kas::reconcile_service_kubeconfig_secret(s, &root_ca, crate::KAS_PORT)
        })
        .await?;
        self.create_or_update(
            control_plane,
            kas::localhost_kubeconfig_secret(&namespace),
            |s| kas::reconcile_localhost_kubeconfig_secret(s, &root_ca, crate::KAS_PORT),
        )
        .await?;
        self.create_or_update::<ConfigMap, _>(control_plane, kas::audit_config(&namespace), |c| {
            kas::reconcile_audit_config(c);
            Ok(())
        })
        .await?;
        self.create_or_update::<ConfigMap, _>(control_plane, kas::config(&namespace), |c| {
            kas::reconcile_config(c, crate::DEFAULT_SERVICE_CIDR, crate::KAS_PORT)
        })
        .await?;
        self.create_or_update::<ConfigMap, _>(
            control_plane,
            kas::oauth_metadata(&namespace),
            |c| {
                kas::reconcile_oauth_metadata(c);
                Ok(())
            },
        )
        .await?;

        let config_operator = release
            .component_image(crate::releaseinfo::COMPONENT_CLUSTER_CONFIG_OPERATOR)?
            .to_string();
        let cli = release
            .component_image(crate::releaseinfo::COMPONENT_CLI)?
            .to_string();
        let hyperkube = release
            .component_image(crate::releaseinfo::COMPONENT_HYPERKUBE)?
            .to_string();
        self.create_or_update::<Deployment, _>(control_plane, kas::deployment(&namespace), |d| {
            kas::reconcile_deployment(
                d,
                &config_operator,
                &cli,
                &hyperkube,
                crate::KAS_PORT,
                crate::KAS_REPLICAS,
            );
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn apply_kube_controller_manager(
        &self,
        control_plane: &ControlPlane,
        release: &ReleaseImage,
    ) -> Result<(), Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let root_ca = self.get_root_ca(&namespace).await?;

        self.create_or_update(control_plane, kcm::cluster_signer_secret(&namespace), |s| {
            kcm::reconcile_cluster_signer_secret(s, &root_ca)
        })
        .await?;
        self.create_or_update::<ConfigMap, _>(control_plane, kcm::config(&namespace), |c| {
            kcm::reconcile_config(c)
        })
        .await?;

        let hyperkube = release
            .component_image(crate::releaseinfo::COMPONENT_HYPERKUBE)?
            .to_string();
        self.create_or_update::<Deployment, _>(control_plane, kcm::deployment(&namespace), |d| {
            kcm::reconcile_deployment(
                d,
                crate::DEFAULT_POD_CIDR,
                crate::DEFAULT_SERVICE_CIDR,
                &hyperkube,
                crate::KCM_REPLICAS,
            );
            Ok(())
        })
        .await?;
        Ok(())
    }
}

/// How far this control plane has converged, derived from its conditions
///
/// The phase is a pure function of the condition list, so gating decisions
/// are testable without a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergencePhase {
    /// Etcd is not yet available
    NotStarted,
    /// Etcd is available, the API server is not
    EtcdReady,
    /// Etcd and the API server are available, the controller manager is not
    ApiServerReady,
    /// All three subsystems are available
    Converged,
}

fn condition_true(conditions: &[ControlPlaneCondition], type_: ConditionType) -> bool {
    get_condition(conditions, type_)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// Derive the convergence phase from a condition list
pub fn convergence_phase(conditions: &[ControlPlaneCondition]) -> ConvergencePhase {
    if !condition_true(conditions, ConditionType::EtcdAvailable) {
        return ConvergencePhase::NotStarted;
    }
    if !condition_true(conditions, ConditionType::KubeAPIServerAvailable) {
        return ConvergencePhase::EtcdReady;
    }
    if !condition_true(conditions, ConditionType::KubeControllerManagerAvailable) {
        return ConvergencePhase::ApiServerReady;
    }
    ConvergencePhase::Converged
}

/// Derive the `Available` rollup from the three subsystem conditions
pub fn availability_rollup(
    conditions: &[ControlPlaneCondition],
) -> (ConditionStatus, &'static str, &'static str) {
    if convergence_phase(conditions) == ConvergencePhase::Converged {
        (
            ConditionStatus::True,
            "Running",
            "Control plane is up and running",
        )
    } else {
        (
            ConditionStatus::False,
            "NotAvailable",
            "Control plane is not yet available",
        )
    }
}

/// Controller context containing shared state and clients
///
/// Shared across all reconciliation calls. Use [`ContextBuilder`] to
/// construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .release_lookup(provider)
///     .build();
/// ```
pub struct Context {
    /// Object store operations (trait object for testability)
    pub client: Arc<dyn ControlPlaneClient>,
    /// Engine-lifetime release image cache
    pub release_images: Arc<ReleaseImageCache>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn ControlPlaneClient>,
        lookup: Arc<dyn crate::releaseinfo::ReleaseImageLookup>,
    ) -> Self {
        Self {
            client,
            release_images: Arc::new(ReleaseImageCache::new(lookup)),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ControlPlaneClient>>,
    lookup: Option<Arc<dyn crate::releaseinfo::ReleaseImageLookup>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            lookup: None,
        }
    }

    /// Override the store client (primarily for testing)
    pub fn store_client(mut self, store: Arc<dyn ControlPlaneClient>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the release image lookup provider
    pub fn release_lookup(
        mut self,
        lookup: Arc<dyn crate::releaseinfo::ReleaseImageLookup>,
    ) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let lookup = self.lookup.unwrap_or_else(|| {
            Arc::new(crate::releaseinfo::ReleasePodProvider::new(
                self.client.clone(),
            ))
        });
        Context {
            client: self
                .store
                .unwrap_or_else(|| Arc::new(ControlPlaneClientImpl::new(self.client.clone()))),
            release_images: Arc::new(ReleaseImageCache::new(lookup)),
        }
    }
}

fn conditions_mut(control_plane: &mut ControlPlane) -> &mut Vec<ControlPlaneCondition> {
    &mut control_plane
        .status
        .get_or_insert_with(ControlPlaneStatus::default)
        .conditions
}

/// Reconcile a ControlPlane resource
///
/// Implements one full ordered pass. Returns the requeue decision: waiting
/// on etcd uses a timed requeue because etcd's operator bootstraps on its
/// own clock, while waiting on the API server relies on the owned
/// deployment's own watch events to retrigger the pass.
#[instrument(skip(control_plane, ctx), fields(control_plane = %control_plane.name_any()))]
pub async fn reconcile(
    control_plane: Arc<ControlPlane>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let namespace = control_plane.namespace().unwrap_or_default();
    info!("reconciling control plane");

    if control_plane.metadata.deletion_timestamp.is_some() {
        debug!("control plane is being deleted, nothing to do");
        return Ok(Action::await_change());
    }

    let mut control_plane = (*control_plane).clone();

    // Status refresh: etcd
    let etcd_cluster = ctx.client.get_etcd_cluster(&namespace).await?;
    if let Some(cluster) = &etcd_cluster {
        if cluster.metadata.deletion_timestamp.is_some() {
            // Wait until the old cluster is gone before assessing anything
            debug!("etcd cluster is being deleted, waiting");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        let terminated = if etcd::needs_pod_inspection(cluster) {
            ctx.client.etcd_has_terminated_pods(&namespace).await?
        } else {
            false
        };
        let verdict = etcd::assess(cluster, terminated, Utc::now());
        set_condition(
            conditions_mut(&mut control_plane),
            ConditionType::EtcdAvailable,
            verdict.status,
            verdict.reason,
            verdict.message,
        );
        ctx.client.update_status(&control_plane).await?;
        if verdict.delete_cluster {
            warn!(reason = verdict.reason, "etcd cluster is wedged, deleting for recreation");
            ctx.client.delete_etcd_cluster(&namespace).await?;
            return Err(Error::etcd_cluster(
                "etcd cluster in error state, must recreate",
            ));
        }
    } else {
        debug!("etcd cluster does not exist yet");
    }

    // Status refresh: API server
    match ctx.client.get_deployment(&namespace, kas::KAS_NAME).await? {
        Some(deployment) if deployment.metadata.deletion_timestamp.is_some() => {
            debug!("kube-apiserver deployment is being deleted, waiting");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        Some(deployment) => {
            let (status, reason, message) = kas::assess(&deployment);
            set_condition(
                conditions_mut(&mut control_plane),
                ConditionType::KubeAPIServerAvailable,
                status,
                reason,
                message,
            );
            ctx.client.update_status(&control_plane).await?;
        }
        None => debug!("kube-apiserver deployment does not exist yet"),
    }

    // Status refresh: controller manager
    match ctx.client.get_deployment(&namespace, kcm::KCM_NAME).await? {
        Some(deployment) if deployment.metadata.deletion_timestamp.is_some() => {
            debug!("kube-controller-manager deployment is being deleted, waiting");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        Some(deployment) => {
            let (status, reason, message) = kcm::assess(&deployment);
            set_condition(
                conditions_mut(&mut control_plane),
                ConditionType::KubeControllerManagerAvailable,
                status,
                reason,
                message,
            );
            ctx.client.update_status(&control_plane).await?;
        }
        None => debug!("kube-controller-manager deployment does not exist yet"),
    }

    // Rollup
    {
        let (status, reason, message) = availability_rollup(control_plane.conditions());
        set_condition(
            conditions_mut(&mut control_plane),
            ConditionType::Available,
            status,
            reason,
            message,
        );
        ctx.client.update_status(&control_plane).await?;
    }

    ctx.client.ensure_root_ca(&control_plane).await?;

    info!("reconciling etcd");
    ctx.client.apply_etcd(&control_plane).await?;
    if convergence_phase(control_plane.conditions()) == ConvergencePhase::NotStarted {
        info!("etcd is not yet available");
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    let release = ctx
        .release_images
        .get(
            &namespace,
            &control_plane.spec.release_image,
            &control_plane.spec.pull_secret.name,
        )
        .await?;

    info!("reconciling kube-apiserver");
    ctx.client
        .apply_kube_apiserver(&control_plane, &release)
        .await?;
    if convergence_phase(control_plane.conditions()) == ConvergencePhase::EtcdReady {
        info!("kube-apiserver is not yet available");
        return Ok(Action::await_change());
    }

    info!("reconciling kube-controller-manager");
    ctx.client
        .apply_kube_controller_manager(&control_plane, &release)
        .await?;

    info!("reconciliation completed");
    Ok(Action::await_change())
}

/// Decide what to do when reconciliation fails
pub fn error_policy(
    control_plane: Arc<ControlPlane>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(
        control_plane = %control_plane.name_any(),
        error = %error,
        "reconciliation failed, requeueing"
    );
    Action::requeue(Duration::from_secs(5))
}

//! Skylift - hosted Kubernetes control planes as deployments in a host cluster
//!
//! Skylift runs the control plane of a guest Kubernetes cluster (etcd, the
//! API server, the controller manager) as ordinary workloads inside a
//! namespace of a host cluster. A `ControlPlane` custom resource names a
//! release image and a pull secret; the controller converges the namespace
//! toward a working control plane and reports progress through status
//! conditions.
//!
//! # Architecture
//!
//! Reconciliation is a strictly ordered pass per resource:
//! - refresh the three subsystem conditions and the `Available` rollup
//! - ensure the root CA, generating it exactly once
//! - converge etcd (operator, TLS secrets, EtcdCluster), then gate until it
//!   reports available
//! - resolve the release image, converge the API server, then gate again
//! - converge the controller manager
//!
//! Downstream subsystems are never touched before their upstream gate
//! passes, so a broken etcd never receives API server writes on top.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (ControlPlane, EtcdCluster view)
//! - [`controller`] - Reconciliation engine and controller wiring
//! - [`pki`] - Root CA and certificate issuance
//! - [`etcd`] - Etcd operator, TLS secrets, cluster, status derivation
//! - [`kas`] - Kube-apiserver manifests and status derivation
//! - [`kcm`] - Kube-controller-manager manifests and status derivation
//! - [`releaseinfo`] - Release image metadata lookup and caching
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]
// The serialized apiserver configuration is one large json! literal
#![recursion_limit = "256"]

pub mod controller;
pub mod crd;
pub mod error;
pub mod etcd;
pub mod kas;
pub mod kcm;
pub mod pki;
pub mod releaseinfo;

pub use error::Error;

use k8s_openapi::api::apps::v1::Deployment;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Defaults shared by the reconciliation engine, the manifests, and tests.

/// Service network of the hosted cluster
pub const DEFAULT_SERVICE_CIDR: &str = "172.30.0.0/16";

/// Pod network of the hosted cluster
pub const DEFAULT_POD_CIDR: &str = "10.128.0.0/14";

/// Image running the etcd operator
pub const ETCD_OPERATOR_IMAGE: &str = "quay.io/coreos/etcd-operator:v0.9.4";

/// Etcd version requested from the operator
pub const ETCD_VERSION: &str = "3.4.9";

/// Port the hosted API server binds and serves on
pub const KAS_PORT: i32 = 6443;

/// Replica count for the API server deployment
pub const KAS_REPLICAS: i32 = 1;

/// Replica count for the controller manager deployment
pub const KCM_REPLICAS: i32 = 1;

/// Member count for the etcd cluster
pub const ETCD_CLUSTER_SIZE: i32 = 1;

/// True when a deployment reports the `Available` condition and at least one
/// available replica
///
/// Both checks matter: the condition alone can linger through a rollout that
/// briefly drops every replica.
pub fn workload_available(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let available_condition = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Available" && c.status == "True");
    available_condition && status.available_replicas.unwrap_or(0) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

    fn deployment(available: bool, replicas: i32) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: if available { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                available_replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn workload_needs_condition_and_replicas() {
        assert!(workload_available(&deployment(true, 1)));
        assert!(!workload_available(&deployment(true, 0)));
        assert!(!workload_available(&deployment(false, 1)));
        assert!(!workload_available(&Deployment::default()));
    }
}

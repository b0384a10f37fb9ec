//! ControlPlane Custom Resource Definition
//!
//! The ControlPlane CRD represents a hosted Kubernetes control plane running
//! inside the host cluster. The user supplies a release image pull spec and a
//! pull secret; the controller converges etcd, the API server, and the
//! controller manager in that namespace.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a ControlPlane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "skylift.dev",
    version = "v1alpha1",
    kind = "ControlPlane",
    plural = "controlplanes",
    shortname = "cp",
    status = "ControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"ReleaseImage","type":"string","jsonPath":".spec.releaseImage"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Pull spec of the release image providing the control plane component images
    pub release_image: String,

    /// Local reference to the secret used to pull release images
    pub pull_secret: LocalObjectReference,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

/// Observed state of a ControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Conditions describing the state of each subsystem plus the rollup
    #[serde(default)]
    pub conditions: Vec<ControlPlaneCondition>,
}

/// Aspects of a ControlPlane reported through conditions
///
/// At most one condition per type may exist in a status. `Available` is the
/// derived rollup of the three subsystem conditions and is never written by a
/// subsystem directly.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// Rollup: all three subsystems are available
    Available,
    /// The etcd cluster is available
    EtcdAvailable,
    /// The kube-apiserver deployment is available
    KubeAPIServerAvailable,
    /// The kube-controller-manager deployment is available
    KubeControllerManagerAvailable,
}

/// Status of a condition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The state of the condition cannot be determined
    Unknown,
}

/// A single status condition on a ControlPlane
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneCondition {
    /// Aspect reported by this condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// One of True, False, Unknown
    pub status: ConditionStatus,

    /// Machine-readable CamelCase reason for the current status
    #[serde(default)]
    pub reason: String,

    /// Human-readable detail for the current status
    #[serde(default)]
    pub message: String,

    /// Last time `status` changed value; reason/message churn does not bump it
    pub last_transition_time: DateTime<Utc>,
}

impl ControlPlane {
    /// Conditions currently recorded on the resource, empty if status unset
    pub fn conditions(&self) -> &[ControlPlaneCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }
}

//! Typed view of the etcd-operator EtcdCluster CRD
//!
//! The etcd cluster itself is managed by the upstream etcd operator
//! (`etcd.database.coreos.com/v1beta2`); this controller only creates the
//! cluster resource and reads its status. Only the fields this controller
//! touches are modeled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported by the etcd operator when the cluster is serving
pub const ETCD_CONDITION_AVAILABLE: &str = "Available";

/// Desired state of an etcd cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "etcd.database.coreos.com",
    version = "v1beta2",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    status = "EtcdClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Number of etcd members
    pub size: i32,

    /// etcd version to run
    pub version: String,

    /// Static TLS configuration for members and the operator
    #[serde(rename = "TLS", default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<EtcdTlsPolicy>,
}

/// TLS policy for an etcd cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EtcdTlsPolicy {
    /// Statically provisioned TLS secrets
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_tls: Option<StaticTls>,
}

/// Statically provisioned TLS secret names
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticTls {
    /// Secrets mounted by each member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<TlsMemberSecrets>,

    /// Secret the operator uses to reach the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_secret: Option<String>,
}

/// Per-member TLS secret names
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsMemberSecrets {
    /// Secret holding the member serving certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_secret: Option<String>,

    /// Secret holding the member peer certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_secret: Option<String>,
}

/// Observed state of an etcd cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Conditions reported by the etcd operator
    #[serde(default)]
    pub conditions: Vec<EtcdClusterCondition>,

    /// Member readiness as seen by the operator
    #[serde(default)]
    pub members: EtcdMemberStatus,
}

/// A condition on an EtcdCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterCondition {
    /// Condition type, e.g. `Available`
    #[serde(rename = "type")]
    pub type_: String,

    /// One of True, False, Unknown
    pub status: String,

    /// Reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Member readiness lists
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdMemberStatus {
    /// Names of ready members
    #[serde(default)]
    pub ready: Vec<String>,

    /// Names of unready members
    #[serde(default)]
    pub unready: Vec<String>,
}

impl EtcdCluster {
    /// Condition of the given type, if reported
    pub fn condition(&self, type_: &str) -> Option<&EtcdClusterCondition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
            .iter()
            .find(|c| c.type_ == type_)
    }

    /// Number of members the operator reports as ready
    pub fn ready_members(&self) -> usize {
        self.status.as_ref().map(|s| s.members.ready.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_fields_serialize_with_operator_casing() {
        let spec = EtcdClusterSpec {
            size: 1,
            version: "3.4.9".to_string(),
            tls: Some(EtcdTlsPolicy {
                static_tls: Some(StaticTls {
                    member: Some(TlsMemberSecrets {
                        server_secret: Some("etcd-server-tls".to_string()),
                        peer_secret: Some("etcd-peer-tls".to_string()),
                    }),
                    operator_secret: Some("etcd-client-tls".to_string()),
                }),
            }),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["TLS"]["static"]["member"]["serverSecret"], "etcd-server-tls");
        assert_eq!(value["TLS"]["static"]["operatorSecret"], "etcd-client-tls");
    }

    #[test]
    fn condition_lookup_and_ready_members() {
        let mut cluster = EtcdCluster::new(
            "etcd",
            EtcdClusterSpec {
                size: 1,
                version: "3.4.9".to_string(),
                tls: None,
            },
        );
        assert!(cluster.condition(ETCD_CONDITION_AVAILABLE).is_none());
        assert_eq!(cluster.ready_members(), 0);

        cluster.status = Some(EtcdClusterStatus {
            conditions: vec![EtcdClusterCondition {
                type_: ETCD_CONDITION_AVAILABLE.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }],
            members: EtcdMemberStatus {
                ready: vec!["etcd-0".to_string()],
                unready: vec![],
            },
        });
        assert_eq!(
            cluster.condition(ETCD_CONDITION_AVAILABLE).unwrap().status,
            "True"
        );
        assert_eq!(cluster.ready_members(), 1);
    }
}

//! Etcd subsystem
//!
//! The hosted control plane does not run etcd directly. It deploys the
//! upstream etcd operator into the control plane namespace, hands it TLS
//! secrets issued under the root CA, and creates an `EtcdCluster` resource
//! for the operator to manage. This module builds those objects and derives
//! the `EtcdAvailable` condition from the cluster the operator reports.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, PodSpec, PodTemplateSpec, Secret,
    ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;

use crate::crd::{
    ConditionStatus, EtcdCluster, EtcdClusterSpec, EtcdTlsPolicy, StaticTls, TlsMemberSecrets,
    ETCD_CONDITION_AVAILABLE,
};
use crate::pki::{self, CertSpec};
use crate::Error;

/// Name of the EtcdCluster resource
pub const CLUSTER_NAME: &str = "etcd";
/// Secret holding the client certificate the operator and KAS use
pub const CLIENT_SECRET_NAME: &str = "etcd-client-tls";
/// Secret holding the member serving certificate
pub const SERVER_SECRET_NAME: &str = "etcd-server-tls";
/// Secret holding the member peer certificate
pub const PEER_SECRET_NAME: &str = "etcd-peer-tls";
/// Name shared by the operator ServiceAccount, Role, RoleBinding, Deployment
pub const OPERATOR_NAME: &str = "etcd-operator";

/// Label the etcd operator stamps on member pods
pub const CLUSTER_POD_LABEL: &str = "etcd_cluster";

/// How long a cluster may run with zero ready members before it is declared
/// failed and recreated
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::minutes(5);

// Data keys the etcd operator expects in its static TLS secrets
/// Client certificate key in the client TLS secret
pub const CLIENT_CERT_KEY: &str = "etcd-client.crt";
/// Client private key in the client TLS secret
pub const CLIENT_KEY_KEY: &str = "etcd-client.key";
/// CA bundle key in the client TLS secret
pub const CLIENT_CA_KEY: &str = "etcd-client-ca.crt";
const SERVER_CERT_KEY: &str = "server.crt";
const SERVER_KEY_KEY: &str = "server.key";
const SERVER_CA_KEY: &str = "server-ca.crt";
const PEER_CERT_KEY: &str = "peer.crt";
const PEER_KEY_KEY: &str = "peer.key";
const PEER_CA_KEY: &str = "peer-ca.crt";

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// EtcdCluster shell with name and namespace set
pub fn cluster(namespace: &str) -> EtcdCluster {
    EtcdCluster {
        metadata: meta(CLUSTER_NAME, namespace),
        spec: EtcdClusterSpec::default(),
        status: None,
    }
}

/// Client TLS secret shell
pub fn client_secret(namespace: &str) -> Secret {
    Secret {
        metadata: meta(CLIENT_SECRET_NAME, namespace),
        ..Default::default()
    }
}

/// Member serving TLS secret shell
pub fn server_secret(namespace: &str) -> Secret {
    Secret {
        metadata: meta(SERVER_SECRET_NAME, namespace),
        ..Default::default()
    }
}

/// Member peer TLS secret shell
pub fn peer_secret(namespace: &str) -> Secret {
    Secret {
        metadata: meta(PEER_SECRET_NAME, namespace),
        ..Default::default()
    }
}

/// Operator ServiceAccount shell
pub fn operator_service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(OPERATOR_NAME, namespace),
        ..Default::default()
    }
}

/// Operator Role shell
pub fn operator_role(namespace: &str) -> Role {
    Role {
        metadata: meta(OPERATOR_NAME, namespace),
        ..Default::default()
    }
}

/// Operator RoleBinding shell
pub fn operator_role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: meta(OPERATOR_NAME, namespace),
        ..Default::default()
    }
}

/// Operator Deployment shell
pub fn operator_deployment(namespace: &str) -> Deployment {
    Deployment {
        metadata: meta(OPERATOR_NAME, namespace),
        ..Default::default()
    }
}

/// Fill in the EtcdCluster spec with static TLS wiring
pub fn reconcile_cluster(cluster: &mut EtcdCluster, size: i32, version: &str) {
    cluster.spec = EtcdClusterSpec {
        size,
        version: version.to_string(),
        tls: Some(EtcdTlsPolicy {
            static_tls: Some(StaticTls {
                member: Some(TlsMemberSecrets {
                    server_secret: Some(SERVER_SECRET_NAME.to_string()),
                    peer_secret: Some(PEER_SECRET_NAME.to_string()),
                }),
                operator_secret: Some(CLIENT_SECRET_NAME.to_string()),
            }),
        }),
    };
}

fn reconcile_etcd_cert_secret(
    secret: &mut Secret,
    root_ca: &Secret,
    spec: &CertSpec,
    cert_key: &str,
    key_key: &str,
    ca_key: &str,
) -> Result<(), Error> {
    let expected = [cert_key, key_key, ca_key];
    if pki::signed_secret_up_to_date(secret, root_ca, &expected) {
        return Ok(());
    }
    let issued = pki::sign_certificate(spec, root_ca)?;
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.clear();
    data.insert(cert_key.to_string(), ByteString(issued.cert_pem));
    data.insert(key_key.to_string(), ByteString(issued.key_pem));
    data.insert(ca_key.to_string(), ByteString(issued.ca_pem));
    pki::annotate_with_ca(secret, root_ca);
    Ok(())
}

/// Issue the client certificate the operator and the API server use to
/// reach etcd
pub fn reconcile_client_secret(secret: &mut Secret, root_ca: &Secret) -> Result<(), Error> {
    let spec = CertSpec::new("etcd-client", "etcd").client_auth();
    reconcile_etcd_cert_secret(
        secret,
        root_ca,
        &spec,
        CLIENT_CERT_KEY,
        CLIENT_KEY_KEY,
        CLIENT_CA_KEY,
    )
}

/// Issue the member serving certificate
pub fn reconcile_server_secret(secret: &mut Secret, root_ca: &Secret) -> Result<(), Error> {
    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let mut spec = CertSpec::new("etcd-server", "etcd").server_auth();
    spec.dns_names = vec![
        "localhost".to_string(),
        format!("*.{}.{}.svc", CLUSTER_NAME, namespace),
        format!("{}-client", CLUSTER_NAME),
        format!("{}-client.{}.svc", CLUSTER_NAME, namespace),
        format!("{}-client.{}.svc.cluster.local", CLUSTER_NAME, namespace),
    ];
    reconcile_etcd_cert_secret(
        secret,
        root_ca,
        &spec,
        SERVER_CERT_KEY,
        SERVER_KEY_KEY,
        SERVER_CA_KEY,
    )
}

/// Issue the member peer certificate
pub fn reconcile_peer_secret(secret: &mut Secret, root_ca: &Secret) -> Result<(), Error> {
    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let mut spec = CertSpec::new("etcd-peer", "etcd").server_auth();
    spec.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
    ];
    spec.dns_names = vec![
        format!("*.{}.{}.svc", CLUSTER_NAME, namespace),
        format!("*.{}.{}.svc.cluster.local", CLUSTER_NAME, namespace),
    ];
    reconcile_etcd_cert_secret(
        secret,
        root_ca,
        &spec,
        PEER_CERT_KEY,
        PEER_KEY_KEY,
        PEER_CA_KEY,
    )
}

/// Grant the operator the namespace-scoped access it needs
pub fn reconcile_operator_role(role: &mut Role) {
    role.rules = Some(vec![
        PolicyRule {
            api_groups: Some(vec!["etcd.database.coreos.com".to_string()]),
            resources: Some(vec!["etcdclusters".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![
                "pods".to_string(),
                "services".to_string(),
                "endpoints".to_string(),
                "persistentvolumeclaims".to_string(),
                "events".to_string(),
            ]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["apps".to_string()]),
            resources: Some(vec!["deployments".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        },
    ]);
}

/// Bind the operator Role to the operator ServiceAccount
pub fn reconcile_operator_role_binding(binding: &mut RoleBinding) {
    let namespace = binding.metadata.namespace.clone().unwrap_or_default();
    binding.role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "Role".to_string(),
        name: OPERATOR_NAME.to_string(),
    };
    binding.subjects = Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: OPERATOR_NAME.to_string(),
        namespace: Some(namespace),
        ..Default::default()
    }]);
}

/// Fill in the operator Deployment spec
pub fn reconcile_operator_deployment(deployment: &mut Deployment, operator_image: &str) {
    let labels = BTreeMap::from([("name".to_string(), OPERATOR_NAME.to_string())]);
    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                service_account_name: Some(OPERATOR_NAME.to_string()),
                containers: vec![Container {
                    name: OPERATOR_NAME.to_string(),
                    image: Some(operator_image.to_string()),
                    command: Some(vec!["etcd-operator".to_string()]),
                    env: Some(vec![
                        downward_env("MY_POD_NAMESPACE", "metadata.namespace"),
                        downward_env("MY_POD_NAME", "metadata.name"),
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    });
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// What the `EtcdAvailable` condition should say, and whether the cluster
/// must be torn down
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusVerdict {
    /// Condition status to record
    pub status: ConditionStatus,
    /// Machine-readable reason
    pub reason: &'static str,
    /// Human-readable message
    pub message: &'static str,
    /// The cluster is wedged and must be deleted so the next pass recreates it
    pub delete_cluster: bool,
}

/// True when assessing this cluster requires inspecting member pods
///
/// Pod inspection is only relevant when a multi-member cluster is stuck at
/// one or fewer ready members, where a terminated container distinguishes a
/// lost quorum from a slow scale-up.
pub fn needs_pod_inspection(cluster: &EtcdCluster) -> bool {
    cluster.spec.size > 1 && cluster.ready_members() <= 1
}

/// Derive the `EtcdAvailable` verdict from the observed cluster
///
/// Precedence: an operator-reported Available wins; then a cluster with no
/// ready members past the bootstrap timeout is failed; then a stuck
/// multi-member cluster with terminated pods has lost quorum; everything
/// else is a scale-up in progress.
pub fn assess(cluster: &EtcdCluster, has_terminated_pods: bool, now: DateTime<Utc>) -> StatusVerdict {
    let available = cluster
        .condition(ETCD_CONDITION_AVAILABLE)
        .map(|c| c.status == "True")
        .unwrap_or(false);
    if available {
        return StatusVerdict {
            status: ConditionStatus::True,
            reason: "EtcdRunning",
            message: "Etcd cluster is running and available",
            delete_cluster: false,
        };
    }

    let age = cluster
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| now - t.0)
        .unwrap_or_else(Duration::zero);
    if cluster.ready_members() == 0 && age > BOOTSTRAP_TIMEOUT {
        return StatusVerdict {
            status: ConditionStatus::False,
            reason: "EtcdFailed",
            message: "Etcd cluster failed to bootstrap within timeout, recreating",
            delete_cluster: true,
        };
    }

    if needs_pod_inspection(cluster) && has_terminated_pods {
        return StatusVerdict {
            status: ConditionStatus::False,
            reason: "EtcdFailed",
            message: "Etcd has failed to achieve quorum after bootstrap, recreating",
            delete_cluster: true,
        };
    }

    StatusVerdict {
        status: ConditionStatus::False,
        reason: "ScalingUp",
        message: "Etcd cluster is scaling up",
        delete_cluster: false,
    }
}

/// True when any member pod has a terminated container
pub fn has_terminated_pods(pods: &[Pod]) -> bool {
    pods.iter()
        .flat_map(|p| p.status.iter())
        .flat_map(|s| s.container_statuses.iter().flatten())
        .any(|cs| {
            cs.state
                .as_ref()
                .map(|s| s.terminated.is_some())
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdClusterCondition, EtcdClusterStatus, EtcdMemberStatus};
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn cluster_with(size: i32, ready: usize, available: Option<&str>, age: Duration) -> EtcdCluster {
        let now = Utc::now();
        let mut c = cluster("cp");
        c.metadata.creation_timestamp = Some(Time(now - age));
        c.spec.size = size;
        c.status = Some(EtcdClusterStatus {
            conditions: available
                .map(|status| {
                    vec![EtcdClusterCondition {
                        type_: ETCD_CONDITION_AVAILABLE.to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                })
                .unwrap_or_default(),
            members: EtcdMemberStatus {
                ready: (0..ready).map(|i| format!("etcd-{}", i)).collect(),
                unready: vec![],
            },
        });
        c
    }

    #[test]
    fn available_condition_wins_regardless_of_age() {
        let c = cluster_with(1, 1, Some("True"), Duration::hours(2));
        let verdict = assess(&c, false, Utc::now());
        assert_eq!(verdict.status, ConditionStatus::True);
        assert_eq!(verdict.reason, "EtcdRunning");
        assert!(!verdict.delete_cluster);
    }

    #[test]
    fn bootstrap_timeout_with_no_ready_members_deletes_cluster() {
        let c = cluster_with(1, 0, None, Duration::minutes(6));
        let verdict = assess(&c, false, Utc::now());
        assert_eq!(verdict.status, ConditionStatus::False);
        assert_eq!(verdict.reason, "EtcdFailed");
        assert!(verdict.delete_cluster);
    }

    #[test]
    fn young_cluster_with_no_ready_members_is_scaling_up() {
        let c = cluster_with(1, 0, None, Duration::minutes(2));
        let verdict = assess(&c, false, Utc::now());
        assert_eq!(verdict.reason, "ScalingUp");
        assert!(!verdict.delete_cluster);
    }

    #[test]
    fn stuck_multi_member_cluster_with_terminated_pods_is_failed() {
        let c = cluster_with(3, 1, None, Duration::minutes(2));
        assert!(needs_pod_inspection(&c));

        let verdict = assess(&c, true, Utc::now());
        assert_eq!(verdict.reason, "EtcdFailed");
        assert!(verdict.delete_cluster);

        let verdict = assess(&c, false, Utc::now());
        assert_eq!(verdict.reason, "ScalingUp");
        assert!(!verdict.delete_cluster);
    }

    #[test]
    fn healthy_multi_member_cluster_needs_no_pod_inspection() {
        let c = cluster_with(3, 2, None, Duration::minutes(2));
        assert!(!needs_pod_inspection(&c));
    }

    #[test]
    fn terminated_pod_detection() {
        let running = Pod::default();
        assert!(!has_terminated_pods(&[running.clone()]));

        let terminated = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated::default()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(has_terminated_pods(&[running, terminated]));
    }

    #[test]
    fn cluster_spec_wires_static_tls_secrets() {
        let mut c = cluster("cp");
        reconcile_cluster(&mut c, 1, "3.4.9");
        assert_eq!(c.spec.size, 1);
        assert_eq!(c.spec.version, "3.4.9");
        let static_tls = c.spec.tls.unwrap().static_tls.unwrap();
        assert_eq!(static_tls.operator_secret.as_deref(), Some(CLIENT_SECRET_NAME));
        let member = static_tls.member.unwrap();
        assert_eq!(member.server_secret.as_deref(), Some(SERVER_SECRET_NAME));
        assert_eq!(member.peer_secret.as_deref(), Some(PEER_SECRET_NAME));
    }

    #[test]
    fn etcd_cert_secrets_are_idempotent_under_one_ca() {
        let mut root_ca = Secret {
            metadata: ObjectMeta {
                name: Some(pki::ROOT_CA_SECRET_NAME.to_string()),
                namespace: Some("cp".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        pki::reconcile_root_ca(&mut root_ca).unwrap();

        let mut secret = server_secret("cp");
        reconcile_server_secret(&mut secret, &root_ca).unwrap();
        let first = secret.data.clone();
        assert!(first.as_ref().unwrap().contains_key("server.crt"));
        assert!(first.as_ref().unwrap().contains_key("server-ca.crt"));

        reconcile_server_secret(&mut secret, &root_ca).unwrap();
        assert_eq!(secret.data, first);
    }

    #[test]
    fn operator_role_binding_targets_service_account() {
        let mut binding = operator_role_binding("cp");
        reconcile_operator_role_binding(&mut binding);
        assert_eq!(binding.role_ref.name, OPERATOR_NAME);
        let subject = &binding.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.namespace.as_deref(), Some("cp"));
    }
}

//! Kube-controller-manager subsystem
//!
//! The controller manager needs three pieces beyond the API server's
//! artifacts: a cluster signer, which is a second-tier CA it uses to sign
//! kubelet serving certificates, a small config file, and the deployment
//! wiring the signer, the root CA, the service kubeconfig, and the service
//! account signing key into the container.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec,
    Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde_json::json;

use crate::crd::ConditionStatus;
use crate::pki::{self, CertSpec, Validity};
use crate::{kas, Error};

/// Name of the controller manager Deployment
pub const KCM_NAME: &str = "kube-controller-manager";
/// Secret holding the cluster signer CA
pub const CLUSTER_SIGNER_SECRET_NAME: &str = "cluster-signer";
/// ConfigMap holding the serialized controller manager config
pub const CONFIG_NAME: &str = "kcm-config";

/// Cluster signer certificate key
pub const SIGNER_CERT_KEY: &str = "ca.crt";
/// Cluster signer private key key
pub const SIGNER_KEY_KEY: &str = "ca.key";
/// Key under which the config ConfigMap stores the serialized config
pub const CONFIG_KEY: &str = "config.json";

// Volume names
const CONFIG_VOLUME: &str = "kcm-config";
const ROOT_CA_VOLUME: &str = "root-ca";
const WORK_LOGS_VOLUME: &str = "logs";
const KUBECONFIG_VOLUME: &str = "kubeconfig";
const CERT_DIR_VOLUME: &str = "certs";
const CLUSTER_SIGNER_VOLUME: &str = "cluster-signer";
const SERVICE_SIGNER_VOLUME: &str = "service-signer";

// Mount paths
const CONFIG_MOUNT: &str = "/etc/kubernetes/config";
const ROOT_CA_MOUNT: &str = "/etc/kubernetes/certs/root-ca";
const WORK_LOGS_MOUNT: &str = "/var/log/kube-controller-manager";
const KUBECONFIG_MOUNT: &str = "/etc/kubernetes/secrets/svc-kubeconfig";
const CERT_DIR_MOUNT: &str = "/var/run/kubernetes";
const CLUSTER_SIGNER_MOUNT: &str = "/etc/kubernetes/certs/cluster-signer";
const SERVICE_SIGNER_MOUNT: &str = "/etc/kubernetes/certs/service-signer";

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), KCM_NAME.to_string())])
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Cluster signer secret shell
pub fn cluster_signer_secret(namespace: &str) -> Secret {
    Secret {
        metadata: meta(CLUSTER_SIGNER_SECRET_NAME, namespace),
        ..Default::default()
    }
}

/// Config ConfigMap shell
pub fn config(namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: meta(CONFIG_NAME, namespace),
        ..Default::default()
    }
}

/// Deployment shell
pub fn deployment(namespace: &str) -> Deployment {
    Deployment {
        metadata: meta(KCM_NAME, namespace),
        ..Default::default()
    }
}

/// Issue the cluster signer, a ten-year CA under the root
pub fn reconcile_cluster_signer_secret(secret: &mut Secret, root_ca: &Secret) -> Result<(), Error> {
    if !pki::valid_ca(root_ca) {
        return Err(Error::invalid_root_ca(format!(
            "invalid CA signer secret {}",
            root_ca.metadata.name.as_deref().unwrap_or("<unnamed>")
        )));
    }
    secret.type_ = Some("Opaque".to_string());
    let expected = [SIGNER_CERT_KEY, SIGNER_KEY_KEY];
    if pki::signed_secret_up_to_date(secret, root_ca, &expected) {
        return Ok(());
    }
    let mut spec = CertSpec::new("cluster-signer", "openshift");
    spec.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyEncipherment,
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyCertSign,
    ];
    spec.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
    ];
    spec.validity = Validity::TenYears;
    spec.is_ca = true;

    let issued = pki::sign_certificate(&spec, root_ca)?;
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.clear();
    data.insert(SIGNER_CERT_KEY.to_string(), ByteString(issued.cert_pem));
    data.insert(SIGNER_KEY_KEY.to_string(), ByteString(issued.key_pem));
    pki::annotate_with_ca(secret, root_ca);
    Ok(())
}

/// Serialize the controller manager configuration
pub fn reconcile_config(config_map: &mut ConfigMap) -> Result<(), Error> {
    let config = json!({
        "kind": "KubeControllerManagerConfig",
        "apiVersion": "kubecontrolplane.config.openshift.io/v1",
        "extendedArguments": {},
        "serviceServingCert": {
            "certFile": "",
        },
    });
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(CONFIG_KEY.to_string(), serde_json::to_string(&config)?);
    Ok(())
}

fn args(pod_cidr: &str, service_cidr: &str) -> Vec<String> {
    let kubeconfig = format!("{}/{}", KUBECONFIG_MOUNT, kas::KUBECONFIG_KEY);
    let mut args = vec![
        format!("--openshift-config={}/{}", CONFIG_MOUNT, CONFIG_KEY),
        format!("--kubeconfig={}", kubeconfig),
        format!("--authentication-kubeconfig={}", kubeconfig),
        format!("--authorization-kubeconfig={}", kubeconfig),
        "--allocate-node-cidrs=true".to_string(),
        format!("--cert-dir={}", CERT_DIR_MOUNT),
        format!("--cluster-cidr={}", pod_cidr),
        format!("--cluster-signing-cert-file={}/{}", CLUSTER_SIGNER_MOUNT, SIGNER_CERT_KEY),
        format!("--cluster-signing-key-file={}/{}", CLUSTER_SIGNER_MOUNT, SIGNER_KEY_KEY),
        "--configure-cloud-routes=false".to_string(),
        "--controllers=*".to_string(),
        "--controllers=-ttl".to_string(),
        "--controllers=-bootstrapsigner".to_string(),
        "--controllers=-tokencleaner".to_string(),
        "--enable-dynamic-provisioning=true".to_string(),
        "--kube-api-burst=300".to_string(),
        "--kube-api-qps=150".to_string(),
        "--leader-elect-resource-lock=configmaps".to_string(),
        "--leader-elect=true".to_string(),
        "--leader-elect-retry-period=3s".to_string(),
        "--port=0".to_string(),
        format!("--root-ca-file={}/{}", ROOT_CA_MOUNT, pki::CA_CERT_KEY),
        "--secure-port=10257".to_string(),
        format!(
            "--service-account-private-key-file={}/{}",
            SERVICE_SIGNER_MOUNT,
            kas::SA_SIGNING_PRIVATE_KEY
        ),
        format!("--service-cluster-ip-range={}", service_cidr),
        "--use-service-account-credentials=true".to_string(),
        "--experimental-cluster-signing-duration=26280h".to_string(),
    ];
    for gate in [
        "APIPriorityAndFairness=true",
        "RotateKubeletServerCertificate=true",
        "SupportPodPidsLimit=true",
        "NodeDisruptionExclusion=true",
        "ServiceNodeExclusion=true",
        "DownwardAPIHugePages=true",
        "LegacyNodeRoleBehavior=false",
    ] {
        args.push(format!("--feature-gates={}", gate));
    }
    args
}

fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Fill in the controller manager Deployment spec
pub fn reconcile_deployment(
    deployment: &mut Deployment,
    pod_cidr: &str,
    service_cidr: &str,
    hyperkube_image: &str,
    replicas: i32,
) {
    deployment.spec = Some(DeploymentSpec {
        replicas: Some(replicas),
        selector: LabelSelector {
            match_labels: Some(labels()),
            ..Default::default()
        },
        strategy: Some(DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: Some(IntOrString::Int(3)),
                max_unavailable: Some(IntOrString::Int(1)),
            }),
        }),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                automount_service_account_token: Some(false),
                containers: vec![Container {
                    name: KCM_NAME.to_string(),
                    image: Some(hyperkube_image.to_string()),
                    command: Some(vec![
                        "hyperkube".to_string(),
                        "kube-controller-manager".to_string(),
                    ]),
                    args: Some(args(pod_cidr, service_cidr)),
                    volume_mounts: Some(vec![
                        volume_mount(CONFIG_VOLUME, CONFIG_MOUNT),
                        volume_mount(ROOT_CA_VOLUME, ROOT_CA_MOUNT),
                        volume_mount(WORK_LOGS_VOLUME, WORK_LOGS_MOUNT),
                        volume_mount(KUBECONFIG_VOLUME, KUBECONFIG_MOUNT),
                        volume_mount(CLUSTER_SIGNER_VOLUME, CLUSTER_SIGNER_MOUNT),
                        volume_mount(CERT_DIR_VOLUME, CERT_DIR_MOUNT),
                        volume_mount(SERVICE_SIGNER_VOLUME, SERVICE_SIGNER_MOUNT),
                    ]),
                    ..Default::default()
                }],
                volumes: Some(vec![
                    Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: CONFIG_NAME.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    secret_volume(ROOT_CA_VOLUME, pki::ROOT_CA_SECRET_NAME),
                    Volume {
                        name: WORK_LOGS_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    },
                    secret_volume(KUBECONFIG_VOLUME, kas::SERVICE_KUBECONFIG_SECRET_NAME),
                    secret_volume(CLUSTER_SIGNER_VOLUME, CLUSTER_SIGNER_SECRET_NAME),
                    Volume {
                        name: CERT_DIR_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    },
                    secret_volume(SERVICE_SIGNER_VOLUME, kas::SA_KEY_SECRET_NAME),
                ]),
                ..Default::default()
            }),
        },
        ..Default::default()
    });
}

/// Derive the `KubeControllerManagerAvailable` verdict from the deployment
pub fn assess(deployment: &Deployment) -> (ConditionStatus, &'static str, &'static str) {
    if crate::workload_available(deployment) {
        (
            ConditionStatus::True,
            "KCMRunning",
            "Kube controller manager is running and available",
        )
    } else {
        (
            ConditionStatus::False,
            "KCMScalingUp",
            "Kube controller manager is not yet ready",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::pem::parse as parse_pem;
    use x509_parser::prelude::*;

    fn test_root_ca() -> Secret {
        let mut ca = Secret {
            metadata: meta(pki::ROOT_CA_SECRET_NAME, "cp"),
            ..Default::default()
        };
        pki::reconcile_root_ca(&mut ca).unwrap();
        ca
    }

    #[test]
    fn cluster_signer_is_a_ca_under_the_root() {
        let root = test_root_ca();
        let mut signer = cluster_signer_secret("cp");
        reconcile_cluster_signer_secret(&mut signer, &root).unwrap();

        let data = signer.data.as_ref().unwrap();
        let cert_pem = parse_pem(&data[SIGNER_CERT_KEY].0).unwrap();
        let (_, cert) = X509Certificate::from_der(cert_pem.contents()).unwrap();
        assert!(matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca));
        assert!(!cert.subject().to_string().is_empty());

        // The signer itself passes CA validation, so it could issue leaves
        assert!(pki::valid_ca(&Secret {
            data: signer.data.clone(),
            ..Default::default()
        }));
    }

    #[test]
    fn cluster_signer_is_stable_across_passes() {
        let root = test_root_ca();
        let mut signer = cluster_signer_secret("cp");
        reconcile_cluster_signer_secret(&mut signer, &root).unwrap();
        let first = signer.data.clone();

        reconcile_cluster_signer_secret(&mut signer, &root).unwrap();
        assert_eq!(signer.data, first);
    }

    #[test]
    fn config_serializes_expected_shape() {
        let mut cm = config("cp");
        reconcile_config(&mut cm).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&cm.data.as_ref().unwrap()[CONFIG_KEY]).unwrap();
        assert_eq!(parsed["kind"], "KubeControllerManagerConfig");
    }

    #[test]
    fn deployment_args_use_correct_cidrs() {
        let mut deploy = deployment("cp");
        reconcile_deployment(&mut deploy, "10.128.0.0/14", "172.30.0.0/16", "hyperkube-img", 1);

        let container = &deploy
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0];
        let args = container.args.as_ref().unwrap();
        assert!(args.contains(&"--cluster-cidr=10.128.0.0/14".to_string()));
        assert!(args.contains(&"--service-cluster-ip-range=172.30.0.0/16".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--cluster-signing-cert-file=")));
    }

    #[test]
    fn deployment_mounts_signer_and_kubeconfig() {
        let mut deploy = deployment("cp");
        reconcile_deployment(&mut deploy, "10.128.0.0/14", "172.30.0.0/16", "img", 1);

        let pod = deploy
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        let secret_volumes: Vec<_> = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .filter_map(|v| v.secret.as_ref().and_then(|s| s.secret_name.clone()))
            .collect();
        assert!(secret_volumes.contains(&CLUSTER_SIGNER_SECRET_NAME.to_string()));
        assert!(secret_volumes.contains(&kas::SERVICE_KUBECONFIG_SECRET_NAME.to_string()));
        assert!(secret_volumes.contains(&kas::SA_KEY_SECRET_NAME.to_string()));
    }
}

//! Kube-apiserver subsystem
//!
//! Builds every object the hosted API server needs in the control plane
//! namespace: the ClusterIP service, serving and aggregator certificates,
//! the service account signing key, admin kubeconfigs, audit and server
//! configuration, OAuth metadata, and the deployment itself. The deployment
//! runs three containers: an init container that renders bootstrap
//! manifests from the release's config-operator image, a sidecar that
//! applies them through the localhost kubeconfig once the server answers,
//! and the API server proper from the hyperkube image.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use base64::Engine;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    PodSpec, PodTemplateSpec, Probe, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde_json::json;

use crate::crd::ConditionStatus;
use crate::pki::{self, CertSpec, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::{etcd, Error};

/// Name shared by the API server Service and Deployment
pub const KAS_NAME: &str = "kube-apiserver";
/// Secret holding the serving certificate
pub const SERVER_CERT_SECRET_NAME: &str = "kas-server-crt";
/// Secret holding the aggregator proxy client certificate
pub const AGGREGATOR_CERT_SECRET_NAME: &str = "kas-aggregator-crt";
/// Secret holding the service account signing key pair
pub const SA_KEY_SECRET_NAME: &str = "kas-sa-key";
/// Secret holding the admin kubeconfig pointed at the in-cluster service
pub const SERVICE_KUBECONFIG_SECRET_NAME: &str = "kubeconfig";
/// Secret holding the admin kubeconfig pointed at localhost
pub const LOCALHOST_KUBECONFIG_SECRET_NAME: &str = "localhost-kubeconfig";
/// ConfigMap holding the audit policy
pub const AUDIT_CONFIG_NAME: &str = "kas-audit-config";
/// ConfigMap holding the serialized API server config
pub const CONFIG_NAME: &str = "kas-config";
/// ConfigMap holding the OAuth discovery document
pub const OAUTH_METADATA_NAME: &str = "oauth-metadata";

/// Key under which kubeconfig secrets store the kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";
/// Key under which the SA key secret stores the private key
pub const SA_SIGNING_PRIVATE_KEY: &str = "service-account.key";
/// Key under which the SA key secret stores the public key
pub const SA_SIGNING_PUBLIC_KEY: &str = "service-account.pub";
/// Key under which the audit ConfigMap stores the policy
pub const AUDIT_POLICY_KEY: &str = "policy.yaml";
/// Key under which the config ConfigMap stores the serialized config
pub const CONFIG_KEY: &str = "config.json";
/// Key under which the OAuth metadata ConfigMap stores the document
pub const OAUTH_METADATA_KEY: &str = "oauthMetadata.json";

const ETCD_CLIENT_PORT: u16 = 2379;
const AUDIT_LOG_FILE: &str = "audit.log";

// Container names
const INIT_BOOTSTRAP_CONTAINER: &str = "init-bootstrap";
const APPLY_BOOTSTRAP_CONTAINER: &str = "apply-bootstrap";

// Volume names
const BOOTSTRAP_MANIFESTS_VOLUME: &str = "bootstrap-manifests";
const LOCALHOST_KUBECONFIG_VOLUME: &str = "localhost-kubeconfig";
const WORK_LOGS_VOLUME: &str = "logs";
const CONFIG_VOLUME: &str = "kas-config";
const AUDIT_CONFIG_VOLUME: &str = "audit-config";
const ROOT_CA_VOLUME: &str = "root-ca";
const SERVER_CERT_VOLUME: &str = "server-crt";
const AGGREGATOR_CERT_VOLUME: &str = "aggregator-crt";
const SA_KEY_VOLUME: &str = "svcacct-key";
const ETCD_CLIENT_CERT_VOLUME: &str = "etcd-client-crt";
const OAUTH_METADATA_VOLUME: &str = "oauth-metadata";

// Mount paths
const INIT_WORK_MOUNT: &str = "/work";
const APPLY_KUBECONFIG_MOUNT: &str = "/var/secrets/localhost-kubeconfig";
const WORK_LOGS_MOUNT: &str = "/var/log/kube-apiserver";
const CONFIG_MOUNT: &str = "/etc/kubernetes/config";
const AUDIT_CONFIG_MOUNT: &str = "/etc/kubernetes/audit";
const ROOT_CA_MOUNT: &str = "/etc/kubernetes/certs/root-ca";
const SERVER_CERT_MOUNT: &str = "/etc/kubernetes/certs/server";
const AGGREGATOR_CERT_MOUNT: &str = "/etc/kubernetes/certs/aggregator";
const ETCD_CLIENT_CERT_MOUNT: &str = "/etc/kubernetes/certs/etcd";
const SA_KEY_MOUNT: &str = "/etc/kubernetes/secrets/svcacct-key";
const OAUTH_METADATA_MOUNT: &str = "/etc/kubernetes/oauth";

const AUDIT_POLICY: &str = r#"
apiVersion: audit.k8s.io/v1beta1
kind: Policy
omitStages:
- RequestReceived
rules:
- level: None
  resources:
  - group: ''
    resources:
    - events
- level: None
  resources:
  - group: oauth.openshift.io
    resources:
    - oauthaccesstokens
    - oauthauthorizetokens
- level: None
  nonResourceURLs:
  - "/api*"
  - "/version"
  - "/healthz"
  - "/readyz"
  userGroups:
  - system:authenticated
  - system:unauthenticated
- level: Metadata
  omitStages:
  - RequestReceived
"#;

const OAUTH_METADATA: &str = r#"{
"issuer": "https://oauth-openshift",
"authorization_endpoint": "https://oauth-openshift/oauth/authorize",
"token_endpoint": "https://oauth-openshift/oauth/token",
  "scopes_supported": [
    "user:check-access",
    "user:full",
    "user:info",
    "user:list-projects",
    "user:list-scoped-projects"
  ],
  "response_types_supported": [
    "code",
    "token"
  ],
  "grant_types_supported": [
    "authorization_code",
    "implicit"
  ],
  "code_challenge_methods_supported": [
    "plain",
    "S256"
  ]
}
"#;

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), KAS_NAME.to_string())])
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn secret_shell(name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: meta(name, namespace),
        ..Default::default()
    }
}

fn config_map_shell(name: &str, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: meta(name, namespace),
        ..Default::default()
    }
}

/// Serving certificate secret shell
pub fn server_cert_secret(namespace: &str) -> Secret {
    secret_shell(SERVER_CERT_SECRET_NAME, namespace)
}

/// Aggregator certificate secret shell
pub fn aggregator_cert_secret(namespace: &str) -> Secret {
    secret_shell(AGGREGATOR_CERT_SECRET_NAME, namespace)
}

/// Service account signing key secret shell
pub fn service_account_signing_key_secret(namespace: &str) -> Secret {
    secret_shell(SA_KEY_SECRET_NAME, namespace)
}

/// Service kubeconfig secret shell
pub fn service_kubeconfig_secret(namespace: &str) -> Secret {
    secret_shell(SERVICE_KUBECONFIG_SECRET_NAME, namespace)
}

/// Localhost kubeconfig secret shell
pub fn localhost_kubeconfig_secret(namespace: &str) -> Secret {
    secret_shell(LOCALHOST_KUBECONFIG_SECRET_NAME, namespace)
}

/// Audit policy ConfigMap shell
pub fn audit_config(namespace: &str) -> ConfigMap {
    config_map_shell(AUDIT_CONFIG_NAME, namespace)
}

/// API server config ConfigMap shell
pub fn config(namespace: &str) -> ConfigMap {
    config_map_shell(CONFIG_NAME, namespace)
}

/// OAuth metadata ConfigMap shell
pub fn oauth_metadata(namespace: &str) -> ConfigMap {
    config_map_shell(OAUTH_METADATA_NAME, namespace)
}

/// API server Service shell
pub fn service(namespace: &str) -> Service {
    Service {
        metadata: meta(KAS_NAME, namespace),
        ..Default::default()
    }
}

/// API server Deployment shell
pub fn deployment(namespace: &str) -> Deployment {
    Deployment {
        metadata: meta(KAS_NAME, namespace),
        ..Default::default()
    }
}

/// Fill in the ClusterIP service fronting the API server
pub fn reconcile_service(svc: &mut Service, internal_port: i32, external_port: i32) {
    let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
    let ports = spec.ports.get_or_insert_with(Vec::new);
    if let Some(port) = ports.first_mut() {
        port.port = external_port;
        port.target_port = Some(IntOrString::Int(internal_port));
    } else {
        ports.push(ServicePort {
            port: external_port,
            target_port: Some(IntOrString::Int(internal_port)),
            ..Default::default()
        });
    }
    spec.selector = Some(labels());
    spec.type_ = Some("ClusterIP".to_string());
}

/// First usable address of an IPv4 CIDR, used as the in-cluster service IP
/// the API server claims
pub fn first_ip(cidr: &str) -> Result<IpAddr, Error> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::pki(format!("cannot parse service CIDR {}", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| Error::pki(format!("cannot parse service CIDR {}: {}", cidr, e)))?;
    let prefix: u32 = prefix
        .parse()
        .map_err(|e| Error::pki(format!("cannot parse service CIDR {}: {}", cidr, e)))?;
    if prefix > 32 {
        return Err(Error::pki(format!("cannot parse service CIDR {}", cidr)));
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = u32::from(addr) & mask;
    let first = network
        .checked_add(1)
        .ok_or_else(|| Error::pki(format!("cannot parse service CIDR {}", cidr)))?;
    Ok(IpAddr::V4(Ipv4Addr::from(first)))
}

/// Issue the serving certificate with the service DNS names and IPs
pub fn reconcile_server_cert_secret(
    secret: &mut Secret,
    root_ca: &Secret,
    service_cidr: &str,
) -> Result<(), Error> {
    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let mut spec = CertSpec::new("kubernetes", "kubernetes").server_auth();
    spec.dns_names = vec![
        "localhost".to_string(),
        "kubernetes".to_string(),
        "kubernetes.default.svc".to_string(),
        "kubernetes.default.svc.cluster.local".to_string(),
        KAS_NAME.to_string(),
        format!("{}.{}.svc", KAS_NAME, namespace),
        format!("{}.{}.svc.cluster.local", KAS_NAME, namespace),
    ];
    spec.ip_addresses = vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        first_ip(service_cidr)?,
    ];
    pki::reconcile_signed_tls_secret(secret, root_ca, &spec)
}

/// Issue the aggregator proxy client certificate
pub fn reconcile_aggregator_cert_secret(secret: &mut Secret, root_ca: &Secret) -> Result<(), Error> {
    let mut spec = CertSpec::new("system:openshift-aggregator", "kubernetes");
    spec.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
    ];
    pki::reconcile_signed_tls_secret(secret, root_ca, &spec)
}

/// Generate the service account token signing key pair
///
/// The key has no issuing CA, so freshness is key-set equality only.
pub fn reconcile_service_account_signing_key_secret(secret: &mut Secret) -> Result<(), Error> {
    secret.type_ = Some("Opaque".to_string());
    let expected = [SA_SIGNING_PRIVATE_KEY, SA_SIGNING_PUBLIC_KEY];
    if pki::secret_up_to_date(secret, &expected) {
        return Ok(());
    }
    let (private_pem, public_pem) = pki::generate_key_pair()?;
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.clear();
    data.insert(SA_SIGNING_PRIVATE_KEY.to_string(), ByteString(private_pem));
    data.insert(SA_SIGNING_PUBLIC_KEY.to_string(), ByteString(public_pem));
    Ok(())
}

/// Admin kubeconfig pointed at the in-cluster service
pub fn reconcile_service_kubeconfig_secret(
    secret: &mut Secret,
    root_ca: &Secret,
    port: i32,
) -> Result<(), Error> {
    let url = format!("https://{}:{}", KAS_NAME, port);
    reconcile_system_admin_kubeconfig(secret, root_ca, &url)
}

/// Admin kubeconfig pointed at localhost, used by the bootstrap sidecar
pub fn reconcile_localhost_kubeconfig_secret(
    secret: &mut Secret,
    root_ca: &Secret,
    port: i32,
) -> Result<(), Error> {
    let url = format!("https://localhost:{}", port);
    reconcile_system_admin_kubeconfig(secret, root_ca, &url)
}

fn reconcile_system_admin_kubeconfig(
    secret: &mut Secret,
    root_ca: &Secret,
    url: &str,
) -> Result<(), Error> {
    if !pki::valid_ca(root_ca) {
        return Err(Error::invalid_root_ca(format!(
            "invalid CA signer secret {}",
            root_ca.metadata.name.as_deref().unwrap_or("<unnamed>")
        )));
    }
    secret.type_ = Some("Opaque".to_string());
    if pki::signed_secret_up_to_date(secret, root_ca, &[KUBECONFIG_KEY]) {
        return Ok(());
    }
    let spec = CertSpec::new("system:admin", "system:masters").client_auth();
    let issued = pki::sign_certificate(&spec, root_ca)?;
    let kubeconfig = generate_kubeconfig(url, &issued.cert_pem, &issued.key_pem, &issued.ca_pem)?;
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.clear();
    data.insert(KUBECONFIG_KEY.to_string(), ByteString(kubeconfig));
    pki::annotate_with_ca(secret, root_ca);
    Ok(())
}

/// Render a single-context kubeconfig with embedded certificate data
pub fn generate_kubeconfig(
    url: &str,
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: &[u8],
) -> Result<Vec<u8>, Error> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "cluster",
            "cluster": {
                "server": url,
                "certificate-authority-data": b64.encode(ca_pem),
            },
        }],
        "users": [{
            "name": "admin",
            "user": {
                "client-certificate-data": b64.encode(cert_pem),
                "client-key-data": b64.encode(key_pem),
            },
        }],
        "contexts": [{
            "name": "admin",
            "context": {
                "cluster": "cluster",
                "user": "admin",
                "namespace": "default",
            },
        }],
        "current-context": "admin",
    });
    let rendered = serde_yaml::to_string(&config)?;
    Ok(rendered.into_bytes())
}

/// Write the audit policy
pub fn reconcile_audit_config(config_map: &mut ConfigMap) {
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(AUDIT_POLICY_KEY.to_string(), AUDIT_POLICY.to_string());
}

/// Write the OAuth discovery document
pub fn reconcile_oauth_metadata(config_map: &mut ConfigMap) {
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(OAUTH_METADATA_KEY.to_string(), OAUTH_METADATA.to_string());
}

/// Serialize the API server configuration
pub fn reconcile_config(
    config_map: &mut ConfigMap,
    service_cidr: &str,
    internal_port: i32,
) -> Result<(), Error> {
    let rendered = generate_config(service_cidr, internal_port)?;
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(CONFIG_KEY.to_string(), rendered);
    Ok(())
}

fn generate_config(service_cidr: &str, internal_port: i32) -> Result<String, Error> {
    let config = json!({
        "kind": "KubeAPIServerConfig",
        "apiVersion": "kubecontrolplane.config.openshift.io/v1",
        "apiServerArguments": {
            "advertise-address": ["172.20.0.1"],
            "allow-privileged": ["true"],
            "anonymous-auth": ["true"],
            "api-audiences": ["https://kubernetes.default.svc"],
            "audit-log-format": ["json"],
            "audit-log-maxbackup": ["10"],
            "audit-log-maxsize": ["100"],
            "audit-log-path": [format!("{}/{}", WORK_LOGS_MOUNT, AUDIT_LOG_FILE)],
            "audit-policy-file": [format!("{}/{}", AUDIT_CONFIG_MOUNT, AUDIT_POLICY_KEY)],
            "authorization-mode": ["Scope", "SystemMasters", "RBAC", "Node"],
            "client-ca-file": [format!("{}/{}", ROOT_CA_MOUNT, pki::CA_CERT_KEY)],
            "enable-admission-plugins": [
                "CertificateApproval",
                "CertificateSigning",
                "CertificateSubjectRestriction",
                "DefaultIngressClass",
                "DefaultStorageClass",
                "DefaultTolerationSeconds",
                "LimitRanger",
                "MutatingAdmissionWebhook",
                "NamespaceLifecycle",
                "NodeRestriction",
                "OwnerReferencesPermissionEnforcement",
                "PersistentVolumeClaimResize",
                "PersistentVolumeLabel",
                "PodNodeSelector",
                "PodTolerationRestriction",
                "Priority",
                "ResourceQuota",
                "RuntimeClass",
                "ServiceAccount",
                "StorageObjectInUseProtection",
                "TaintNodesByCondition",
                "ValidatingAdmissionWebhook",
                "authorization.openshift.io/RestrictSubjectBindings",
                "authorization.openshift.io/ValidateRoleBindingRestriction",
                "config.openshift.io/DenyDeleteClusterConfiguration",
                "config.openshift.io/ValidateAPIServer",
                "config.openshift.io/ValidateAuthentication",
                "config.openshift.io/ValidateConsole",
                "config.openshift.io/ValidateFeatureGate",
                "config.openshift.io/ValidateImage",
                "config.openshift.io/ValidateOAuth",
                "config.openshift.io/ValidateProject",
                "config.openshift.io/ValidateScheduler",
                "image.openshift.io/ImagePolicy",
                "network.openshift.io/ExternalIPRanger",
                "network.openshift.io/RestrictedEndpointsAdmission",
                "quota.openshift.io/ClusterResourceQuota",
                "quota.openshift.io/ValidateClusterResourceQuota",
                "route.openshift.io/IngressAdmission",
                "scheduling.openshift.io/OriginPodNodeEnvironment",
                "security.openshift.io/DefaultSecurityContextConstraints",
                "security.openshift.io/SCCExecRestrictions",
                "security.openshift.io/SecurityContextConstraint",
                "security.openshift.io/ValidateSecurityContextConstraints",
            ],
            "enable-aggregator-routing": ["true"],
            "enable-logs-handler": ["false"],
            "enable-swagger-ui": ["true"],
            "endpoint-reconciler-type": ["lease"],
            "etcd-cafile": [format!("{}/{}", ETCD_CLIENT_CERT_MOUNT, etcd::CLIENT_CA_KEY)],
            "etcd-certfile": [format!("{}/{}", ETCD_CLIENT_CERT_MOUNT, etcd::CLIENT_CERT_KEY)],
            "etcd-keyfile": [format!("{}/{}", ETCD_CLIENT_CERT_MOUNT, etcd::CLIENT_KEY_KEY)],
            "etcd-prefix": ["kubernetes.io"],
            "etcd-servers": [format!("https://{}-client:{}", etcd::CLUSTER_NAME, ETCD_CLIENT_PORT)],
            "event-ttl": ["3h"],
            "feature-gates": [
                "APIPriorityAndFairness=true",
                "RotateKubeletServerCertificate=true",
                "SupportPodPidsLimit=true",
                "NodeDisruptionExclusion=true",
                "ServiceNodeExclusion=true",
                "DownwardAPIHugePages=true",
                "LegacyNodeRoleBehavior=false",
            ],
            "goaway-chance": ["0"],
            "http2-max-streams-per-connection": ["2000"],
            "insecure-port": ["0"],
            "kubernetes-service-node-port": ["0"],
            "max-mutating-requests-inflight": ["1000"],
            "max-requests-inflight": ["3000"],
            "min-request-timeout": ["3600"],
            "proxy-client-cert-file": [format!("{}/{}", AGGREGATOR_CERT_MOUNT, TLS_CERT_KEY)],
            "proxy-client-key-file": [format!("{}/{}", AGGREGATOR_CERT_MOUNT, TLS_KEY_KEY)],
            "requestheader-allowed-names": [
                "kube-apiserver-proxy",
                "system:kube-apiserver-proxy",
                "system:openshift-aggregator",
            ],
            "requestheader-client-ca-file": [format!("{}/{}", ROOT_CA_MOUNT, pki::CA_CERT_KEY)],
            "requestheader-extra-headers-prefix": ["X-Remote-Extra-"],
            "requestheader-group-headers": ["X-Remote-Group"],
            "requestheader-username-headers": ["X-Remote-User"],
            "runtime-config": ["flowcontrol.apiserver.k8s.io/v1alpha1=true"],
            "service-account-issuer": ["https://kubernetes.default.svc"],
            "service-account-lookup": ["true"],
            "service-account-signing-key-file": [format!("{}/{}", SA_KEY_MOUNT, SA_SIGNING_PRIVATE_KEY)],
            "service-node-port-range": ["30000-32767"],
            "shutdown-delay-duration": ["70s"],
            "storage-backend": ["etcd3"],
            "storage-media-type": ["application/vnd.kubernetes.protobuf"],
            "tls-cert-file": [format!("{}/{}", SERVER_CERT_MOUNT, TLS_CERT_KEY)],
            "tls-private-key-file": [format!("{}/{}", SERVER_CERT_MOUNT, TLS_KEY_KEY)],
        },
        "admission": {
            "pluginConfig": {
                "network.openshift.io/ExternalIPRanger": {
                    "location": "",
                    "configuration": {
                        "apiVersion": "network.openshift.io/v1",
                        "kind": "ExternalIPRangerAdmissionConfig",
                        "externalIPNetworkCIDRs": [],
                    },
                },
                "network.openshift.io/RestrictedEndpointsAdmission": {
                    "location": "",
                    "configuration": {
                        "apiVersion": "network.openshift.io/v1",
                        "kind": "RestrictedEndpointsAdmissionConfig",
                        "restrictedCIDRs": [service_cidr],
                    },
                },
            },
        },
        "servingInfo": {
            "bindAddress": format!("0.0.0.0:{}", internal_port),
            "bindNetwork": "tcp4",
            "cipherSuites": [
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            ],
            "minTLSVersion": "VersionTLS12",
        },
        "corsAllowedOrigins": [
            "//127\\.0\\.0\\.1(:|$)",
            "//localhost(:|$)",
        ],
        "authConfig": {
            "oauthMetadataFile": format!("{}/{}", OAUTH_METADATA_MOUNT, OAUTH_METADATA_KEY),
        },
        "consolePublicURL": "https://console-openshift-console",
        "imagePolicyConfig": {
            "internalRegistryHostname": "image-registry.openshift-image-registry.svc:5000",
        },
        "projectConfig": {
            "defaultNodeSelector": "",
        },
        "serviceAccountPublicKeyFiles": [format!("{}/{}", SA_KEY_MOUNT, SA_SIGNING_PUBLIC_KEY)],
        "servicesSubnet": service_cidr,
    });
    Ok(serde_json::to_string(&config)?)
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

fn config_map_volume(name: &str, config_map_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn render_bootstrap_script(work_dir: &str) -> String {
    format!(
        r#"#!/bin/sh
cd /tmp
mkdir input output
/usr/bin/cluster-config-operator render \
   --config-output-file config \
   --asset-input-dir /tmp/input \
   --asset-output-dir /tmp/output
cp /tmp/output/manifests/* {}
"#,
        work_dir
    )
}

fn apply_bootstrap_script(work_dir: &str) -> String {
    format!(
        r#"#!/bin/sh
while true; do
  if oc apply -f {}; then
    echo "Bootstrap manifests applied successfully."
    break
  fi
  sleep 1
done
while true; do
  sleep 1000
done
"#,
        work_dir
    )
}

fn https_probe(port: i32, path: &str, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            scheme: Some("HTTPS".to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(10),
        ..Default::default()
    }
}

/// Fill in the API server Deployment spec
pub fn reconcile_deployment(
    deployment: &mut Deployment,
    config_operator_image: &str,
    cli_image: &str,
    hyperkube_image: &str,
    internal_port: i32,
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
                init_containers: Some(vec![Container {
                    name: INIT_BOOTSTRAP_CONTAINER.to_string(),
                    image: Some(config_operator_image.to_string()),
                    command: Some(vec!["/bin/bash".to_string()]),
                    args: Some(vec![
                        "-c".to_string(),
                        render_bootstrap_script(INIT_WORK_MOUNT),
                    ]),
                    volume_mounts: Some(vec![volume_mount(
                        BOOTSTRAP_MANIFESTS_VOLUME,
                        INIT_WORK_MOUNT,
                    )]),
                    ..Default::default()
                }]),
                containers: vec![
                    Container {
                        name: APPLY_BOOTSTRAP_CONTAINER.to_string(),
                        image: Some(cli_image.to_string()),
                        command: Some(vec!["/bin/bash".to_string()]),
                        args: Some(vec![
                            "-c".to_string(),
                            apply_bootstrap_script(INIT_WORK_MOUNT),
                        ]),
                        env: Some(vec![EnvVar {
                            name: "KUBECONFIG".to_string(),
                            value: Some(format!(
                                "{}/{}",
                                APPLY_KUBECONFIG_MOUNT, KUBECONFIG_KEY
                            )),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![
                            volume_mount(BOOTSTRAP_MANIFESTS_VOLUME, INIT_WORK_MOUNT),
                            volume_mount(LOCALHOST_KUBECONFIG_VOLUME, APPLY_KUBECONFIG_MOUNT),
                        ]),
                        ..Default::default()
                    },
                    Container {
                        name: KAS_NAME.to_string(),
                        image: Some(hyperkube_image.to_string()),
                        command: Some(vec!["hyperkube".to_string()]),
                        args: Some(vec![
                            "kube-apiserver".to_string(),
                            format!("--openshift-config={}/{}", CONFIG_MOUNT, CONFIG_KEY),
                            "-v5".to_string(),
                        ]),
                        working_dir: Some(WORK_LOGS_MOUNT.to_string()),
                        liveness_probe: Some(https_probe(internal_port, "/livez", 45)),
                        readiness_probe: Some(https_probe(internal_port, "/healthz", 10)),
                        volume_mounts: Some(vec![
                            volume_mount(WORK_LOGS_VOLUME, WORK_LOGS_MOUNT),
                            volume_mount(CONFIG_VOLUME, CONFIG_MOUNT),
                            volume_mount(AUDIT_CONFIG_VOLUME, AUDIT_CONFIG_MOUNT),
                            volume_mount(ROOT_CA_VOLUME, ROOT_CA_MOUNT),
                            volume_mount(SERVER_CERT_VOLUME, SERVER_CERT_MOUNT),
                            volume_mount(AGGREGATOR_CERT_VOLUME, AGGREGATOR_CERT_MOUNT),
                            volume_mount(ETCD_CLIENT_CERT_VOLUME, ETCD_CLIENT_CERT_MOUNT),
                            volume_mount(SA_KEY_VOLUME, SA_KEY_MOUNT),
                            volume_mount(OAUTH_METADATA_VOLUME, OAUTH_METADATA_MOUNT),
                        ]),
                        ..Default::default()
                    },
                ],
                volumes: Some(vec![
                    empty_dir_volume(BOOTSTRAP_MANIFESTS_VOLUME),
                    secret_volume(LOCALHOST_KUBECONFIG_VOLUME, LOCALHOST_KUBECONFIG_SECRET_NAME),
                    empty_dir_volume(WORK_LOGS_VOLUME),
                    config_map_volume(CONFIG_VOLUME, CONFIG_NAME),
                    config_map_volume(AUDIT_CONFIG_VOLUME, AUDIT_CONFIG_NAME),
                    secret_volume(ROOT_CA_VOLUME, pki::ROOT_CA_SECRET_NAME),
                    secret_volume(SERVER_CERT_VOLUME, SERVER_CERT_SECRET_NAME),
                    secret_volume(AGGREGATOR_CERT_VOLUME, AGGREGATOR_CERT_SECRET_NAME),
                    secret_volume(SA_KEY_VOLUME, SA_KEY_SECRET_NAME),
                    secret_volume(ETCD_CLIENT_CERT_VOLUME, etcd::CLIENT_SECRET_NAME),
                    config_map_volume(OAUTH_METADATA_VOLUME, OAUTH_METADATA_NAME),
                ]),
                ..Default::default()
            }),
        },
        ..Default::default()
    });
}

/// Derive the `KubeAPIServerAvailable` verdict from the deployment
pub fn assess(deployment: &Deployment) -> (ConditionStatus, &'static str, &'static str) {
    if crate::workload_available(deployment) {
        (
            ConditionStatus::True,
            "KASRunning",
            "Kube APIServer is running and available",
        )
    } else {
        (
            ConditionStatus::False,
            "KASScalingUp",
            "Kube APIServer is not yet ready",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root_ca() -> Secret {
        let mut ca = Secret {
            metadata: meta(pki::ROOT_CA_SECRET_NAME, "cp"),
            ..Default::default()
        };
        pki::reconcile_root_ca(&mut ca).unwrap();
        ca
    }

    #[test]
    fn first_ip_of_service_cidr() {
        assert_eq!(
            first_ip("172.30.0.0/16").unwrap(),
            "172.30.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            first_ip("10.0.128.0/24").unwrap(),
            "10.0.128.1".parse::<IpAddr>().unwrap()
        );
        assert!(first_ip("not-a-cidr").is_err());
        assert!(first_ip("10.0.0.0/40").is_err());
        // Network whose first address would wrap past the address space
        assert!(first_ip("255.255.255.255/32").is_err());
    }

    #[test]
    fn service_gets_cluster_ip_and_port() {
        let mut svc = service("cp");
        reconcile_service(&mut svc, 6443, 6443);
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 6443);

        // Re-running updates the existing port entry instead of appending
        reconcile_service(&mut svc, 6443, 443);
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.ports.as_ref().unwrap().len(), 1);
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 443);
    }

    #[test]
    fn server_cert_covers_service_dns_and_ips() {
        let ca = test_root_ca();
        let mut secret = server_cert_secret("cp");
        reconcile_server_cert_secret(&mut secret, &ca, "172.30.0.0/16").unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        let data = secret.data.as_ref().unwrap();
        assert!(data.contains_key(TLS_CERT_KEY));
        assert!(data.contains_key(TLS_KEY_KEY));

        let before = secret.data.clone();
        reconcile_server_cert_secret(&mut secret, &ca, "172.30.0.0/16").unwrap();
        assert_eq!(secret.data, before);
    }

    #[test]
    fn sa_signing_key_is_generated_once() {
        let mut secret = service_account_signing_key_secret("cp");
        reconcile_service_account_signing_key_secret(&mut secret).unwrap();
        let data = secret.data.clone().unwrap();
        assert!(data.contains_key(SA_SIGNING_PRIVATE_KEY));
        assert!(data.contains_key(SA_SIGNING_PUBLIC_KEY));

        reconcile_service_account_signing_key_secret(&mut secret).unwrap();
        assert_eq!(secret.data.as_ref().unwrap(), &data);
    }

    #[test]
    fn kubeconfig_embeds_issued_credentials() {
        let ca = test_root_ca();
        let mut secret = localhost_kubeconfig_secret("cp");
        reconcile_localhost_kubeconfig_secret(&mut secret, &ca, 6443).unwrap();

        let raw = &secret.data.as_ref().unwrap()[KUBECONFIG_KEY].0;
        let parsed: serde_yaml::Value = serde_yaml::from_slice(raw).unwrap();
        assert_eq!(parsed["clusters"][0]["cluster"]["server"], "https://localhost:6443");
        assert_eq!(parsed["current-context"], "admin");
        assert!(parsed["users"][0]["user"]["client-certificate-data"]
            .as_str()
            .is_some());
    }

    #[test]
    fn service_kubeconfig_points_at_the_service() {
        let ca = test_root_ca();
        let mut secret = service_kubeconfig_secret("cp");
        reconcile_service_kubeconfig_secret(&mut secret, &ca, 6443).unwrap();

        let raw = &secret.data.as_ref().unwrap()[KUBECONFIG_KEY].0;
        let parsed: serde_yaml::Value = serde_yaml::from_slice(raw).unwrap();
        assert_eq!(
            parsed["clusters"][0]["cluster"]["server"],
            "https://kube-apiserver:6443"
        );
    }

    #[test]
    fn config_serializes_core_arguments() {
        let mut cm = config("cp");
        reconcile_config(&mut cm, "172.30.0.0/16", 6443).unwrap();
        let raw = &cm.data.as_ref().unwrap()[CONFIG_KEY];
        let parsed: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed["kind"], "KubeAPIServerConfig");
        assert_eq!(parsed["servingInfo"]["bindAddress"], "0.0.0.0:6443");
        assert_eq!(parsed["servicesSubnet"], "172.30.0.0/16");
        assert_eq!(
            parsed["apiServerArguments"]["etcd-servers"][0],
            "https://etcd-client:2379"
        );
        assert_eq!(
            parsed["admission"]["pluginConfig"]
                ["network.openshift.io/RestrictedEndpointsAdmission"]["configuration"]
                ["restrictedCIDRs"][0],
            "172.30.0.0/16"
        );
    }

    #[test]
    fn audit_policy_parses_as_yaml() {
        let mut cm = audit_config("cp");
        reconcile_audit_config(&mut cm);
        let raw = &cm.data.as_ref().unwrap()[AUDIT_POLICY_KEY];
        let parsed: serde_yaml::Value = serde_yaml::from_str(raw).unwrap();
        assert_eq!(parsed["kind"], "Policy");
    }

    #[test]
    fn deployment_wires_all_volumes() {
        let mut deploy = deployment("cp");
        reconcile_deployment(&mut deploy, "cfg-img", "cli-img", "hyperkube-img", 6443, 1);

        let pod = deploy
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        assert_eq!(pod.init_containers.as_ref().unwrap().len(), 1);
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[1].name, KAS_NAME);
        assert_eq!(pod.containers[1].image.as_deref(), Some("hyperkube-img"));

        let volumes: Vec<_> = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        for expected in [
            BOOTSTRAP_MANIFESTS_VOLUME,
            LOCALHOST_KUBECONFIG_VOLUME,
            WORK_LOGS_VOLUME,
            CONFIG_VOLUME,
            AUDIT_CONFIG_VOLUME,
            ROOT_CA_VOLUME,
            SERVER_CERT_VOLUME,
            AGGREGATOR_CERT_VOLUME,
            SA_KEY_VOLUME,
            ETCD_CLIENT_CERT_VOLUME,
            OAUTH_METADATA_VOLUME,
        ] {
            assert!(volumes.contains(&expected), "missing volume {}", expected);
        }
    }
}

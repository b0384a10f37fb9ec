//! PKI operations for the hosted control plane trust chain
//!
//! A single self-signed root CA lives in a secret in the control plane
//! namespace. Every serving and client certificate in the control plane is a
//! leaf issued under that root. Leaf secrets are stamped with a checksum of
//! the issuing CA certificate, which is how a reconcile pass decides whether
//! an existing artifact is still current: a secret is up to date iff it holds
//! exactly its expected keys and its stamp matches the CA on file.
//!
//! The root CA is generated lazily, once. An existing root that fails
//! validation is a hard error rather than a silent regeneration: a new root
//! would invalidate every leaf already handed out.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::Error;

/// Key under which a CA secret stores its certificate
pub const CA_CERT_KEY: &str = "ca.crt";
/// Key under which a CA secret stores its private key
pub const CA_KEY_KEY: &str = "ca.key";
/// Key under which a TLS secret stores its certificate
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Key under which a TLS secret stores its private key
pub const TLS_KEY_KEY: &str = "tls.key";

/// Annotation linking a signed secret to the checksum of its issuing CA cert
pub const SIGNED_BY_CA_ANNOTATION: &str = "skylift.dev/signed-by-ca-checksum";

/// Name of the root CA secret in the control plane namespace
pub const ROOT_CA_SECRET_NAME: &str = "root-ca";

const ROOT_CA_COMMON_NAME: &str = "root-ca";
const ORGANIZATION: &str = "skylift";

/// Certificate validity periods used in the control plane
///
/// Leaves are short-lived. The cluster signer handed to the controller
/// manager is a second-tier CA whose rotation cost is far higher, so it gets
/// the long window, as does the root itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    /// One year, used for ordinary leaf certificates
    OneYear,
    /// Ten years, used for the root CA and the cluster signer
    TenYears,
}

impl Validity {
    fn days(self) -> i64 {
        match self {
            Validity::OneYear => 365,
            Validity::TenYears => 3650,
        }
    }
}

/// Subject and constraints for a certificate issued under the root CA
#[derive(Clone, Debug)]
pub struct CertSpec {
    /// Subject common name
    pub common_name: String,
    /// Subject organization
    pub organization: String,
    /// Key usages to assert
    pub key_usages: Vec<KeyUsagePurpose>,
    /// Extended key usages to assert
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
    /// Validity period
    pub validity: Validity,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names
    pub ip_addresses: Vec<IpAddr>,
    /// Whether the issued certificate is itself a CA (the cluster signer)
    pub is_ca: bool,
}

impl CertSpec {
    /// A one-year leaf with the given subject and no SANs
    pub fn new(common_name: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: organization.into(),
            key_usages: vec![
                KeyUsagePurpose::KeyEncipherment,
                KeyUsagePurpose::DigitalSignature,
            ],
            extended_key_usages: Vec::new(),
            validity: Validity::OneYear,
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            is_ca: false,
        }
    }

    /// Restrict the certificate to server authentication
    pub fn server_auth(mut self) -> Self {
        self.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self
    }

    /// Restrict the certificate to client authentication
    pub fn client_auth(mut self) -> Self {
        self.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self
    }
}

/// Issued certificate material in PEM form
#[derive(Debug)]
pub struct IssuedCert {
    /// Leaf certificate
    pub cert_pem: Vec<u8>,
    /// Leaf private key
    pub key_pem: Vec<u8>,
    /// Certificate of the issuing CA
    pub ca_pem: Vec<u8>,
}

/// Raw bytes stored under `key` in the secret, if present
pub fn secret_bytes<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
}

fn secret_str(secret: &Secret, key: &str) -> Result<String, Error> {
    let bytes = secret_bytes(secret, key).ok_or_else(|| {
        Error::pki(format!(
            "secret {} is missing key {}",
            secret.metadata.name.as_deref().unwrap_or("<unnamed>"),
            key
        ))
    })?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::pki(format!("secret key {} is not UTF-8 PEM: {}", key, e)))
}

/// Checksum identifying a CA secret by the bytes of its certificate
pub fn ca_checksum(ca: &Secret) -> String {
    let cert = secret_bytes(ca, CA_CERT_KEY).unwrap_or(&[]);
    format!("{:x}", Sha256::digest(cert))
}

/// Stamp a signed secret with the checksum of its issuing CA
pub fn annotate_with_ca(secret: &mut Secret, ca: &Secret) {
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SIGNED_BY_CA_ANNOTATION.to_string(), ca_checksum(ca));
}

/// True when the secret holds exactly the expected data keys, all non-empty
pub fn secret_up_to_date(secret: &Secret, expected_keys: &[&str]) -> bool {
    let Some(data) = secret.data.as_ref() else {
        return false;
    };
    if data.len() != expected_keys.len() {
        return false;
    }
    expected_keys
        .iter()
        .all(|k| data.get(*k).map(|v| !v.0.is_empty()).unwrap_or(false))
}

/// True when the secret holds exactly the expected keys and was signed by
/// the CA currently on file
pub fn signed_secret_up_to_date(secret: &Secret, ca: &Secret, expected_keys: &[&str]) -> bool {
    if !secret_up_to_date(secret, expected_keys) {
        return false;
    }
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SIGNED_BY_CA_ANNOTATION))
        .map(|stamp| *stamp == ca_checksum(ca))
        .unwrap_or(false)
}

/// Structural and cryptographic validity of a CA secret
///
/// Both PEM blobs must be present and parseable, the certificate must carry
/// the CA basic constraint, and it must be inside its validity window.
pub fn valid_ca(ca: &Secret) -> bool {
    let (Some(cert_pem), Some(key_pem)) =
        (secret_bytes(ca, CA_CERT_KEY), secret_bytes(ca, CA_KEY_KEY))
    else {
        return false;
    };

    let Ok(key_str) = std::str::from_utf8(key_pem) else {
        return false;
    };
    if KeyPair::from_pem(key_str).is_err() {
        return false;
    }

    let Ok(pem_obj) = ::pem::parse(cert_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(pem_obj.contents()) else {
        return false;
    };
    if !cert.validity().is_valid() {
        return false;
    }
    matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca)
}

/// Ensure the root CA secret holds a valid self-signed root
///
/// Generates the root exactly once, when no key material exists yet. A root
/// that exists but fails validation aborts the pass with an error; silently
/// regenerating would orphan every certificate issued under the old root.
pub fn reconcile_root_ca(secret: &mut Secret) -> Result<(), Error> {
    let has_material =
        secret_bytes(secret, CA_CERT_KEY).is_some() || secret_bytes(secret, CA_KEY_KEY).is_some();
    if has_material {
        if valid_ca(secret) {
            return Ok(());
        }
        return Err(Error::invalid_root_ca(format!(
            "root CA secret {} exists but is not a valid CA; operator intervention required",
            secret
                .metadata
                .name
                .as_deref()
                .unwrap_or(ROOT_CA_SECRET_NAME)
        )));
    }

    let key_pair = KeyPair::generate()
        .map_err(|e| Error::pki(format!("failed to generate root CA key: {}", e)))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(ROOT_CA_COMMON_NAME.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, Validity::TenYears);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::pki(format!("failed to self-sign root CA: {}", e)))?;

    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(CA_CERT_KEY.to_string(), ByteString(cert.pem().into_bytes()));
    data.insert(
        CA_KEY_KEY.to_string(),
        ByteString(key_pair.serialize_pem().into_bytes()),
    );
    Ok(())
}

fn set_validity(params: &mut CertificateParams, validity: Validity) {
    // ::time, not the x509-parser prelude's time module
    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(validity.days());
}

/// Issue a certificate described by `spec` under the CA held in `ca`
pub fn sign_certificate(spec: &CertSpec, ca: &Secret) -> Result<IssuedCert, Error> {
    if !valid_ca(ca) {
        return Err(Error::invalid_root_ca(format!(
            "invalid CA signer secret {}",
            ca.metadata.name.as_deref().unwrap_or("<unnamed>")
        )));
    }
    let ca_cert_pem = secret_str(ca, CA_CERT_KEY)?;
    let ca_key_pem = secret_str(ca, CA_KEY_KEY)?;
    let ca_key = KeyPair::from_pem(&ca_key_pem)
        .map_err(|e| Error::pki(format!("failed to load CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, ca_key)
        .map_err(|e| Error::pki(format!("failed to build issuer from CA secret: {}", e)))?;

    let leaf_key = KeyPair::generate()
        .map_err(|e| Error::pki(format!("failed to generate leaf key: {}", e)))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(spec.common_name.clone()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(spec.organization.clone()),
    );
    params.distinguished_name = dn;
    params.is_ca = if spec.is_ca {
        IsCa::Ca(BasicConstraints::Unconstrained)
    } else {
        IsCa::NoCa
    };
    params.key_usages = spec.key_usages.clone();
    params.extended_key_usages = spec.extended_key_usages.clone();
    set_validity(&mut params, spec.validity);

    let mut sans = Vec::new();
    for name in &spec.dns_names {
        let ia5 = Ia5String::try_from(name.clone())
            .map_err(|e| Error::pki(format!("invalid DNS SAN {}: {}", name, e)))?;
        sans.push(SanType::DnsName(ia5));
    }
    for ip in &spec.ip_addresses {
        sans.push(SanType::IpAddress(*ip));
    }
    params.subject_alt_names = sans;

    let cert = params
        .signed_by(&leaf_key, &issuer)
        .map_err(|e| Error::pki(format!("failed to sign certificate: {}", e)))?;

    Ok(IssuedCert {
        cert_pem: cert.pem().into_bytes(),
        key_pem: leaf_key.serialize_pem().into_bytes(),
        ca_pem: ca_cert_pem.into_bytes(),
    })
}

/// Issue a leaf under `ca` and write it into a TLS-shaped secret
///
/// No-op when the secret already holds exactly `tls.crt`/`tls.key` and its
/// CA stamp matches; this is the common case on every pass.
pub fn reconcile_signed_tls_secret(
    secret: &mut Secret,
    ca: &Secret,
    spec: &CertSpec,
) -> Result<(), Error> {
    if !valid_ca(ca) {
        return Err(Error::invalid_root_ca(format!(
            "invalid CA signer secret {}",
            ca.metadata.name.as_deref().unwrap_or("<unnamed>")
        )));
    }
    secret.type_ = Some("kubernetes.io/tls".to_string());
    let expected = [TLS_CERT_KEY, TLS_KEY_KEY];
    if signed_secret_up_to_date(secret, ca, &expected) {
        return Ok(());
    }
    let issued = sign_certificate(spec, ca)?;
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.clear();
    data.insert(TLS_CERT_KEY.to_string(), ByteString(issued.cert_pem));
    data.insert(TLS_KEY_KEY.to_string(), ByteString(issued.key_pem));
    annotate_with_ca(secret, ca);
    Ok(())
}

/// Generate a freestanding asymmetric key pair in PEM form
///
/// Used for the service account signing key, which has no issuer and
/// therefore no CA linkage. Returns `(private, public)`.
pub fn generate_key_pair() -> Result<(Vec<u8>, Vec<u8>), Error> {
    let key_pair = KeyPair::generate()
        .map_err(|e| Error::pki(format!("failed to generate key pair: {}", e)))?;
    let private_pem = key_pair.serialize_pem().into_bytes();
    let public_pem = key_pair.public_key_pem().into_bytes();
    Ok((private_pem, public_pem))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_ca_secret() -> Secret {
        let mut secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(ROOT_CA_SECRET_NAME.to_string()),
                namespace: Some("cp".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        reconcile_root_ca(&mut secret).unwrap();
        secret
    }

    #[test]
    fn root_ca_is_generated_once_and_validates() {
        let mut secret = root_ca_secret();
        assert!(valid_ca(&secret));

        let before = secret.data.clone();
        reconcile_root_ca(&mut secret).unwrap();
        assert_eq!(
            secret.data, before,
            "second reconcile must not rewrite the root"
        );
    }

    #[test]
    fn corrupted_root_ca_fails_loudly_instead_of_regenerating() {
        let mut secret = root_ca_secret();
        secret
            .data
            .as_mut()
            .unwrap()
            .insert(CA_CERT_KEY.to_string(), ByteString(b"garbage".to_vec()));

        let err = reconcile_root_ca(&mut secret).unwrap_err();
        assert!(matches!(err, Error::InvalidRootCa(_)));
        // The garbage must still be there, untouched
        assert_eq!(
            secret.data.as_ref().unwrap()[CA_CERT_KEY].0,
            b"garbage".to_vec()
        );
    }

    #[test]
    fn missing_key_material_invalidates_ca() {
        let mut secret = root_ca_secret();
        secret.data.as_mut().unwrap().remove(CA_KEY_KEY);
        assert!(!valid_ca(&secret));
    }

    #[test]
    fn leaf_can_be_issued_under_root() {
        let ca = root_ca_secret();
        let mut spec = CertSpec::new("kubernetes", "kubernetes").server_auth();
        spec.dns_names = vec!["kubernetes.default.svc".to_string()];
        spec.ip_addresses = vec!["172.30.0.1".parse().unwrap()];

        let issued = sign_certificate(&spec, &ca).unwrap();
        let cert_pem = String::from_utf8(issued.cert_pem).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        let key_pem = String::from_utf8(issued.key_pem).unwrap();
        assert!(key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn up_to_date_secret_is_left_untouched() {
        let ca = root_ca_secret();
        let mut secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("kas-server-crt".to_string()),
                namespace: Some("cp".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let spec = CertSpec::new("kubernetes", "kubernetes").server_auth();
        reconcile_signed_tls_secret(&mut secret, &ca, &spec).unwrap();
        let first = secret.data.clone();

        reconcile_signed_tls_secret(&mut secret, &ca, &spec).unwrap();
        assert_eq!(secret.data, first, "idempotent reconcile must not re-issue");
    }

    #[test]
    fn changing_the_ca_forces_exactly_one_reissue() {
        let ca = root_ca_secret();
        let mut secret = Secret::default();
        let spec = CertSpec::new("kubernetes", "kubernetes").server_auth();
        reconcile_signed_tls_secret(&mut secret, &ca, &spec).unwrap();
        let first = secret.data.clone();

        // A different root invalidates the stamp
        let other_ca = root_ca_secret();
        assert_ne!(ca_checksum(&ca), ca_checksum(&other_ca));
        assert!(!signed_secret_up_to_date(
            &secret,
            &other_ca,
            &[TLS_CERT_KEY, TLS_KEY_KEY]
        ));

        reconcile_signed_tls_secret(&mut secret, &other_ca, &spec).unwrap();
        assert_ne!(secret.data, first);

        // And the re-issued secret is stable under the new root
        let second = secret.data.clone();
        reconcile_signed_tls_secret(&mut secret, &other_ca, &spec).unwrap();
        assert_eq!(secret.data, second);
    }

    #[test]
    fn secret_with_extra_keys_is_not_up_to_date() {
        let ca = root_ca_secret();
        let mut secret = Secret::default();
        let spec = CertSpec::new("kubernetes", "kubernetes").server_auth();
        reconcile_signed_tls_secret(&mut secret, &ca, &spec).unwrap();

        secret
            .data
            .as_mut()
            .unwrap()
            .insert("stray".to_string(), ByteString(b"x".to_vec()));
        assert!(!signed_secret_up_to_date(
            &secret,
            &ca,
            &[TLS_CERT_KEY, TLS_KEY_KEY]
        ));
    }

    #[test]
    fn signing_with_invalid_ca_is_rejected() {
        let ca = Secret::default();
        let spec = CertSpec::new("kubernetes", "kubernetes");
        let err = sign_certificate(&spec, &ca).unwrap_err();
        assert!(matches!(err, Error::InvalidRootCa(_)));
    }

    #[test]
    fn generated_key_pair_has_both_halves() {
        let (private_pem, public_pem) = generate_key_pair().unwrap();
        assert!(String::from_utf8(private_pem)
            .unwrap()
            .contains("PRIVATE KEY"));
        assert!(String::from_utf8(public_pem)
            .unwrap()
            .contains("PUBLIC KEY"));
    }
}

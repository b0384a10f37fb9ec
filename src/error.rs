//! Error types for the Skylift operator

use thiserror::Error;

/// Main error type for Skylift operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The root CA secret exists but cannot be used to issue certificates
    #[error("invalid root CA: {0}")]
    InvalidRootCa(String),

    /// Certificate or key operation error
    #[error("pki error: {0}")]
    Pki(String),

    /// Release image metadata lookup error
    #[error("release image error: {0}")]
    ReleaseImage(String),

    /// The etcd cluster is wedged and has been deleted for recreation
    #[error("etcd cluster error: {0}")]
    EtcdCluster(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create an invalid root CA error with the given message
    pub fn invalid_root_ca(msg: impl Into<String>) -> Self {
        Self::InvalidRootCa(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Create a release image error with the given message
    pub fn release_image(msg: impl Into<String>) -> Self {
        Self::ReleaseImage(msg.into())
    }

    /// Create an etcd cluster error with the given message
    pub fn etcd_cluster(msg: impl Into<String>) -> Self {
        Self::EtcdCluster(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_category_and_detail() {
        let err = Error::invalid_root_ca("root CA secret cp/root-ca failed validation");
        assert!(err.to_string().contains("invalid root CA"));
        assert!(err.to_string().contains("cp/root-ca"));

        let err = Error::release_image("no hyperkube image in release 4.8.0");
        assert!(err.to_string().contains("release image error"));

        let err = Error::etcd_cluster("etcd cluster in error state, must recreate");
        assert!(err.to_string().contains("must recreate"));
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}

//! Custom Resource Definitions
//!
//! This module defines the ControlPlane CRD (the user-facing resource that
//! describes a hosted control plane) and the typed view of the third-party
//! EtcdCluster CRD managed by the etcd operator.

mod conditions;
mod control_plane;
mod etcd;

pub use conditions::{get_condition, set_condition};
pub use control_plane::{
    ConditionStatus, ConditionType, ControlPlane, ControlPlaneCondition, ControlPlaneSpec,
    ControlPlaneStatus, LocalObjectReference,
};
pub use etcd::{
    EtcdCluster, EtcdClusterCondition, EtcdClusterSpec, EtcdClusterStatus, EtcdMemberStatus,
    EtcdTlsPolicy, StaticTls, TlsMemberSecrets, ETCD_CONDITION_AVAILABLE,
};

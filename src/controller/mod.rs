//! Controller implementation for the ControlPlane CRD
//!
//! This module contains the reconciliation logic for hosted control planes.
//! The controller follows the Kubernetes controller pattern with
//! observe-diff-act loops.

mod control_plane;

pub use control_plane::{
    availability_rollup, convergence_phase, ensure_owner_reference, error_policy, reconcile,
    Context, ContextBuilder, ControlPlaneClient, ControlPlaneClientImpl, ConvergencePhase,
    FIELD_MANAGER,
};

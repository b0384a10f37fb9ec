//! Condition bookkeeping for the ControlPlane status
//!
//! Conditions are unique by type. `set_condition` upserts in place and only
//! touches `lastTransitionTime` when the status value actually changes, so a
//! reconcile pass that merely rewrites the same status with a fresh message
//! leaves transition times stable.

use chrono::Utc;

use super::control_plane::{ConditionStatus, ConditionType, ControlPlaneCondition};

/// Upsert a condition by type
///
/// Appends a new condition when the type is absent; otherwise updates
/// status/reason/message in place. `lastTransitionTime` is bumped only when
/// the status differs from the stored value.
pub fn set_condition(
    conditions: &mut Vec<ControlPlaneCondition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.into();
            existing.message = message.into();
        }
        None => conditions.push(ControlPlaneCondition {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }),
    }
}

/// Look up a condition by type
pub fn get_condition(
    conditions: &[ControlPlaneCondition],
    type_: ConditionType,
) -> Option<&ControlPlaneCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

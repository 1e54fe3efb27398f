//! Deployment conditions, shaped after Kubernetes status conditions
//!
//! A deployment records one condition per lifecycle step so that a halted
//! run shows exactly how far it got.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CONDITION_TYPE_CLUSTER_READY: &str = "ClusterReady";
pub const CONDITION_TYPE_ACCESS_BOUND: &str = "AccessBound";
pub const CONDITION_TYPE_OUTPUT_REPORTED: &str = "OutputReported";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

/// Upsert the condition of `type_`.
///
/// The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Utc::now();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.to_string(),
        }),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Absent conditions count as false
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str, reason: &str, message: &str) {
    set_condition(conditions, type_, ConditionStatus::True, reason, message);
}

pub fn mark_false(conditions: &mut Vec<Condition>, type_: &str, reason: &str, message: &str) {
    set_condition(conditions, type_, ConditionStatus::False, reason, message);
}

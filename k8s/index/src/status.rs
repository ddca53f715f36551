//! Status condition construction for reconciled resources.

use chrono::Utc;
use customrouter_k8s_api::{Condition, Time, CONDITION_PARTITIONS_SYNCED, CONDITION_RECONCILED};

pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_SYNC_SUCCESS: &str = "PartitionsSyncSuccess";
pub const REASON_SYNC_ERROR: &str = "PartitionsSyncError";

pub fn condition(condition_type: &str, status: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: condition_type.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

pub fn reconciled(message: &str) -> Condition {
    condition(
        CONDITION_RECONCILED,
        true,
        REASON_RECONCILE_SUCCESS,
        message,
    )
}

pub fn reconcile_failed(reason: &str, message: &str) -> Condition {
    condition(CONDITION_RECONCILED, false, reason, message)
}

pub fn partitions_synced() -> Condition {
    condition(
        CONDITION_PARTITIONS_SYNCED,
        true,
        REASON_SYNC_SUCCESS,
        "routing-table partitions are up to date",
    )
}

pub fn partitions_sync_failed(message: &str) -> Condition {
    condition(CONDITION_PARTITIONS_SYNCED, false, REASON_SYNC_ERROR, message)
}

//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{ConditionStatus, DatacenterCondition, DatacenterConditionType};

/// Update or add a condition in the list.
///
/// The transition time only moves when the status flips. Returns `true`
/// when anything (status, reason or message) changed, so callers can skip
/// a status patch that would be a no-op.
pub fn set_condition(conditions: &mut Vec<DatacenterCondition>, condition: DatacenterCondition) -> bool {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        let status_changed = existing.status != condition.status;
        let changed = status_changed
            || existing.reason != condition.reason
            || existing.message != condition.message;

        existing.status = condition.status;
        existing.reason = condition.reason;
        existing.message = condition.message;

        if status_changed || existing.last_transition_time.is_none() {
            existing.last_transition_time = Some(now);
        }
        changed
    } else {
        conditions.push(DatacenterCondition {
            last_transition_time: Some(now),
            ..condition
        });
        true
    }
}

/// Find a condition by type
pub fn find_condition(
    conditions: &[DatacenterCondition],
    type_: DatacenterConditionType,
) -> Option<&DatacenterCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[DatacenterCondition], type_: DatacenterConditionType) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// Whether setting `condition` would change the stored list
pub fn would_change(conditions: &[DatacenterCondition], condition: &DatacenterCondition) -> bool {
    match find_condition(conditions, condition.type_) {
        Some(existing) => {
            existing.status != condition.status
                || existing.reason != condition.reason
                || existing.message != condition.message
        }
        None => true,
    }
}

pub fn condition_true(type_: DatacenterConditionType) -> DatacenterCondition {
    DatacenterCondition::new(type_, ConditionStatus::True)
}

pub fn condition_false(type_: DatacenterConditionType) -> DatacenterCondition {
    DatacenterCondition::new(type_, ConditionStatus::False)
}

#[cfg(test)]
mod tests {
    use super::*;
    use DatacenterConditionType::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        assert!(set_condition(&mut conditions, condition_true(ScalingDown)));
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].last_transition_time.is_some());
        assert!(is_condition_true(&conditions, ScalingDown));
    }

    #[test]
    fn test_set_condition_same_status_is_noop() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition_true(Ready));
        let first = conditions[0].last_transition_time.clone();

        assert!(!set_condition(&mut conditions, condition_true(Ready)));
        assert_eq!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn test_set_condition_reason_change_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition_false(Valid));
        let first = conditions[0].last_transition_time.clone();

        let changed = set_condition(
            &mut conditions,
            condition_false(Valid).with_reason("notEnoughSpaceToScaleDown", "disk"),
        );
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].reason, "notEnoughSpaceToScaleDown");
    }

    #[test]
    fn test_status_flip_updates() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition_true(Stopped));
        assert!(set_condition(&mut conditions, condition_false(Stopped)));
        assert!(!is_condition_true(&conditions, Stopped));
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_would_change() {
        let mut conditions = Vec::new();
        assert!(would_change(&conditions, &condition_true(Updating)));
        set_condition(&mut conditions, condition_true(Updating));
        assert!(!would_change(&conditions, &condition_true(Updating)));
        assert!(would_change(&conditions, &condition_false(Updating)));
        assert!(find_condition(&conditions, Resuming).is_none());
    }
}

//! Condition bookkeeping for deployment and member status
//!
//! Timestamps only move when something actually changed, so writing the
//! same conditions twice produces an identical status and no watch event.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::{Condition, ConditionType};

pub fn timestamp(now: &DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Set a condition in place, returns whether anything changed
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: bool,
    reason: &str,
    message: &str,
    now: &DateTime<Utc>,
) -> bool {
    let ts = timestamp(now);
    let reason = (!reason.is_empty()).then(|| reason.to_string());
    let message = (!message.is_empty()).then(|| message.to_string());

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == status && existing.reason == reason && existing.message == message
            {
                return false;
            }
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Some(ts.clone());
            }
            existing.reason = reason;
            existing.message = message;
            existing.last_update_time = Some(ts);
            true
        }
        None => {
            conditions.push(Condition {
                type_,
                status,
                reason,
                message,
                last_update_time: Some(ts.clone()),
                last_transition_time: Some(ts),
            });
            true
        }
    }
}

/// Drop a condition, returns whether it was present
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: ConditionType) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

/// Builder for updating a list of conditions in one expression
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    now: DateTime<Utc>,
}

impl ConditionBuilder {
    pub fn from_existing(existing: Vec<Condition>, now: DateTime<Utc>) -> Self {
        Self {
            conditions: existing,
            now,
        }
    }

    pub fn set(mut self, type_: ConditionType, status: bool, reason: &str, message: &str) -> Self {
        set_condition(&mut self.conditions, type_, status, reason, message, &self.now);
        self
    }

    pub fn remove(mut self, type_: ConditionType) -> Self {
        remove_condition(&mut self.conditions, type_);
        self
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

//! Owned/Mounted/Formatted condition bookkeeping for the format path.

use crate::drive::{Condition, ConditionType};
use chrono::{DateTime, Utc};

pub const REASON_ADDED: &str = "Added";
pub const MESSAGE_MOUNTED: &str = "Mounted";
pub const MESSAGE_NOT_MOUNTED: &str = "NotMounted";
pub const MESSAGE_FORMATTED: &str = "Formatted";
pub const MESSAGE_NOT_FORMATTED: &str = "NotFormatted";

/// Computes the three drive conditions from the current formatted/mounted
/// state. The Owned message carries the first error of the pass, if any.
/// Transition times are left unset; [`apply_conditions`] fills them in.
pub fn drive_conditions(formatted: bool, mounted: bool, error: Option<&str>) -> [Condition; 3] {
    [
        condition(
            ConditionType::Owned,
            formatted && mounted,
            error.unwrap_or_default(),
        ),
        condition(
            ConditionType::Mounted,
            mounted,
            if mounted { MESSAGE_MOUNTED } else { MESSAGE_NOT_MOUNTED },
        ),
        condition(
            ConditionType::Formatted,
            formatted,
            if formatted {
                MESSAGE_FORMATTED
            } else {
                MESSAGE_NOT_FORMATTED
            },
        ),
    ]
}

fn condition(condition_type: ConditionType, status: bool, message: &str) -> Condition {
    Condition {
        condition_type,
        status,
        reason: REASON_ADDED.to_string(),
        message: message.to_string(),
        last_transition_time: None,
    }
}

/// Upserts `updates` into `conditions`. The transition time moves only when
/// a condition's status flips or the condition is new.
pub fn apply_conditions(
    conditions: &mut Vec<Condition>,
    updates: impl IntoIterator<Item = Condition>,
    now: DateTime<Utc>,
) {
    for mut update in updates {
        match conditions
            .iter_mut()
            .find(|c| c.condition_type == update.condition_type)
        {
            Some(existing) => {
                update.last_transition_time = if existing.status == update.status {
                    existing.last_transition_time
                } else {
                    Some(now)
                };
                *existing = update;
            }
            None => {
                update.last_transition_time = Some(now);
                conditions.push(update);
            }
        }
    }
}

//! Condition helpers for MachineBootstrap status

use chrono::Utc;

use super::lifecycle::Diagnostic;
use crate::crd::Condition;

pub const CONDITION_TYPE_BOOTSTRAPPED: &str = "Bootstrapped";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition, bumping the transition time only when the status flips
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        let transitioned = existing.status != condition.status;
        let last_transition_time = if transitioned {
            condition.last_transition_time
        } else {
            std::mem::take(&mut existing.last_transition_time)
        };

        *existing = Condition {
            last_transition_time,
            ..condition
        };
    } else {
        conditions.push(condition);
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

fn condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: Utc::now().to_rfc3339(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: generation,
    }
}

/// Bootstrapped=True
pub fn bootstrapped_condition(node: &str, generation: Option<i64>) -> Condition {
    condition(
        CONDITION_TYPE_BOOTSTRAPPED,
        CONDITION_STATUS_TRUE,
        "BootstrapAccepted",
        &format!("Machine API accepted bootstrap for node {node}"),
        generation,
    )
}

/// Bootstrapped=False carrying the failure diagnostic
pub fn bootstrap_failed_condition(diagnostic: &Diagnostic, generation: Option<i64>) -> Condition {
    let reason = diagnostic
        .summary
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<String>();

    condition(
        CONDITION_TYPE_BOOTSTRAPPED,
        CONDITION_STATUS_FALSE,
        &reason,
        &diagnostic.detail,
        generation,
    )
}

/// Progressing=True while the retry loop runs, False once it settles
pub fn progressing_condition(active: bool, reason: &str, message: &str, generation: Option<i64>) -> Condition {
    condition(
        CONDITION_TYPE_PROGRESSING,
        if active {
            CONDITION_STATUS_TRUE
        } else {
            CONDITION_STATUS_FALSE
        },
        reason,
        message,
        generation,
    )
}

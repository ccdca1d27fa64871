//! Conditional execution: decide whether a task should run, skip, or keep
//! waiting based on its predecessor's terminal phase and field predicates.

use crate::crd::{ConditionField, ConditionWhen, Task, TaskCondition, TaskPhase};
use crate::inputs::extract_field;
use crate::crd::SourceField;

/// Outcome of evaluating a condition against its predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Predecessor not yet terminal; re-evaluate later.
    Wait,
    /// Every clause satisfied; the task may execute.
    Run,
    /// A clause failed; the task transitions to Skipped with this message.
    Skip(String),
}

/// Evaluate the condition. Only when the `when` clause, the optional
/// `fieldEquals`, and the optional `outputContains` all hold does the
/// dependent task proceed.
pub fn evaluate(condition: &TaskCondition, dependent: &Task) -> Decision {
    let Some(phase) = dependent.phase().filter(|p| p.is_terminal()) else {
        return Decision::Wait;
    };

    let name = &condition.dependent_task;
    match condition.when {
        ConditionWhen::Success if phase != TaskPhase::Succeeded => {
            return Decision::Skip(format!(
                "condition requires '{name}' to succeed, but it is {}",
                phase.as_str()
            ));
        }
        ConditionWhen::Failure if phase != TaskPhase::Failed => {
            return Decision::Skip(format!(
                "condition requires '{name}' to fail, but it is {}",
                phase.as_str()
            ));
        }
        // `always` and `completed` accept any terminal phase.
        _ => {}
    }

    if let Some(field_equals) = &condition.field_equals {
        let actual = extract_field(
            dependent,
            match field_equals.field {
                ConditionField::Phase => SourceField::Phase,
                ConditionField::ErrorCode => SourceField::ErrorCode,
                ConditionField::Output => SourceField::Output,
            },
        );
        if actual != field_equals.value {
            return Decision::Skip(format!(
                "condition requires field of '{name}' to equal '{}', got '{actual}'",
                field_equals.value
            ));
        }
    }

    if let Some(needle) = &condition.output_contains {
        let output = extract_field(dependent, SourceField::Output);
        if !output.contains(needle.as_str()) {
            return Decision::Skip(format!(
                "condition requires output of '{name}' to contain '{needle}'"
            ));
        }
    }

    Decision::Run
}

//! Custom resource definitions for the `magpie.io/v1` API group.
//!
//! Two kinds live here: [`Task`], a single unit of execution (shell command
//! or HTTP call), and [`Workflow`], a scheduled DAG of task-template
//! references materialised per run into concrete child tasks. Specs are
//! user-authored; statuses are controller-authored through the status
//! subresource.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by both kinds.
pub const API_GROUP: &str = "magpie.io";

/// Finalizer token placed on every reconciled task.
pub const TASK_FINALIZER: &str = "magpie.io/finalizer";

/// Label carrying the owning workflow's name on materialised children.
pub const WORKFLOW_LABEL: &str = "workflow";

/// Label carrying the node's local name on materialised children.
pub const TASK_LABEL: &str = "task";

/// Label carrying the template task's name on materialised children.
pub const ORIGINAL_TASK_LABEL: &str = "original-task";

/// Annotation holding a JSON-encoded [`TaskCondition`] on children whose
/// workflow node carries a condition.
pub const CONDITION_ANNOTATION: &str = "condition";

/// Name of a child task materialised for a workflow node.
pub fn child_task_name(workflow: &str, local_name: &str) -> String {
    format!("{workflow}-{local_name}")
}

/// What a task executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TaskType {
    #[default]
    #[serde(rename = "shell")]
    Shell,
    #[serde(rename = "http-get")]
    HttpGet,
    #[serde(rename = "http-post")]
    HttpPost,
}

impl TaskType {
    pub fn is_http(self) -> bool {
        matches!(self, TaskType::HttpGet | TaskType::HttpPost)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Shell => "shell",
            TaskType::HttpGet => "http-get",
            TaskType::HttpPost => "http-post",
        }
    }
}

/// How a batched input descriptor is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Coarse state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TaskPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskPhase::Succeeded | TaskPhase::Failed | TaskPhase::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPhase::Pending => "Pending",
            TaskPhase::Running => "Running",
            TaskPhase::Succeeded => "Succeeded",
            TaskPhase::Failed => "Failed",
            TaskPhase::Skipped => "Skipped",
        }
    }
}

/// Coarse state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum WorkflowPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowPhase::Succeeded | WorkflowPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowPhase::Pending => "Pending",
            WorkflowPhase::Running => "Running",
            WorkflowPhase::Succeeded => "Succeeded",
            WorkflowPhase::Failed => "Failed",
        }
    }
}

/// Status field of a predecessor task that an input source draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SourceField {
    Output,
    ErrorCode,
    Phase,
    ErrorMessage,
    StartTime,
    CompletionTime,
    /// Composite JSON document of the predecessor's whole status.
    All,
}

/// A named binding drawn from a predecessor task's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskInputSource {
    /// Variable name exposed to templates and the shell environment.
    pub name: String,
    /// Name of the predecessor task within the same namespace.
    pub task_ref: String,
    pub field: SourceField,
    /// Minimal dotted path applied when `field` is `output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// Fallback when the predecessor is missing or the path does not resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Terminal-phase requirement of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConditionWhen {
    Success,
    Failure,
    Always,
    Completed,
}

/// Field compared verbatim by [`FieldEquals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ConditionField {
    Phase,
    ErrorCode,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldEquals {
    pub field: ConditionField,
    pub value: String,
}

/// Predicate over a predecessor task that gates whether a dependent task
/// executes or skips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskCondition {
    pub dependent_task: String,
    pub when: ConditionWhen,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_equals: Option<FieldEquals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contains: Option<String>,
}

/// A unit of execution: one shell command or HTTP call, optionally fanned
/// out over a batched input descriptor.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "magpie.io",
    version = "v1",
    kind = "Task",
    namespaced,
    status = "TaskStatus",
    shortname = "tk",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Literal input, or a JSON batch descriptor (array of entries or
    /// `{"inputs": [...]}`).
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub fail_fast: bool,
    /// Per-execution deadline in seconds; the process-wide default applies
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Recorded but not acted on by the reconciler; re-execution happens
    /// through scheduled workflow re-fire or user recreation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// `|`-separated OR-list of substring patterns validated against the
    /// captured output (or `status|body` for HTTP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
    /// 5-field cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    /// Sibling task names that must be Succeeded before execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_sources: Option<Vec<TaskInputSource>>,
    /// `${VAR}` template rendered with input-source bindings into the
    /// effective input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_template: Option<String>,
}

/// Outcome of a task execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// `"0"` on success, `"-1"` on failure.
    pub error_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Numeric status of the HTTP exchange, when the execution performed
    /// exactly one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn phase(&self) -> Option<TaskPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_some_and(TaskPhase::is_terminal)
    }
}

/// Reference to a template task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A node of the workflow DAG, referencing a template task by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTaskNode {
    pub local_name: String,
    pub task_ref: TaskReference,
    /// Local names of nodes that must be Succeeded first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<TaskCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_sources: Option<Vec<TaskInputSource>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_template: Option<String>,
}

/// A scheduled DAG over task templates, materialised per run into concrete
/// child tasks named `{workflow}-{localName}`.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "magpie.io",
    version = "v1",
    kind = "Workflow",
    namespaced,
    status = "WorkflowStatus",
    shortname = "wf",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// 5-field cron expression; an unscheduled workflow runs exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub task_nodes: Vec<WorkflowTaskNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkflowPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// When the current (or most recent) run fired; the cron gate computes
    /// the next fire relative to this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,
    /// Live snapshot of the current run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<WorkflowDag>,
    /// Final snapshots of completed scheduled runs, newest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dag_history: Vec<WorkflowDag>,
}

impl Workflow {
    pub fn phase(&self) -> Option<WorkflowPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn schedule(&self) -> Option<&str> {
        self.spec.schedule.as_deref().filter(|s| !s.is_empty())
    }
}

/// Serialised view of one workflow run, published for UI consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDag {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_phase: String,
    pub nodes: Vec<DagNode>,
    pub edges: Vec<DagEdge>,
    pub metadata: DagMetadata,
    pub layout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DagMetadata {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub running_count: usize,
    pub pending_count: usize,
    pub skipped_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DagPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DagNode {
    /// Local name of the node within the workflow.
    pub id: String,
    /// Concrete child task name.
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub phase: String,
    pub task_ref: String,
    pub position: DagPosition,
    /// Effective input, truncated for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Captured output, truncated for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DagEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// `dependency`, `success`, `failure`, or `always`.
    #[serde(rename = "type")]
    pub edge_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_serialises_with_dashes() {
        assert_eq!(
            serde_json::to_string(&TaskType::HttpGet).unwrap(),
            "\"http-get\""
        );
        assert_eq!(
            serde_json::from_str::<TaskType>("\"http-post\"").unwrap(),
            TaskType::HttpPost
        );
    }

    #[test]
    fn task_spec_round_trips_from_camel_case() {
        let raw = r#"{
            "type": "shell",
            "input": "echo hi",
            "executionMode": "parallel",
            "failFast": true,
            "timeout": 10,
            "expect": "hi|bye",
            "dependencies": ["setup"],
            "inputSources": [
                {"name": "CODE", "taskRef": "check", "field": "errorCode"}
            ],
            "inputTemplate": "echo ${CODE}"
        }"#;
        let spec: TaskSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.task_type, TaskType::Shell);
        assert_eq!(spec.execution_mode, Some(ExecutionMode::Parallel));
        assert!(spec.fail_fast);
        let sources = spec.input_sources.as_ref().unwrap();
        assert_eq!(sources[0].field, SourceField::ErrorCode);
        assert_eq!(sources[0].task_ref, "check");
    }

    #[test]
    fn condition_round_trips() {
        let cond = TaskCondition {
            dependent_task: "check".into(),
            when: ConditionWhen::Success,
            field_equals: Some(FieldEquals {
                field: ConditionField::ErrorCode,
                value: "0".into(),
            }),
            output_contains: None,
        };
        let encoded = serde_json::to_string(&cond).unwrap();
        assert!(encoded.contains("\"dependentTask\":\"check\""));
        assert!(encoded.contains("\"when\":\"success\""));
        let decoded: TaskCondition = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, cond);
    }

    #[test]
    fn phases_know_terminality() {
        assert!(TaskPhase::Skipped.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
        assert!(!TaskPhase::Running.is_terminal());
        assert!(WorkflowPhase::Succeeded.is_terminal());
        assert!(!WorkflowPhase::Pending.is_terminal());
    }

    #[test]
    fn child_names_join_workflow_and_local_name() {
        assert_eq!(child_task_name("health-monitor", "check"), "health-monitor-check");
    }
}

//! DAG snapshot construction: a per-run view of nodes, edges, phase
//! counts, and a deterministic layered layout, published into the
//! workflow status for UI consumption.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::crd::{
    ConditionWhen, DagEdge, DagMetadata, DagNode, DagPosition, Task, TaskPhase, WorkflowDag,
    WorkflowSpec, child_task_name,
};
use crate::graph;

/// Display truncation limits for node input and output.
const INPUT_LIMIT: usize = 200;
const OUTPUT_LIMIT: usize = 500;

/// Horizontal axis nodes are centred around, and spacing between
/// neighbours on the same level.
const X_AXIS: f64 = 400.0;
const X_SPACING: f64 = 200.0;
const Y_BASE: f64 = 100.0;
const Y_SPACING: f64 = 150.0;

/// Build a fresh snapshot of one workflow run. `children` is keyed by
/// concrete child task name; nodes without a child yet render as Pending.
/// The layout is deterministic given the spec.
pub fn build_snapshot(
    workflow_name: &str,
    spec: &WorkflowSpec,
    workflow_phase: &str,
    children: &HashMap<String, Task>,
    now: DateTime<Utc>,
) -> WorkflowDag {
    let levels = graph::node_levels(&spec.task_nodes);

    // Row width per level, in spec order, for centring.
    let mut row_sizes: HashMap<usize, usize> = HashMap::new();
    for node in &spec.task_nodes {
        let level = levels.get(&node.local_name).copied().unwrap_or(0);
        *row_sizes.entry(level).or_insert(0) += 1;
    }

    let mut metadata = DagMetadata::default();
    let mut row_positions: HashMap<usize, usize> = HashMap::new();
    let mut nodes = Vec::with_capacity(spec.task_nodes.len());

    for spec_node in &spec.task_nodes {
        let level = levels.get(&spec_node.local_name).copied().unwrap_or(0);
        let row_index = {
            let slot = row_positions.entry(level).or_insert(0);
            let current = *slot;
            *slot += 1;
            current
        };
        let row_size = row_sizes.get(&level).copied().unwrap_or(1);
        let position = DagPosition {
            x: X_AXIS + (row_index as f64 - (row_size as f64 - 1.0) / 2.0) * X_SPACING,
            y: Y_BASE + level as f64 * Y_SPACING,
        };

        let child_name = child_task_name(workflow_name, &spec_node.local_name);
        let child = children.get(&child_name);
        let phase = child
            .and_then(Task::phase)
            .unwrap_or(TaskPhase::Pending);

        match phase {
            TaskPhase::Succeeded => metadata.success_count += 1,
            TaskPhase::Failed => metadata.failure_count += 1,
            TaskPhase::Running => metadata.running_count += 1,
            TaskPhase::Pending => metadata.pending_count += 1,
            TaskPhase::Skipped => metadata.skipped_count += 1,
        }

        let status = child.and_then(|c| c.status.as_ref());
        let result = status.and_then(|s| s.result.as_ref());
        let start_time = status.and_then(|s| s.start_time);
        let end_time = status.and_then(|s| s.completion_time);

        nodes.push(DagNode {
            id: spec_node.local_name.clone(),
            name: child_name,
            node_type: child
                .map(|c| c.spec.task_type.as_str().to_string())
                .unwrap_or_else(|| "shell".to_string()),
            phase: phase.as_str().to_string(),
            task_ref: spec_node.task_ref.name.clone(),
            position,
            input: child.map(|c| truncate(&c.spec.input, INPUT_LIMIT)),
            output: result
                .and_then(|r| r.output.as_deref())
                .map(|o| truncate(o, OUTPUT_LIMIT)),
            duration: match (start_time, end_time) {
                (Some(start), Some(end)) => Some(format_duration(end - start)),
                _ => None,
            },
            start_time,
            end_time,
            error_code: result.map(|r| r.error_code.clone()),
            error_message: result.and_then(|r| r.error_message.clone()),
            http_status_code: result.and_then(|r| r.http_status_code),
        });
    }

    let edges = build_edges(spec);
    metadata.total_nodes = nodes.len();
    metadata.total_edges = edges.len();

    WorkflowDag {
        run_id: format!("{workflow_name}-{}", now.format("%Y%m%d-%H%M%S")),
        timestamp: now,
        workflow_phase: workflow_phase.to_string(),
        nodes,
        edges,
        metadata,
        layout: "layered".to_string(),
    }
}

/// One edge per declared dependency, plus a synthesised conditional edge
/// when a condition references a predecessor no dependency edge already
/// covers.
fn build_edges(spec: &WorkflowSpec) -> Vec<DagEdge> {
    let mut edges = Vec::new();
    for node in &spec.task_nodes {
        for dep in &node.dependencies {
            edges.push(DagEdge {
                id: format!("{dep}-{}", node.local_name),
                source: dep.clone(),
                target: node.local_name.clone(),
                edge_type: "dependency".to_string(),
                condition: None,
                label: None,
            });
        }
        if let Some(condition) = &node.condition {
            if !node.dependencies.contains(&condition.dependent_task) {
                let edge_type = match condition.when {
                    ConditionWhen::Success => "success",
                    ConditionWhen::Failure => "failure",
                    ConditionWhen::Always | ConditionWhen::Completed => "always",
                };
                // Field predicates label the edge with their literal value.
                let label = match (&condition.field_equals, condition.when) {
                    (Some(eq), _) => eq.value.clone(),
                    (None, ConditionWhen::Success) => "\u{2713}".to_string(),
                    (None, ConditionWhen::Failure) => "\u{2717}".to_string(),
                    (None, _) => "*".to_string(),
                };
                edges.push(DagEdge {
                    id: format!("{}-{}-cond", condition.dependent_task, node.local_name),
                    source: condition.dependent_task.clone(),
                    target: node.local_name.clone(),
                    edge_type: edge_type.to_string(),
                    condition: serde_json::to_string(condition).ok(),
                    label: Some(label),
                });
            }
        }
    }
    edges
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(limit).collect();
        out.push_str("...");
        out
    }
}

/// Human-readable duration: ms under a second, fractional seconds under a
/// minute, then minutes and hours.
fn format_duration(d: chrono::Duration) -> String {
    let millis = d.num_milliseconds().max(0);
    if millis < 1_000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1_000.0)
    } else if millis < 3_600_000 {
        let minutes = millis / 60_000;
        let seconds = (millis % 60_000) / 1_000;
        format!("{minutes}m{seconds}s")
    } else {
        let hours = millis / 3_600_000;
        let minutes = (millis % 3_600_000) / 60_000;
        format!("{hours}h{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        TaskCondition, TaskReference, TaskResult, TaskSpec, TaskStatus, TaskType, WorkflowTaskNode,
    };
    use chrono::TimeZone;

    fn node(local_name: &str, dependencies: &[&str]) -> WorkflowTaskNode {
        WorkflowTaskNode {
            local_name: local_name.to_string(),
            task_ref: TaskReference {
                name: format!("{local_name}-template"),
                namespace: None,
            },
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            condition: None,
            input_sources: None,
            input_template: None,
        }
    }

    fn child(workflow: &str, local_name: &str, phase: TaskPhase) -> (String, Task) {
        let name = child_task_name(workflow, local_name);
        let spec = TaskSpec {
            task_type: TaskType::Shell,
            input: "echo hi".into(),
            execution_mode: None,
            fail_fast: false,
            timeout: None,
            retry_count: None,
            expect: None,
            schedule: None,
            environment: None,
            dependencies: None,
            input_sources: None,
            input_template: None,
        };
        let mut task = Task::new(&name, spec);
        task.status = Some(TaskStatus {
            phase: Some(phase),
            start_time: Some(Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()),
            completion_time: Some(Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 2).unwrap()),
            result: Some(TaskResult {
                output: Some("hi".into()),
                error_code: "0".into(),
                error_message: None,
                http_status_code: None,
            }),
        });
        (name, task)
    }

    fn snapshot_for(nodes: Vec<WorkflowTaskNode>, children: HashMap<String, Task>) -> WorkflowDag {
        let spec = WorkflowSpec {
            schedule: None,
            task_nodes: nodes,
        };
        build_snapshot(
            "wf",
            &spec,
            "Running",
            &children,
            Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 5).unwrap(),
        )
    }

    #[test]
    fn run_id_embeds_the_timestamp() {
        let dag = snapshot_for(vec![node("a", &[])], HashMap::new());
        assert_eq!(dag.run_id, "wf-20240304-120005");
        assert_eq!(dag.layout, "layered");
    }

    #[test]
    fn missing_children_count_as_pending() {
        let dag = snapshot_for(vec![node("a", &[]), node("b", &["a"])], HashMap::new());
        assert_eq!(dag.metadata.total_nodes, 2);
        assert_eq!(dag.metadata.pending_count, 2);
        assert_eq!(dag.metadata.total_edges, 1);
        assert_eq!(dag.edges[0].edge_type, "dependency");
    }

    #[test]
    fn phase_counters_follow_children() {
        let mut children = HashMap::new();
        for (local, phase) in [
            ("a", TaskPhase::Succeeded),
            ("b", TaskPhase::Failed),
            ("c", TaskPhase::Skipped),
        ] {
            let (name, task) = child("wf", local, phase);
            children.insert(name, task);
        }
        let dag = snapshot_for(
            vec![node("a", &[]), node("b", &["a"]), node("c", &["a"])],
            children,
        );
        assert_eq!(dag.metadata.success_count, 1);
        assert_eq!(dag.metadata.failure_count, 1);
        assert_eq!(dag.metadata.skipped_count, 1);
        assert_eq!(dag.nodes[0].duration.as_deref(), Some("2.0s"));
        assert_eq!(dag.nodes[0].output.as_deref(), Some("hi"));
    }

    #[test]
    fn layout_is_layered_and_centred() {
        let dag = snapshot_for(
            vec![node("a", &[]), node("b", &["a"]), node("c", &["a"])],
            HashMap::new(),
        );
        let a = &dag.nodes[0];
        let b = &dag.nodes[1];
        let c = &dag.nodes[2];
        assert_eq!(a.position.y, Y_BASE);
        assert_eq!(b.position.y, Y_BASE + Y_SPACING);
        assert_eq!(c.position.y, Y_BASE + Y_SPACING);
        // Single node on level 0 sits on the axis; the pair straddles it.
        assert_eq!(a.position.x, X_AXIS);
        assert_eq!(b.position.x, X_AXIS - X_SPACING / 2.0);
        assert_eq!(c.position.x, X_AXIS + X_SPACING / 2.0);
    }

    #[test]
    fn layout_is_deterministic() {
        let make = || {
            snapshot_for(
                vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])],
                HashMap::new(),
            )
        };
        let left = make();
        let right = make();
        for (l, r) in left.nodes.iter().zip(right.nodes.iter()) {
            assert_eq!(l.position, r.position);
        }
    }

    #[test]
    fn condition_without_dependency_synthesises_an_edge() {
        let mut gated = node("log-success", &[]);
        gated.condition = Some(TaskCondition {
            dependent_task: "check".into(),
            when: ConditionWhen::Success,
            field_equals: None,
            output_contains: None,
        });
        let dag = snapshot_for(vec![node("check", &[]), gated], HashMap::new());
        assert_eq!(dag.metadata.total_edges, 1);
        let edge = &dag.edges[0];
        assert_eq!(edge.edge_type, "success");
        assert_eq!(edge.source, "check");
        assert_eq!(edge.target, "log-success");
        assert_eq!(edge.label.as_deref(), Some("\u{2713}"));
    }

    #[test]
    fn condition_covered_by_dependency_adds_no_edge() {
        let mut gated = node("after", &["check"]);
        gated.condition = Some(TaskCondition {
            dependent_task: "check".into(),
            when: ConditionWhen::Failure,
            field_equals: None,
            output_contains: None,
        });
        let dag = snapshot_for(vec![node("check", &[]), gated], HashMap::new());
        assert_eq!(dag.metadata.total_edges, 1);
        assert_eq!(dag.edges[0].edge_type, "dependency");
    }

    #[test]
    fn truncation_and_duration_formatting() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(600);
        assert_eq!(truncate(&long, 500).len(), 503);
        assert_eq!(format_duration(chrono::Duration::milliseconds(250)), "250ms");
        assert_eq!(format_duration(chrono::Duration::milliseconds(1_500)), "1.5s");
        assert_eq!(format_duration(chrono::Duration::seconds(90)), "1m30s");
        assert_eq!(format_duration(chrono::Duration::seconds(3_660)), "1h1m");
    }
}

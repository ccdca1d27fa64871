#![allow(clippy::unwrap_used)]

//! Materialisation, rollup, and rearm logic exercised without a cluster.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use kube::ResourceExt;
use magpie::controllers::workflow::{aggregate, build_child, rearm};
use magpie::crd::{
    CONDITION_ANNOTATION, ConditionWhen, ORIGINAL_TASK_LABEL, SourceField, TASK_LABEL, Task,
    TaskCondition, TaskInputSource, TaskPhase, TaskReference, TaskResult, TaskSpec, TaskStatus,
    TaskType, WORKFLOW_LABEL, Workflow, WorkflowSpec, WorkflowStatus, WorkflowTaskNode,
};
use magpie::dag::build_snapshot;

fn template(name: &str) -> Task {
    Task::new(
        name,
        TaskSpec {
            task_type: TaskType::Shell,
            input: "echo hi".into(),
            execution_mode: None,
            fail_fast: false,
            timeout: Some(10),
            retry_count: None,
            expect: None,
            schedule: None,
            environment: None,
            dependencies: None,
            input_sources: None,
            input_template: None,
        },
    )
}

fn workflow(name: &str, nodes: Vec<WorkflowTaskNode>) -> Workflow {
    Workflow::new(
        name,
        WorkflowSpec {
            schedule: None,
            task_nodes: nodes,
        },
    )
}

fn node(local_name: &str, template_name: &str) -> WorkflowTaskNode {
    WorkflowTaskNode {
        local_name: local_name.to_string(),
        task_ref: TaskReference {
            name: template_name.to_string(),
            namespace: None,
        },
        dependencies: Vec::new(),
        condition: None,
        input_sources: None,
        input_template: None,
    }
}

fn terminal_task(name: &str, phase: TaskPhase) -> Task {
    let mut task = template(name);
    task.status = Some(TaskStatus {
        phase: Some(phase),
        start_time: None,
        completion_time: None,
        result: Some(TaskResult {
            output: Some("done".into()),
            error_code: "0".into(),
            error_message: None,
            http_status_code: None,
        }),
    });
    task
}

#[test]
fn child_names_and_labels_follow_the_workflow() {
    let wf = workflow("health-monitor", vec![node("check", "http-check")]);
    let child = build_child(&wf, &wf.spec.task_nodes[0], &template("http-check")).unwrap();

    assert_eq!(child.name_any(), "health-monitor-check");
    let labels = child.metadata.labels.as_ref().unwrap();
    assert_eq!(labels[WORKFLOW_LABEL], "health-monitor");
    assert_eq!(labels[TASK_LABEL], "check");
    assert_eq!(labels[ORIGINAL_TASK_LABEL], "http-check");
    // The template spec is copied through.
    assert_eq!(child.spec.timeout, Some(10));
}

#[test]
fn dependencies_are_rewritten_to_child_names() {
    let mut gated = node("log", "logger");
    gated.dependencies = vec!["check".to_string()];
    let wf = workflow("health-monitor", vec![node("check", "http-check"), gated]);

    let child = build_child(&wf, &wf.spec.task_nodes[1], &template("logger")).unwrap();
    assert_eq!(
        child.spec.dependencies,
        Some(vec!["health-monitor-check".to_string()])
    );
}

#[test]
fn conditions_are_rewritten_and_serialised_into_the_annotation() {
    let mut gated = node("log-success", "logger");
    gated.condition = Some(TaskCondition {
        dependent_task: "check".into(),
        when: ConditionWhen::Success,
        field_equals: None,
        output_contains: None,
    });
    let wf = workflow("health-monitor", vec![node("check", "http-check"), gated]);

    let child = build_child(&wf, &wf.spec.task_nodes[1], &template("logger")).unwrap();
    let raw = child
        .metadata
        .annotations
        .as_ref()
        .unwrap()
        .get(CONDITION_ANNOTATION)
        .unwrap();
    let condition: TaskCondition = serde_json::from_str(raw).unwrap();
    assert_eq!(condition.dependent_task, "health-monitor-check");
    assert_eq!(condition.when, ConditionWhen::Success);
}

#[test]
fn input_sources_are_rewritten_onto_the_child_spec() {
    let mut gated = node("log-success", "logger");
    gated.input_sources = Some(vec![TaskInputSource {
        name: "CODE".into(),
        task_ref: "check".into(),
        field: SourceField::ErrorCode,
        json_path: None,
        default: None,
    }]);
    gated.input_template = Some("echo SUCCESS ${CODE}".into());
    let wf = workflow("health-monitor", vec![node("check", "http-check"), gated]);

    let child = build_child(&wf, &wf.spec.task_nodes[1], &template("logger")).unwrap();
    let sources = child.spec.input_sources.as_ref().unwrap();
    assert_eq!(sources[0].task_ref, "health-monitor-check");
    assert_eq!(
        child.spec.input_template.as_deref(),
        Some("echo SUCCESS ${CODE}")
    );
}

#[test]
fn rollup_waits_for_unobserved_children() {
    let running = vec![
        terminal_task("a", TaskPhase::Succeeded),
        template("b"), // no status yet
    ];
    let (all_completed, has_failed) = aggregate(&running);
    assert!(!all_completed);
    assert!(!has_failed);
}

#[test]
fn rollup_treats_skipped_as_completed_not_failed() {
    let children = vec![
        terminal_task("a", TaskPhase::Succeeded),
        terminal_task("b", TaskPhase::Skipped),
    ];
    let (all_completed, has_failed) = aggregate(&children);
    assert!(all_completed);
    assert!(!has_failed);
}

#[test]
fn rollup_flags_any_failure() {
    let children = vec![
        terminal_task("a", TaskPhase::Succeeded),
        terminal_task("b", TaskPhase::Failed),
    ];
    let (all_completed, has_failed) = aggregate(&children);
    assert!(all_completed);
    assert!(has_failed);
}

fn snapshot(run: u32) -> magpie::crd::WorkflowDag {
    let spec = WorkflowSpec {
        schedule: Some("*/1 * * * *".into()),
        task_nodes: vec![node("a", "tpl")],
    };
    build_snapshot(
        "wf",
        &spec,
        "Succeeded",
        &HashMap::new(),
        Utc.with_ymd_and_hms(2024, 3, 4, 12, run, 0).unwrap(),
    )
}

#[test]
fn rearm_archives_once_and_clears_timing() {
    let mut status = WorkflowStatus {
        phase: Some(magpie::crd::WorkflowPhase::Succeeded),
        start_time: Some(Utc::now()),
        completion_time: Some(Utc::now()),
        last_run_time: Some(Utc::now()),
        dag: Some(snapshot(0)),
        dag_history: Vec::new(),
    };

    rearm(&mut status);
    assert_eq!(status.phase, Some(magpie::crd::WorkflowPhase::Pending));
    assert!(status.start_time.is_none());
    assert!(status.completion_time.is_none());
    assert!(status.dag.is_none());
    assert_eq!(status.dag_history.len(), 1);
    // The fire marker survives the reset for the cron gate.
    assert!(status.last_run_time.is_some());

    // A second immediate pass has nothing left to archive.
    rearm(&mut status);
    assert_eq!(status.dag_history.len(), 1);
}

#[test]
fn history_is_newest_first_and_capped_at_five() {
    let mut status = WorkflowStatus::default();
    for run in 0..7 {
        status.dag = Some(snapshot(run));
        rearm(&mut status);
    }
    assert_eq!(status.dag_history.len(), 5);
    assert_eq!(status.dag_history[0].run_id, "wf-20240304-120600");
    assert_eq!(status.dag_history[4].run_id, "wf-20240304-120200");
    // Run ids stay distinct across runs.
    let mut ids: Vec<&str> = status
        .dag_history
        .iter()
        .map(|d| d.run_id.as_str())
        .collect();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

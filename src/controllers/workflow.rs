//! The workflow reconciler: gate on the cron schedule, materialise the
//! referenced task templates into concrete per-run children, roll up the
//! aggregate phase, publish DAG snapshots, and rearm scheduled workflows
//! for their next run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use super::{Error, Result, update_status};
use crate::config::MagpieConfig;
use crate::crd::{
    CONDITION_ANNOTATION, ORIGINAL_TASK_LABEL, TASK_LABEL, Task, TaskPhase, WORKFLOW_LABEL,
    Workflow, WorkflowPhase, WorkflowStatus, WorkflowTaskNode, child_task_name,
};
use crate::cron::Schedule;
use crate::dag;
use crate::graph;

/// Completed scheduled runs kept in the status history.
pub const DAG_HISTORY_LIMIT: usize = 5;

/// How long a name collision waits for the old child to finish deleting.
const CHILD_DELETION_WAIT_SECS: u64 = 30;

pub struct Context {
    pub client: Client,
    pub config: MagpieConfig,
}

/// Run the workflow controller until the watch stream ends.
pub async fn run(client: Client, config: MagpieConfig) {
    info!("starting workflow controller");
    let workflows: Api<Workflow> = Api::all(client.clone());
    let context = Arc::new(Context { client, config });

    Controller::new(workflows, watcher::Config::default())
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((workflow, _)) => debug!(workflow = %workflow.name, "reconciled workflow"),
                Err(e) => error!(error = %e, "workflow reconciliation error"),
            }
        })
        .await;
}

fn error_policy(_workflow: Arc<Workflow>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = %error, "workflow reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(workflow: Arc<Workflow>, ctx: Arc<Context>) -> Result<Action> {
    let name = workflow.name_any();
    let namespace = workflow.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Workflow> = Api::namespaced(ctx.client.clone(), &namespace);
    let tasks: Api<Task> = Api::namespaced(ctx.client.clone(), &namespace);

    match workflow.phase() {
        None => {
            debug!(workflow = %name, "initialising workflow");
            match update_status(&api, &name, |w: &mut Workflow| {
                w.status.get_or_insert_with(WorkflowStatus::default).phase =
                    Some(WorkflowPhase::Pending);
            })
            .await
            {
                Ok(_) => Ok(Action::requeue(Duration::from_secs(1))),
                Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
                Err(e) => Err(e),
            }
        }
        Some(WorkflowPhase::Pending) => reconcile_pending(&api, &tasks, &workflow, &ctx).await,
        Some(WorkflowPhase::Running) => reconcile_running(&api, &tasks, &workflow, &ctx).await,
        Some(_) => reconcile_terminal(&api, &tasks, &workflow, &ctx).await,
    }
}

/// Fire the run once the cron gate passes: materialise children, record
/// `startTime` and `lastRunTime`, move to Running.
async fn reconcile_pending(
    api: &Api<Workflow>,
    tasks: &Api<Task>,
    workflow: &Workflow,
    ctx: &Context,
) -> Result<Action> {
    let name = workflow.name_any();

    if let Some(expression) = workflow.schedule() {
        let schedule = Schedule::parse(expression).context(super::CronSnafu)?;
        let last_run = workflow.status.as_ref().and_then(|s| s.last_run_time);
        if !schedule.should_fire(Utc::now(), last_run) {
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
    }

    info!(workflow = %name, nodes = workflow.spec.task_nodes.len(), "materialising workflow run");
    materialise(tasks, workflow, ctx).await?;

    let now = Utc::now();
    match update_status(api, &name, |w: &mut Workflow| {
        let status = w.status.get_or_insert_with(WorkflowStatus::default);
        status.phase = Some(WorkflowPhase::Running);
        status.start_time = Some(now);
        status.last_run_time = Some(now);
        status.completion_time = None;
    })
    .await
    {
        Ok(_) => Ok(Action::requeue(ctx.config.reconcile_interval())),
        Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
        Err(e) => Err(e),
    }
}

/// Rebuild the DAG snapshot every pass and roll the phase up once every
/// child is terminal. A Skipped child is completed, not failed.
async fn reconcile_running(
    api: &Api<Workflow>,
    tasks: &Api<Task>,
    workflow: &Workflow,
    ctx: &Context,
) -> Result<Action> {
    let name = workflow.name_any();
    let children = list_children(tasks, &name).await?;
    let (all_completed, has_failed) = aggregate(&children);

    let phase = if all_completed {
        if has_failed {
            WorkflowPhase::Failed
        } else {
            WorkflowPhase::Succeeded
        }
    } else {
        WorkflowPhase::Running
    };

    let by_name: HashMap<String, Task> = children
        .into_iter()
        .map(|c| (c.name_any(), c))
        .collect();
    let snapshot = dag::build_snapshot(&name, &workflow.spec, phase.as_str(), &by_name, Utc::now());
    let now = Utc::now();

    let write = update_status(api, &name, |w: &mut Workflow| {
        let status = w.status.get_or_insert_with(WorkflowStatus::default);
        status.dag = Some(snapshot.clone());
        if all_completed {
            status.phase = Some(phase);
            status.completion_time.get_or_insert(now);
        }
    })
    .await;

    match write {
        Ok(_) if all_completed => {
            info!(workflow = %name, phase = phase.as_str(), "workflow run completed");
            // Straight into the terminal branch for history/reset handling.
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Ok(_) => Ok(Action::requeue(ctx.config.reconcile_interval())),
        Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
        Err(e) => Err(e),
    }
}

/// Terminal handling. Unscheduled workflows rest here; scheduled ones
/// archive the final snapshot, delete their children (templates are
/// untouched), and rearm to Pending with cleared timing fields in a
/// single status write so an immediate second pass cannot double-archive.
async fn reconcile_terminal(
    api: &Api<Workflow>,
    tasks: &Api<Task>,
    workflow: &Workflow,
    ctx: &Context,
) -> Result<Action> {
    let name = workflow.name_any();
    if workflow.schedule().is_none() {
        return Ok(Action::await_change());
    }

    debug!(workflow = %name, "resetting scheduled workflow for next run");
    delete_children(tasks, &name).await?;

    let write = update_status(api, &name, |w: &mut Workflow| {
        rearm(w.status.get_or_insert_with(WorkflowStatus::default));
    })
    .await;

    match write {
        Ok(_) => Ok(Action::requeue(ctx.config.reconcile_interval())),
        Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
        Err(e) => Err(e),
    }
}

/// Materialise children in topological order. A cycle does not abort the
/// sort; nodes on it still materialise best effort and stall on their own
/// dependency gates.
async fn materialise(tasks: &Api<Task>, workflow: &Workflow, ctx: &Context) -> Result<()> {
    let order = graph::materialisation_order(&workflow.spec.task_nodes);
    for index in order {
        let node = &workflow.spec.task_nodes[index];
        let template_namespace = node
            .task_ref
            .namespace
            .clone()
            .or_else(|| workflow.namespace())
            .unwrap_or_else(|| "default".to_string());
        let templates: Api<Task> = Api::namespaced(ctx.client.clone(), &template_namespace);
        let template = templates
            .get_opt(&node.task_ref.name)
            .await
            .context(super::ApiSnafu)?
            .context(super::TemplateMissingSnafu {
                name: node.task_ref.name.clone(),
            })?;

        let child = build_child(workflow, node, &template).context(super::SerdeSnafu)?;
        create_child(tasks, child).await?;
    }
    Ok(())
}

/// Deep-copy the template spec into a concrete child task: rewrite
/// dependency, condition, and input-source references from local names to
/// `{workflow}-{localName}` form, attach the tracking labels, and encode
/// the condition into its annotation.
pub fn build_child(
    workflow: &Workflow,
    node: &WorkflowTaskNode,
    template: &Task,
) -> std::result::Result<Task, serde_json::Error> {
    let workflow_name = workflow.name_any();
    let child_name = child_task_name(&workflow_name, &node.local_name);

    let mut spec = template.spec.clone();
    spec.dependencies = if node.dependencies.is_empty() {
        None
    } else {
        Some(
            node.dependencies
                .iter()
                .map(|dep| child_task_name(&workflow_name, dep))
                .collect(),
        )
    };
    if let Some(sources) = &node.input_sources {
        spec.input_sources = Some(
            sources
                .iter()
                .map(|source| {
                    let mut source = source.clone();
                    source.task_ref = child_task_name(&workflow_name, &source.task_ref);
                    source
                })
                .collect(),
        );
    }
    if let Some(template_string) = &node.input_template {
        spec.input_template = Some(template_string.clone());
    }

    let mut child = Task::new(&child_name, spec);
    child.metadata.namespace = workflow.namespace();

    let labels = child.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(WORKFLOW_LABEL.to_string(), workflow_name.clone());
    labels.insert(TASK_LABEL.to_string(), node.local_name.clone());
    labels.insert(
        ORIGINAL_TASK_LABEL.to_string(),
        template.name_any(),
    );

    if let Some(condition) = &node.condition {
        let mut condition = condition.clone();
        condition.dependent_task = child_task_name(&workflow_name, &condition.dependent_task);
        let annotations = child
            .metadata
            .annotations
            .get_or_insert_with(Default::default);
        annotations.insert(
            CONDITION_ANNOTATION.to_string(),
            serde_json::to_string(&condition)?,
        );
    }

    if let Some(uid) = workflow.uid() {
        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "magpie.io/v1".to_string(),
            kind: "Workflow".to_string(),
            name: workflow_name,
            uid,
            controller: Some(true),
            block_owner_deletion: None,
        }]);
    }

    Ok(child)
}

/// Create one child. A name collision means a prior run's child is still
/// around: delete it if nothing already did, wait (bounded) for it to
/// disappear, then create.
async fn create_child(tasks: &Api<Task>, child: Task) -> Result<()> {
    let name = child.name_any();
    match tasks.create(&PostParams::default(), &child).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            if let Some(existing) = tasks.get_opt(&name).await.context(super::ApiSnafu)? {
                if existing.metadata.deletion_timestamp.is_none() {
                    debug!(task = %name, "deleting stale child before recreation");
                    if let Err(e) = tasks.delete(&name, &DeleteParams::default()).await {
                        warn!(task = %name, error = %e, "failed to delete stale child");
                    }
                }
            }
            for _ in 0..CHILD_DELETION_WAIT_SECS {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if tasks.get_opt(&name).await.context(super::ApiSnafu)?.is_none() {
                    tasks
                        .create(&PostParams::default(), &child)
                        .await
                        .context(super::ApiSnafu)?;
                    return Ok(());
                }
            }
            super::DeletionTimeoutSnafu { name }.fail()
        }
        Err(e) => Err(Error::Api { source: e }),
    }
}

async fn list_children(tasks: &Api<Task>, workflow_name: &str) -> Result<Vec<Task>> {
    let params = ListParams::default().labels(&format!("{WORKFLOW_LABEL}={workflow_name}"));
    let list = tasks.list(&params).await.context(super::ApiSnafu)?;
    Ok(list.items)
}

/// Delete all current children and wait (bounded) for the finalizers to
/// release them; template tasks carry no workflow label and are
/// preserved.
async fn delete_children(tasks: &Api<Task>, workflow_name: &str) -> Result<()> {
    let params = ListParams::default().labels(&format!("{WORKFLOW_LABEL}={workflow_name}"));
    if let Err(e) = tasks
        .delete_collection(&DeleteParams::default(), &params)
        .await
    {
        warn!(workflow = %workflow_name, error = %e, "failed to delete child tasks");
    }
    for _ in 0..CHILD_DELETION_WAIT_SECS {
        if list_children(tasks, workflow_name).await?.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    warn!(workflow = %workflow_name, "child tasks still deleting after wait");
    Ok(())
}

/// Rearm a scheduled workflow for its next run: prepend the final
/// snapshot to the bounded history and reset phase and timing. Taking
/// `dag` makes the archive idempotent; a second pass finds nothing to
/// prepend.
pub fn rearm(status: &mut WorkflowStatus) {
    if let Some(final_dag) = status.dag.take() {
        status.dag_history.insert(0, final_dag);
        status.dag_history.truncate(DAG_HISTORY_LIMIT);
    }
    status.phase = Some(WorkflowPhase::Pending);
    status.start_time = None;
    status.completion_time = None;
}

/// Aggregate rollup: completed iff no child is Pending, Running, or not
/// yet observed; failed iff any child is Failed.
pub fn aggregate(children: &[Task]) -> (bool, bool) {
    let all_completed = children.iter().all(Task::is_terminal);
    let has_failed = children
        .iter()
        .any(|c| c.phase() == Some(TaskPhase::Failed));
    (all_completed, has_failed)
}

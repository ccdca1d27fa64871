//! The task reconciler: drive a single task through
//! Pending → Running → Succeeded/Failed/Skipped, with condition,
//! dependency, schedule, and input-source gates in front of execution.
//!
//! Execution is at-most-once per reconcile: the Running phase is
//! committed before the executors start, and a task observed Running is
//! treated as already attempted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use super::{Error, Result, SerdeSnafu, update_status};
use crate::config::MagpieConfig;
use crate::conditions::{self, Decision};
use crate::crd::{
    CONDITION_ANNOTATION, ExecutionMode, TASK_FINALIZER, Task, TaskCondition, TaskPhase,
    TaskResult, TaskStatus,
};
use crate::cron::Schedule;
use crate::inputs::{self, ResolvedInputs};
use crate::sink::{ExecutionRecord, ServiceStatus, Sink};
use crate::workers;

pub struct Context {
    pub client: Client,
    pub config: MagpieConfig,
    pub sink: Option<Arc<dyn Sink>>,
}

/// Run the task controller until the watch stream ends.
pub async fn run(client: Client, config: MagpieConfig, sink: Option<Arc<dyn Sink>>) {
    info!("starting task controller");
    let tasks: Api<Task> = Api::all(client.clone());
    let context = Arc::new(Context {
        client,
        config,
        sink,
    });

    Controller::new(tasks, watcher::Config::default())
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((task, _)) => debug!(task = %task.name, "reconciled task"),
                Err(e) => error!(error = %e, "task reconciliation error"),
            }
        })
        .await;
}

fn error_policy(_task: Arc<Task>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = %error, "task reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(task: Arc<Task>, ctx: Arc<Context>) -> Result<Action> {
    let name = task.name_any();
    let namespace = task.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Task> = Api::namespaced(ctx.client.clone(), &namespace);

    if task.metadata.deletion_timestamp.is_some() {
        cleanup_task_resources(&ctx.client, &namespace, &name).await;
        remove_finalizer(&api, &task).await?;
        return Ok(Action::await_change());
    }

    match task.phase() {
        None => {
            debug!(task = %name, "initialising task");
            ensure_finalizer(&api, &task).await?;
            match update_status(&api, &name, |t: &mut Task| {
                t.status.get_or_insert_with(TaskStatus::default).phase = Some(TaskPhase::Pending);
            })
            .await
            {
                Ok(_) => Ok(Action::requeue(Duration::from_secs(1))),
                Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
                Err(e) => Err(e),
            }
        }
        Some(TaskPhase::Pending) => {
            ensure_finalizer(&api, &task).await?;
            reconcile_pending(&api, &task, &ctx).await
        }
        Some(TaskPhase::Running) => {
            // A crash between the Running commit and executor completion
            // leaves the task here; there is no resumption.
            warn!(task = %name, "observed Running mid-flight, treating as already attempted");
            Ok(Action::await_change())
        }
        Some(_) => Ok(Action::await_change()),
    }
}

/// Work through the Pending gates in order: condition, dependencies,
/// schedule, input sources. Only when all pass does the task commit to
/// Running and execute.
async fn reconcile_pending(api: &Api<Task>, task: &Task, ctx: &Context) -> Result<Action> {
    let name = task.name_any();

    if let Some(raw) = task.annotations().get(CONDITION_ANNOTATION) {
        let condition: TaskCondition = serde_json::from_str(raw).context(SerdeSnafu)?;
        let dependent = api
            .get_opt(&condition.dependent_task)
            .await
            .context(super::ApiSnafu)?;
        let Some(dependent) = dependent else {
            debug!(task = %name, dependent = %condition.dependent_task, "condition predecessor absent");
            return Ok(Action::requeue(Duration::from_secs(10)));
        };
        match conditions::evaluate(&condition, &dependent) {
            Decision::Wait => return Ok(Action::requeue(Duration::from_secs(10))),
            Decision::Skip(message) => {
                info!(task = %name, reason = %message, "skipping task");
                return write_skipped(api, &name, message).await;
            }
            Decision::Run => {}
        }
    }

    if let Some(dependencies) = &task.spec.dependencies {
        for dependency in dependencies {
            match api.get_opt(dependency).await.context(super::ApiSnafu)? {
                Some(dep) if dep.phase() == Some(TaskPhase::Succeeded) => {}
                Some(_) => {
                    debug!(task = %name, dependency = %dependency, "dependency not yet succeeded");
                    return Ok(Action::requeue(Duration::from_secs(30)));
                }
                None => {
                    warn!(task = %name, dependency = %dependency, "dependency does not exist");
                    return Ok(Action::requeue(Duration::from_secs(30)));
                }
            }
        }
    }

    if let Some(expression) = task.spec.schedule.as_deref().filter(|s| !s.is_empty()) {
        let schedule = Schedule::parse(expression).context(super::CronSnafu)?;
        let last_run = task.status.as_ref().and_then(|s| s.start_time);
        if !schedule.should_fire(Utc::now(), last_run) {
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
    }

    let mut resolved = ResolvedInputs::default();
    if let Some(sources) = task.spec.input_sources.as_deref().filter(|s| !s.is_empty()) {
        match inputs::resolve(api, sources).await {
            Ok(bindings) => resolved = bindings,
            Err(e) if e.is_retryable() => {
                debug!(task = %name, reason = %e, "input sources not ready");
                return Ok(Action::requeue(Duration::from_secs(10)));
            }
            Err(e @ inputs::Error::PathUnresolved { .. }) => {
                return write_failed(api, ctx, task, String::new(), e.to_string(), None).await;
            }
            Err(e) => return Err(Error::Inputs { source: e }),
        }
    }

    // Commit the in-flight indicator before anything executes.
    let started = Utc::now();
    match update_status(api, &name, |t: &mut Task| {
        let status = t.status.get_or_insert_with(TaskStatus::default);
        status.phase = Some(TaskPhase::Running);
        status.start_time = Some(started);
    })
    .await
    {
        Ok(_) => {}
        Err(Error::Conflict { .. }) => return Ok(Action::requeue(Duration::from_secs(5))),
        Err(e) => return Err(e),
    }

    let batch = execute(task, &resolved, ctx).await;
    let finished = Utc::now();
    let elapsed_ms = (finished - started).num_milliseconds();
    let phase = if batch.success {
        TaskPhase::Succeeded
    } else {
        TaskPhase::Failed
    };
    let result = TaskResult {
        output: Some(batch.aggregate_output()),
        error_code: if batch.success { "0" } else { "-1" }.to_string(),
        error_message: batch.first_error.clone(),
        http_status_code: batch.http_status,
    };

    info!(
        task = %name,
        phase = phase.as_str(),
        elapsed_ms,
        "task execution finished"
    );

    let write = update_status(api, &name, |t: &mut Task| {
        let status = t.status.get_or_insert_with(TaskStatus::default);
        status.phase = Some(phase);
        status.start_time.get_or_insert(started);
        status.completion_time = Some(finished);
        status.result = Some(result.clone());
    })
    .await;

    append_record(ctx, task, batch.success, batch.first_error, elapsed_ms).await;

    match write {
        Ok(_) => Ok(Action::await_change()),
        Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
        Err(e) => Err(e),
    }
}

/// Build the effective input and environment, fan out, and collect.
async fn execute(task: &Task, resolved: &ResolvedInputs, ctx: &Context) -> workers::BatchResult {
    let effective_input = match task.spec.input_template.as_deref() {
        Some(template) => inputs::render_template(template, &resolved.bindings),
        None => task.spec.input.clone(),
    };
    if !resolved.is_empty() {
        debug!(
            task = %task.name_any(),
            input = %inputs::loggable(&effective_input),
            "rendered effective input"
        );
    }

    let mut environment: BTreeMap<String, String> =
        task.spec.environment.clone().unwrap_or_default();
    environment.extend(resolved.bindings.clone());

    let worker_list = workers::parse_descriptor(
        &effective_input,
        task.spec.task_type,
        task.spec.expect.as_deref(),
    );
    let deadline = task
        .spec
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.task_timeout());
    let mode = task.spec.execution_mode.unwrap_or(ExecutionMode::Sequential);

    workers::run_workers(
        &worker_list,
        mode,
        task.spec.fail_fast,
        &environment,
        deadline,
    )
    .await
}

/// Terminal skip: errorCode "0", a descriptive message, and no output.
async fn write_skipped(api: &Api<Task>, name: &str, message: String) -> Result<Action> {
    let now = Utc::now();
    let write = update_status(api, name, |t: &mut Task| {
        let status = t.status.get_or_insert_with(TaskStatus::default);
        status.phase = Some(TaskPhase::Skipped);
        status.start_time.get_or_insert(now);
        status.completion_time = Some(now);
        status.result = Some(TaskResult {
            output: None,
            error_code: "0".to_string(),
            error_message: Some(message.clone()),
            http_status_code: None,
        });
    })
    .await;
    match write {
        Ok(_) => Ok(Action::await_change()),
        Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
        Err(e) => Err(e),
    }
}

/// Terminal failure reached without (or before) execution.
async fn write_failed(
    api: &Api<Task>,
    ctx: &Context,
    task: &Task,
    output: String,
    message: String,
    http_status: Option<u16>,
) -> Result<Action> {
    let name = task.name_any();
    let now = Utc::now();
    let write = update_status(api, &name, |t: &mut Task| {
        let status = t.status.get_or_insert_with(TaskStatus::default);
        status.phase = Some(TaskPhase::Failed);
        status.start_time.get_or_insert(now);
        status.completion_time = Some(now);
        status.result = Some(TaskResult {
            output: Some(output.clone()),
            error_code: "-1".to_string(),
            error_message: Some(message.clone()),
            http_status_code: http_status,
        });
    })
    .await;

    append_record(ctx, task, false, Some(message), 0).await;

    match write {
        Ok(_) => Ok(Action::await_change()),
        Err(Error::Conflict { .. }) => Ok(Action::requeue(Duration::from_secs(5))),
        Err(e) => Err(e),
    }
}

/// Write-through to the configured log sink. Sink failures are logged and
/// swallowed; observability must not break execution.
async fn append_record(
    ctx: &Context,
    task: &Task,
    success: bool,
    error_message: Option<String>,
    response_time_ms: i64,
) {
    let Some(sink) = &ctx.sink else {
        return;
    };
    let record = ExecutionRecord {
        service_name: task.name_any(),
        service_type: task.spec.task_type.as_str().to_string(),
        status: if success {
            ServiceStatus::Up
        } else {
            ServiceStatus::Down
        },
        error_message,
        response_time_ms,
        timestamp: Utc::now(),
    };
    if let Err(e) = sink.append(&record).await {
        warn!(error = %e, task = %record.service_name, "log sink append failed");
    }
}

/// Delete any pods and configmaps labelled for this task before the
/// record is released. Failures are logged; the finalizer is removed
/// regardless so a broken cleanup cannot wedge deletion forever.
async fn cleanup_task_resources(client: &Client, namespace: &str, name: &str) {
    let selector = ListParams::default().labels(&format!("task={name}"));
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    if let Err(e) = pods
        .delete_collection(&DeleteParams::default(), &selector)
        .await
    {
        warn!(error = %e, task = %name, "failed to delete labelled pods");
    }
    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    if let Err(e) = configmaps
        .delete_collection(&DeleteParams::default(), &selector)
        .await
    {
        warn!(error = %e, task = %name, "failed to delete labelled configmaps");
    }
}

async fn ensure_finalizer(api: &Api<Task>, task: &Task) -> Result<()> {
    if task.finalizers().iter().any(|f| f == TASK_FINALIZER) {
        return Ok(());
    }
    let mut finalizers = task.finalizers().to_vec();
    finalizers.push(TASK_FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &task.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .context(super::ApiSnafu)?;
    Ok(())
}

async fn remove_finalizer(api: &Api<Task>, task: &Task) -> Result<()> {
    if !task.finalizers().iter().any(|f| f == TASK_FINALIZER) {
        return Ok(());
    }
    let finalizers: Vec<String> = task
        .finalizers()
        .iter()
        .filter(|f| *f != TASK_FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &task.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .context(super::ApiSnafu)?;
    Ok(())
}

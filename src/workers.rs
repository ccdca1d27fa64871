//! Worker fan-out: parse a batched input descriptor into a typed worker
//! list and drive it sequentially or in parallel with fail-fast.
//!
//! The `input` string of a shell task may be a JSON array of entries, an
//! object `{"inputs": [...]}`, or a bare string treated as a single entry.
//! HTTP-typed tasks only engage batch mode when the input parses as JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::crd::{ExecutionMode, TaskType};
use crate::expect;
use crate::providers::executors::{ExecOutcome, run_http, run_shell};

/// Separator between per-worker outputs in the aggregate.
const OUTPUT_SEPARATOR: &str = "\n---\n";

/// One entry of the batch descriptor, as typed by the user.
#[derive(Debug, Deserialize)]
struct DescriptorEntry {
    input: String,
    #[serde(rename = "type")]
    kind: Option<TaskType>,
    name: Option<String>,
    expect: Option<String>,
}

/// Entries may be full objects or bare strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Text(String),
    Entry(DescriptorEntry),
}

#[derive(Debug, Deserialize)]
struct DescriptorObject {
    inputs: Vec<RawEntry>,
}

/// A unit of fan-out carrying everything one execution needs.
#[derive(Debug, Clone)]
pub struct Worker {
    pub input: String,
    pub kind: TaskType,
    pub name: String,
    pub expect: Option<String>,
}

/// Parse the input descriptor into a worker list. Entries without their
/// own `type` or `expect` inherit the task-level ones.
pub fn parse_descriptor(input: &str, task_kind: TaskType, task_expect: Option<&str>) -> Vec<Worker> {
    let entries: Option<Vec<RawEntry>> = match serde_json::from_str::<serde_json::Value>(input) {
        Ok(value @ serde_json::Value::Array(_)) => serde_json::from_value(value).ok(),
        Ok(value @ serde_json::Value::Object(_)) => {
            serde_json::from_value::<DescriptorObject>(value)
                .ok()
                .map(|d| d.inputs)
        }
        _ => None,
    };

    let Some(entries) = entries else {
        // Scalar form: the string itself is the single entry.
        return vec![Worker {
            input: input.to_string(),
            kind: task_kind,
            name: "worker-0".to_string(),
            expect: task_expect.map(str::to_string),
        }];
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(i, raw)| match raw {
            RawEntry::Text(text) => Worker {
                input: text,
                kind: task_kind,
                name: format!("worker-{i}"),
                expect: task_expect.map(str::to_string),
            },
            RawEntry::Entry(entry) => Worker {
                input: entry.input,
                kind: entry.kind.unwrap_or(task_kind),
                name: entry.name.unwrap_or_else(|| format!("worker-{i}")),
                expect: entry
                    .expect
                    .or_else(|| task_expect.map(str::to_string)),
            },
        })
        .collect()
}

/// Aggregate view over a batch run. Result slots are positional; a slot
/// left `None` belonged to a worker cancelled by fail-fast.
#[derive(Debug)]
pub struct BatchResult {
    pub slots: Vec<Option<ExecOutcome>>,
    pub success: bool,
    /// First (by position) worker error, used as the task error message.
    pub first_error: Option<String>,
    /// HTTP status of the exchange when the batch was a single HTTP call.
    pub http_status: Option<u16>,
}

impl BatchResult {
    /// Positional join of per-worker outputs with failed workers prefixed
    /// `Error: `; cancelled slots render as empty strings.
    pub fn aggregate_output(&self) -> String {
        let rendered: Vec<String> = self.slots.iter().map(render_slot).collect();
        rendered.join(OUTPUT_SEPARATOR)
    }
}

fn render_slot(slot: &Option<ExecOutcome>) -> String {
    match slot {
        None => String::new(),
        Some(outcome) => match &outcome.error {
            None => outcome.output.clone(),
            Some(message) if outcome.output.is_empty() => format!("Error: {message}"),
            Some(message) => format!("Error: {message}\n{}", outcome.output),
        },
    }
}

/// Run one worker to completion and apply its expectation. A non-empty
/// expectation decides success for every completed exchange, so a non-2xx
/// status can be accepted and a 2xx rejected.
async fn execute_worker(
    worker: &Worker,
    client: &reqwest::Client,
    env: &BTreeMap<String, String>,
    deadline: Duration,
) -> ExecOutcome {
    let mut outcome = match worker.kind {
        TaskType::Shell => run_shell(&worker.input, env, deadline).await,
        TaskType::HttpGet => run_http(client, false, &worker.input, deadline).await,
        TaskType::HttpPost => run_http(client, true, &worker.input, deadline).await,
    };

    if let Some(expected) = worker.expect.as_deref().filter(|e| !e.trim().is_empty()) {
        if outcome.completed {
            let content = match outcome.http_status {
                Some(status) => expect::http_content(status, &outcome.output),
                None => outcome.output.clone(),
            };
            if expect::validate(expected, &content) {
                outcome.error = None;
            } else if outcome.error.is_none() {
                outcome.error = Some(format!("expected pattern not found: {expected}"));
            }
        }
    }

    debug!(
        worker = %worker.name,
        ok = !outcome.is_err(),
        "worker finished"
    );
    outcome
}

/// Drive the worker list. Sequential mode runs in order and, with
/// fail-fast, stops at the first error. Parallel mode launches every
/// worker concurrently; fail-fast cancels the shared token so still
/// running workers abort, while completed results are retained by
/// position.
pub async fn run_workers(
    workers: &[Worker],
    mode: ExecutionMode,
    fail_fast: bool,
    env: &BTreeMap<String, String>,
    deadline: Duration,
) -> BatchResult {
    let client = reqwest::Client::new();
    let mut slots: Vec<Option<ExecOutcome>> = Vec::with_capacity(workers.len());
    slots.resize_with(workers.len(), || None);

    match mode {
        ExecutionMode::Sequential => {
            for (i, worker) in workers.iter().enumerate() {
                let outcome = execute_worker(worker, &client, env, deadline).await;
                let failed = outcome.is_err();
                slots[i] = Some(outcome);
                if failed && fail_fast {
                    break;
                }
            }
        }
        ExecutionMode::Parallel => {
            let token = CancellationToken::new();
            let worker_futures: Vec<_> = workers
                .iter()
                .enumerate()
                .map(|(i, worker)| {
                    let token = token.clone();
                    let client = client.clone();
                    async move {
                        tokio::select! {
                            () = token.cancelled() => (i, None),
                            outcome = execute_worker(worker, &client, env, deadline) => {
                                if outcome.is_err() && fail_fast {
                                    token.cancel();
                                }
                                (i, Some(outcome))
                            }
                        }
                    }
                })
                .collect();
            for (i, outcome) in futures::future::join_all(worker_futures).await {
                slots[i] = outcome;
            }
        }
    }

    let first_error = slots
        .iter()
        .flatten()
        .find_map(|outcome| outcome.error.clone());
    let success = slots
        .iter()
        .flatten()
        .all(|outcome| !outcome.is_err())
        && first_error.is_none();
    let http_status = match slots.as_slice() {
        [Some(only)] => only.http_status,
        _ => None,
    };

    BatchResult {
        slots,
        success,
        first_error,
        http_status,
    }
}

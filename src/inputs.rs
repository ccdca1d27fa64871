//! Result passing between tasks: resolve declared input sources against
//! completed predecessors, extract fields (optionally through a minimal
//! JSON path), and render `${VAR}` templates and environment bindings.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use kube::Api;
use regex::Regex;
use snafu::prelude::*;
use tracing::debug;

use crate::crd::{SourceField, Task, TaskInputSource};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Predecessor does not exist and the source declared no default.
    #[snafu(display("source task '{name}' not found"))]
    SourceMissing { name: String },

    /// Predecessor exists but has not reached a terminal phase.
    #[snafu(display("source task '{name}' has not completed"))]
    SourceNotReady { name: String },

    #[snafu(display("json path '{path}' did not resolve against output of '{name}'"))]
    PathUnresolved { name: String, path: String },

    #[snafu(display("api error: {source}"))]
    Api { source: kube::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the reconciler should requeue and try again later instead
    /// of failing the task.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SourceMissing { .. } | Error::SourceNotReady { .. })
    }
}

/// Values pulled from predecessors, keyed by source name. The same
/// bindings feed the shell environment and the input template.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    pub bindings: BTreeMap<String, String>,
}

impl ResolvedInputs {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Resolve every source against the live cluster. Sources referencing a
/// missing predecessor fall back to their default; a missing or
/// non-terminal predecessor without a default surfaces a retryable error.
pub async fn resolve(api: &Api<Task>, sources: &[TaskInputSource]) -> Result<ResolvedInputs> {
    let mut resolved = ResolvedInputs::default();
    for source in sources {
        let value = resolve_source(api, source).await?;
        debug!(
            name = %source.name,
            task = %source.task_ref,
            value = %loggable(&value),
            "resolved input source"
        );
        resolved.bindings.insert(source.name.clone(), value);
    }
    Ok(resolved)
}

async fn resolve_source(api: &Api<Task>, source: &TaskInputSource) -> Result<String> {
    let task = api.get_opt(&source.task_ref).await.context(ApiSnafu)?;
    let Some(task) = task else {
        return match &source.default {
            Some(default) => Ok(default.clone()),
            None => SourceMissingSnafu {
                name: source.task_ref.clone(),
            }
            .fail(),
        };
    };

    ensure!(
        task.is_terminal(),
        SourceNotReadySnafu {
            name: source.task_ref.clone(),
        }
    );

    let raw = extract_field(&task, source.field);

    if source.field == SourceField::Output {
        if let Some(path) = source.json_path.as_deref().filter(|p| !p.is_empty()) {
            return match resolve_json_path(&raw, path) {
                Some(value) => Ok(value),
                None => match &source.default {
                    Some(default) => Ok(default.clone()),
                    None => PathUnresolvedSnafu {
                        name: source.task_ref.clone(),
                        path: path.to_string(),
                    }
                    .fail(),
                },
            };
        }
    }

    Ok(raw)
}

/// Extract one status field as a string; `All` emits a composite JSON
/// document of the whole status.
pub fn extract_field(task: &Task, field: SourceField) -> String {
    let status = task.status.as_ref();
    let result = status.and_then(|s| s.result.as_ref());
    match field {
        SourceField::Phase => status
            .and_then(|s| s.phase)
            .map(|p| p.as_str().to_string())
            .unwrap_or_default(),
        SourceField::Output => result
            .and_then(|r| r.output.clone())
            .unwrap_or_default(),
        SourceField::ErrorCode => result.map(|r| r.error_code.clone()).unwrap_or_default(),
        SourceField::ErrorMessage => result
            .and_then(|r| r.error_message.clone())
            .unwrap_or_default(),
        SourceField::StartTime => status
            .and_then(|s| s.start_time)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        SourceField::CompletionTime => status
            .and_then(|s| s.completion_time)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        SourceField::All => serde_json::json!({
            "phase": extract_field(task, SourceField::Phase),
            "output": extract_field(task, SourceField::Output),
            "errorCode": extract_field(task, SourceField::ErrorCode),
            "errorMessage": extract_field(task, SourceField::ErrorMessage),
            "startTime": extract_field(task, SourceField::StartTime),
            "completionTime": extract_field(task, SourceField::CompletionTime),
        })
        .to_string(),
    }
}

static PATH_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_-]+)(?:\[(\d+)\])?$").unwrap()
});

/// Minimal dotted-path resolution over output-as-JSON: `$` yields the
/// whole document, `$.a.b` and `$.items[0].name` navigate objects and
/// arrays. Anything unresolvable yields `None`.
pub fn resolve_json_path(document: &str, path: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(document).ok()?;
    if path == "$" {
        return Some(value.to_string());
    }
    let rest = path.strip_prefix("$.")?;

    let mut current = &value;
    for segment in rest.split('.') {
        let captures = PATH_SEGMENT.captures(segment)?;
        let key = captures.get(1)?.as_str();
        current = current.get(key)?;
        if let Some(index) = captures.get(2) {
            let index: usize = index.as_str().parse().ok()?;
            current = current.get(index)?;
        }
    }

    Some(match current {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

static TEMPLATE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
});

/// Substitute every `${NAME}` with its binding; placeholders without a
/// binding are left literally in place.
pub fn render_template(template: &str, bindings: &BTreeMap<String, String>) -> String {
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            bindings
                .get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// How much of an injected value is logged.
const LOG_VALUE_LIMIT: usize = 120;

static CREDENTIAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(password|passwd|secret|token|api[_-]?key|authorization)\s*[=:]\s*\S+")
        .unwrap()
});

/// Truncate and mask a value before logging so injected secrets are not
/// leaked wholesale.
pub fn loggable(value: &str) -> String {
    let masked = CREDENTIAL_PATTERN.replace_all(value, "$1=****");
    let mut out: String = masked.chars().take(LOG_VALUE_LIMIT).collect();
    if masked.chars().count() > LOG_VALUE_LIMIT {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{TaskPhase, TaskResult, TaskSpec, TaskStatus, TaskType};

    fn completed_task(output: &str) -> Task {
        let spec = TaskSpec {
            task_type: TaskType::Shell,
            input: "echo".into(),
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
        let mut task = Task::new("pred", spec);
        task.status = Some(TaskStatus {
            phase: Some(TaskPhase::Succeeded),
            start_time: None,
            completion_time: None,
            result: Some(TaskResult {
                output: Some(output.to_string()),
                error_code: "0".into(),
                error_message: None,
                http_status_code: None,
            }),
        });
        task
    }

    #[test]
    fn extracts_simple_fields() {
        let task = completed_task("hello");
        assert_eq!(extract_field(&task, SourceField::Phase), "Succeeded");
        assert_eq!(extract_field(&task, SourceField::Output), "hello");
        assert_eq!(extract_field(&task, SourceField::ErrorCode), "0");
        assert_eq!(extract_field(&task, SourceField::ErrorMessage), "");
    }

    #[test]
    fn all_field_is_a_composite_document() {
        let task = completed_task("hello");
        let composite = extract_field(&task, SourceField::All);
        let value: serde_json::Value = serde_json::from_str(&composite).unwrap();
        assert_eq!(value["phase"], "Succeeded");
        assert_eq!(value["output"], "hello");
        assert_eq!(value["errorCode"], "0");
    }

    #[test]
    fn json_path_navigates_objects_and_arrays() {
        let doc = r#"{"data":{"status":"ok","count":42},"items":[{"name":"a"},{"name":"b"}]}"#;
        assert_eq!(resolve_json_path(doc, "$.data.status").as_deref(), Some("ok"));
        assert_eq!(resolve_json_path(doc, "$.data.count").as_deref(), Some("42"));
        assert_eq!(resolve_json_path(doc, "$.items[1].name").as_deref(), Some("b"));
        assert_eq!(resolve_json_path(doc, "$.data.missing"), None);
    }

    #[test]
    fn json_path_dollar_round_trips_the_document() {
        let doc = r#"{"a":1}"#;
        let round_tripped = resolve_json_path(doc, "$").unwrap();
        let left: serde_json::Value = serde_json::from_str(doc).unwrap();
        let right: serde_json::Value = serde_json::from_str(&round_tripped).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn json_path_fails_on_non_json_output() {
        assert_eq!(resolve_json_path("plain text", "$.a"), None);
    }

    #[test]
    fn template_substitutes_known_bindings() {
        let mut bindings = BTreeMap::new();
        bindings.insert("A".to_string(), "x".to_string());
        bindings.insert("B".to_string(), "y".to_string());
        assert_eq!(render_template("${A} ${B}", &bindings), "x y");
    }

    #[test]
    fn template_leaves_unknown_placeholders_literal() {
        let bindings = BTreeMap::new();
        assert_eq!(render_template("echo ${MISSING}", &bindings), "echo ${MISSING}");
    }

    #[test]
    fn loggable_truncates_long_values() {
        let long = "x".repeat(500);
        let logged = loggable(&long);
        assert!(logged.len() < 200);
        assert!(logged.ends_with("..."));
    }

    #[test]
    fn loggable_masks_credentials() {
        let logged = loggable("password=hunter2 other=fine");
        assert!(!logged.contains("hunter2"));
        assert!(logged.contains("other=fine"));
    }
}

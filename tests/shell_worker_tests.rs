#![allow(clippy::unwrap_used)]

//! Shell execution and worker fan-out, exercised against a real shell.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use magpie::crd::{ExecutionMode, TaskType};
use magpie::providers::executors::run_shell;
use magpie::workers::{Worker, parse_descriptor, run_workers};

fn no_env() -> BTreeMap<String, String> {
    BTreeMap::new()
}

#[tokio::test]
async fn echo_captures_stdout() {
    let outcome = run_shell("echo 'hi'", &no_env(), Duration::from_secs(5)).await;
    assert!(outcome.error.is_none());
    assert!(outcome.completed);
    assert!(outcome.output.contains("hi"));
}

#[tokio::test]
async fn pipes_and_redirection_go_through_a_real_shell() {
    let outcome = run_shell(
        "printf 'a\\nb\\nc\\n' | wc -l",
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(outcome.error.is_none());
    assert!(outcome.output.contains('3'));
}

#[tokio::test]
async fn stderr_is_combined_with_stdout() {
    let outcome = run_shell(
        "echo out; echo err 1>&2",
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(outcome.error.is_none());
    assert!(outcome.output.contains("out"));
    assert!(outcome.output.contains("err"));
}

#[tokio::test]
async fn non_zero_exit_reports_the_code() {
    let outcome = run_shell("exit 3", &no_env(), Duration::from_secs(5)).await;
    let message = outcome.error.unwrap();
    assert!(message.contains("exit"));
    assert!(message.contains('3'));
    assert!(!outcome.timed_out);
}

#[tokio::test]
async fn deadline_aborts_with_timeout() {
    let started = Instant::now();
    let outcome = run_shell("sleep 10", &no_env(), Duration::from_secs(1)).await;
    assert!(outcome.timed_out);
    assert_eq!(outcome.error.as_deref(), Some("timeout"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn environment_is_exposed_to_the_shell() {
    let mut env = BTreeMap::new();
    env.insert("GREETING".to_string(), "bonjour".to_string());
    let outcome = run_shell("echo $GREETING", &env, Duration::from_secs(5)).await;
    assert!(outcome.output.contains("bonjour"));
}

fn shell_worker(input: &str) -> Worker {
    Worker {
        input: input.to_string(),
        kind: TaskType::Shell,
        name: "w".to_string(),
        expect: None,
    }
}

#[tokio::test]
async fn sequential_outputs_keep_spec_order() {
    let workers: Vec<Worker> = ["echo 1", "echo 2", "echo 3"]
        .iter()
        .map(|i| shell_worker(i))
        .collect();
    let result = run_workers(
        &workers,
        ExecutionMode::Sequential,
        false,
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(result.success);
    assert_eq!(result.aggregate_output(), "1\n\n---\n2\n\n---\n3\n");
}

#[tokio::test]
async fn parallel_outputs_match_sequential_order() {
    // Later entries finish first, results must still land by position.
    let workers: Vec<Worker> = [
        "sleep 0.3 && echo first",
        "sleep 0.1 && echo second",
        "echo third",
    ]
    .iter()
    .map(|i| shell_worker(i))
    .collect();
    let result = run_workers(
        &workers,
        ExecutionMode::Parallel,
        false,
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(result.success);
    let output = result.aggregate_output();
    let first = output.find("first").unwrap();
    let second = output.find("second").unwrap();
    let third = output.find("third").unwrap();
    assert!(first < second && second < third);
}

#[tokio::test]
async fn sequential_fail_fast_stops_at_first_error() {
    let workers: Vec<Worker> = ["echo 1", "exit 1", "echo 3"]
        .iter()
        .map(|i| shell_worker(i))
        .collect();
    let result = run_workers(
        &workers,
        ExecutionMode::Sequential,
        true,
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(!result.success);
    assert!(result.slots[0].is_some());
    assert!(result.slots[1].is_some());
    // Never ran.
    assert!(result.slots[2].is_none());
}

#[tokio::test]
async fn sequential_without_fail_fast_runs_everything() {
    let workers: Vec<Worker> = ["echo 1", "exit 1", "echo 3"]
        .iter()
        .map(|i| shell_worker(i))
        .collect();
    let result = run_workers(
        &workers,
        ExecutionMode::Sequential,
        false,
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(!result.success);
    let output = result.aggregate_output();
    assert!(output.contains("1\n"));
    assert!(output.contains("Error:"));
    assert!(output.contains("3\n"));
}

#[tokio::test]
async fn parallel_fail_fast_cancels_stragglers() {
    let workers: Vec<Worker> = [
        "echo 1",
        "nonexistent-command-zz",
        "sleep 3 && echo 3",
        "sleep 3 && echo 4",
    ]
    .iter()
    .map(|i| shell_worker(i))
    .collect();
    let started = Instant::now();
    let result = run_workers(
        &workers,
        ExecutionMode::Parallel,
        true,
        &no_env(),
        Duration::from_secs(10),
    )
    .await;
    assert!(!result.success);
    let output = result.aggregate_output();
    assert!(output.contains("Error:"));
    // The sleepers were cancelled rather than awaited.
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn expectation_decides_success_for_completed_commands() {
    let mut worker = shell_worker("echo hello");
    worker.expect = Some("goodbye".to_string());
    let result = run_workers(
        std::slice::from_ref(&worker),
        ExecutionMode::Sequential,
        false,
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(!result.success);
    assert!(result.first_error.unwrap().contains("goodbye"));

    // A matching pattern rescues a non-zero exit.
    let mut worker = shell_worker("echo oops; exit 3");
    worker.expect = Some("oops".to_string());
    let result = run_workers(
        std::slice::from_ref(&worker),
        ExecutionMode::Sequential,
        false,
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(result.success);
}

#[tokio::test]
async fn batch_descriptor_runs_every_entry() {
    let descriptor = r#"[
        {"input": "echo alpha", "name": "alpha"},
        {"input": "echo beta", "name": "beta", "expect": "beta"}
    ]"#;
    let workers = parse_descriptor(descriptor, TaskType::Shell, None);
    let result = run_workers(
        &workers,
        ExecutionMode::Sequential,
        false,
        &no_env(),
        Duration::from_secs(5),
    )
    .await;
    assert!(result.success);
    let output = result.aggregate_output();
    assert!(output.contains("alpha"));
    assert!(output.contains("beta"));
}

//! # Magpie - Cluster-Native Task and Workflow Orchestrator
//!
//! Magpie executes two primitive units of work - shell commands and HTTP(S)
//! requests - and composes them into directed acyclic graphs with
//! conditional edges and inter-task data flow, all expressed as Kubernetes
//! custom resources.
//!
//! ## Features
//!
//! - **Two resource kinds**: [`crd::Task`] runs one shell command or HTTP
//!   call (optionally fanned out over a batched input descriptor);
//!   [`crd::Workflow`] schedules a DAG of task-template references and
//!   materialises them into concrete per-run child tasks
//! - **Conditional execution**: tasks skip or run based on a predecessor's
//!   terminal phase and field predicates
//! - **Result passing**: declared input sources pull fields (including
//!   JSON-path extraction) out of completed predecessors into `${VAR}`
//!   templates and environment bindings
//! - **Cron scheduling**: 5-field cron gating with per-workflow last-run
//!   tracking
//! - **Live DAG snapshots**: per-run node/edge views with layered layout
//!   and bounded run history, published in the workflow status for UI
//!   consumption
//! - **Pluggable execution log**: per-execution records written through a
//!   single sink interface to PostgreSQL, MySQL, or Elasticsearch
//!
//! ## Core Modules
//!
//! - [`controllers`] - the Task and Workflow reconcilers
//! - [`workers`] - batch descriptor parsing and sequential/parallel fan-out
//! - [`inputs`] - the result-passing engine
//! - [`conditions`] - the condition evaluator
//! - [`cron`] - the schedule gate
//! - [`dag`] - DAG snapshot construction
//! - [`sink`] - the execution log sink contract
//!
//! ## Configuration
//!
//! Magpie can be configured via:
//! - Configuration file (`magpie.yaml`)
//! - Environment variables (prefix: `MAGPIE__`)
//! - Flat process variables (`RECONCILE_INTERVAL`, `TASK_TIMEOUT`,
//!   `LOGGING_*`)
//!
//! See [`config::MagpieConfig`] for available options.

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod cron;
pub mod dag;
pub mod expect;
pub mod graph;
pub mod inputs;
pub mod leader;
pub mod providers;
pub mod sink;
pub mod workers;

use clap::Parser;
use snafu::prelude::*;
use tracing::{error, info};

use magpie::config::MagpieConfig;
use magpie::controllers;
use magpie::leader;
use magpie::sink;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: config::ConfigError },

    #[snafu(display("Kubernetes client error: {source}"))]
    Client { source: kube::Error },

    #[snafu(display("Sink error: {source}"))]
    Sink { source: magpie::sink::Error },

    #[snafu(display("Leader election error: {source}"))]
    Leader { source: magpie::leader::Error },
}

#[derive(Parser, Debug)]
#[command(name = "magpie")]
#[command(version)]
#[command(about = "A cluster-native task and workflow orchestrator for Kubernetes", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    /// Namespace holding the leader-election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Run without taking the leadership lease (single-instance dev mode)
    #[arg(long)]
    skip_leader_election: bool,
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Load configuration from file, env vars, and defaults
    let config = MagpieConfig::load().context(ConfigSnafu)?;
    info!(
        reconcile_interval = config.reconcile_interval,
        task_timeout = config.task_timeout,
        "loaded configuration"
    );

    let client = kube::Client::try_default().await.context(ClientSnafu)?;
    let execution_sink = sink::from_config(&config.logging).context(SinkSnafu)?;

    // Only one instance acts at a time; followers block here until the
    // lease frees up.
    let leadership = if cli.skip_leader_election {
        None
    } else {
        Some(
            leader::acquire(client.clone(), &cli.namespace, "magpie-controller")
                .await
                .context(LeaderSnafu)?,
        )
    };

    let task_controller = controllers::task::run(client.clone(), config.clone(), execution_sink);
    let workflow_controller = controllers::workflow::run(client, config);

    match leadership {
        Some(leadership) => {
            tokio::select! {
                () = task_controller => {}
                () = workflow_controller => {}
                lost = leadership.hold() => {
                    // Stop acting immediately so the new leader cannot race us.
                    error!(error = %lost, "exiting after losing leadership");
                    std::process::exit(1);
                }
            }
        }
        None => {
            tokio::join!(task_controller, workflow_controller);
        }
    }

    Ok(())
}

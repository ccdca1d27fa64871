use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tracing::debug;

use super::ExecOutcome;

/// Execute `input` through a real shell so redirection, pipes,
/// substitutions, and multi-command sequences work. Stdout and stderr are
/// captured and combined; exceeding the deadline aborts the child and
/// reports a timeout distinguishable from a non-zero exit.
pub async fn run_shell(
    input: &str,
    env: &BTreeMap<String, String>,
    deadline: Duration,
) -> ExecOutcome {
    debug!(command = %input, timeout_secs = deadline.as_secs(), "executing shell command");

    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    match tokio::time::timeout(deadline, command.output()).await {
        Ok(Ok(out)) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&stderr);
            }
            if out.status.success() {
                ExecOutcome::succeeded(text)
            } else {
                let code = out.status.code().unwrap_or(-1);
                ExecOutcome::failed(text, format!("command exited with code {code}"))
            }
        }
        Ok(Err(e)) => ExecOutcome::aborted(format!("failed to launch shell: {e}")),
        // The dropped future kills the child via kill_on_drop.
        Err(_) => ExecOutcome::timeout(),
    }
}

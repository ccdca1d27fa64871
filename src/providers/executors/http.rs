use std::time::Duration;

use tracing::debug;

use super::{ExecOutcome, USER_AGENT};

/// Perform a GET or POST against `url`, reading the body to completion.
/// Any response with a status outside `[200, 300)` is an execution
/// failure whose message is prefixed `HTTP {code}`; the raw body is
/// preserved as output for diagnosis and the numeric status is surfaced
/// separately for expectation validation.
pub async fn run_http(
    client: &reqwest::Client,
    post: bool,
    url: &str,
    deadline: Duration,
) -> ExecOutcome {
    debug!(method = if post { "POST" } else { "GET" }, url = %url, "executing http request");

    let request = if post { client.post(url) } else { client.get(url) };
    let response = request
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .timeout(deadline)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return ExecOutcome::timeout(),
        Err(e) => return ExecOutcome::aborted(format!("request failed: {e}")),
    };

    let status = response.status();
    let body = match response.text().await {
        Ok(b) => b,
        Err(e) if e.is_timeout() => return ExecOutcome::timeout(),
        Err(e) => return ExecOutcome::aborted(format!("failed to read response body: {e}")),
    };

    let mut outcome = if status.is_success() {
        ExecOutcome::succeeded(body)
    } else {
        let reason = status.canonical_reason().unwrap_or("");
        ExecOutcome::failed(
            body,
            format!("HTTP {} {}", status.as_u16(), reason).trim_end().to_string(),
        )
    };
    outcome.http_status = Some(status.as_u16());
    outcome
}

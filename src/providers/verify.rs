//! Post-deploy health polling shared by the hosting adapters.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::providers::http::HttpApi;

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_expect_status() -> u16 {
    200
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_max_polls() -> u32 {
    24
}

fn default_check_root() -> bool {
    true
}

/// `verify` block of a `trigger_deploy` step.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifySpec {
    /// Base URL to check; defaults to the URL the deploy reported.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Also require the main page to answer.
    #[serde(default = "default_check_root")]
    pub check_root: bool,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl VerifySpec {
    fn targets(&self, base: &str) -> Vec<String> {
        let base = base.trim_end_matches('/');
        let mut targets = vec![format!("{base}/{}", self.health_path.trim_start_matches('/'))];
        if self.check_root {
            targets.push(format!("{base}/"));
        }
        targets
    }
}

/// Statuses a deployment answers with while it is still rolling out.
fn still_starting(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::NOT_FOUND | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
}

/// Polls the deployment until every target answers `expect_status`.
///
/// A status outside the rollout set fails at once. Running out of polls returns
/// the last observation: 5xx and transport errors stay transient. The executor's
/// step deadline bounds the whole loop.
pub async fn verify_deployment(
    api: &HttpApi,
    spec: &VerifySpec,
    deployed_url: Option<&str>,
) -> Result<Value, ProviderError> {
    let base = spec
        .url
        .as_deref()
        .or(deployed_url)
        .ok_or_else(|| ProviderError::permanent("verify needs a url but the deploy reported none"))?;
    let expected = StatusCode::from_u16(spec.expect_status).map_err(|_| {
        ProviderError::permanent(format!("invalid expect_status {}", spec.expect_status))
    })?;
    let targets = spec.targets(base);
    let polls = spec.max_polls.max(1);
    let interval = Duration::from_millis(spec.interval_ms);

    let mut last_error = None;
    for poll in 1..=polls {
        match check_all(api, &targets, expected).await {
            Ok(()) => {
                info!(url = base, polls = poll, "deployment is healthy");
                return Ok(json!({
                    "url": base,
                    "healthy": true,
                    "checked": targets,
                    "polls": poll,
                }));
            }
            Err(Observation::Fatal(err)) => return Err(err),
            Err(Observation::NotYet(err)) => {
                debug!(url = base, poll, error = %err, "deployment not healthy yet");
                last_error = Some(err);
            }
        }
        if poll < polls {
            sleep(interval).await;
        }
    }
    Err(last_error.unwrap_or_else(|| ProviderError::permanent("deployment was never checked")))
}

enum Observation {
    NotYet(ProviderError),
    Fatal(ProviderError),
}

async fn check_all(api: &HttpApi, targets: &[String], expected: StatusCode) -> Result<(), Observation> {
    for target in targets {
        let status = match api.fetch_status(target).await {
            Ok(status) => status,
            Err(err @ ProviderError::TransientNetwork(_)) => return Err(Observation::NotYet(err)),
            Err(err) => return Err(Observation::Fatal(err)),
        };
        if status == expected {
            continue;
        }
        let message = format!(
            "{target} answered HTTP {}, expected {}",
            status.as_u16(),
            expected.as_u16()
        );
        let err = if status.is_server_error()
            || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS)
        {
            ProviderError::TransientNetwork(message)
        } else {
            ProviderError::PermanentApi {
                status: Some(status.as_u16()),
                message,
            }
        };
        return Err(if still_starting(status) {
            Observation::NotYet(err)
        } else {
            Observation::Fatal(err)
        });
    }
    Ok(())
}

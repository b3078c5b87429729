//! In-process adapter used for dry runs and tests.
//!
//! Behaviour is driven by an optional `simulate` object in the step inputs:
//!
//! ```yaml
//! inputs:
//!   simulate:
//!     fail: rate_limit      # auth | rate_limit | transient | permanent
//!     times: 2              # fail only the first N calls (omit to always fail)
//!     delay_ms: 50          # latency per call
//!     retry_after_ms: 1000  # hint attached to rate_limit failures
//!     output: { url: "https://demo.example.com" }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::credentials::Credential;
use crate::error::ProviderError;
use crate::plan::Capability;
use crate::providers::{ProviderAdapter, ProviderOutcome, ProviderResult, parse_inputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedFailure {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Default, Deserialize)]
struct Simulation {
    #[serde(default)]
    fail: Option<SimulatedFailure>,
    #[serde(default)]
    times: Option<usize>,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    retry_after_ms: Option<u64>,
    #[serde(default)]
    output: Option<Value>,
    /// Counter key; defaults to the capability so repeated attempts share it.
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SimulatedInputs {
    #[serde(default)]
    simulate: Option<Simulation>,
}

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedCall {
    pub capability: Capability,
    pub inputs: Value,
    pub scope: String,
}

pub struct SimulatedAdapter {
    provider_id: String,
    capabilities: Vec<Capability>,
    attempts: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<SimulatedCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedAdapter {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self::with_capabilities(provider_id, &Capability::ALL)
    }

    pub fn with_capabilities(provider_id: impl Into<String>, capabilities: &[Capability]) -> Self {
        Self {
            provider_id: provider_id.into(),
            capabilities: capabilities.to_vec(),
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<SimulatedCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    /// Highest number of concurrent `execute` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, capability: Capability, inputs: &Value, credential: &Credential) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(SimulatedCall {
                capability,
                inputs: inputs.clone(),
                scope: credential.scope.clone(),
            });
        }
    }

    fn next_attempt(&self, key: &str) -> usize {
        let Ok(mut attempts) = self.attempts.lock() else {
            return 1;
        };
        let counter = attempts.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn default_output(&self, capability: Capability, inputs: &Value) -> Value {
        let name = inputs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("app");
        match capability {
            Capability::CreateRepository => json!({
                "repo_url": format!("https://{}.example/{name}", self.provider_id),
                "full_name": format!("simulated/{name}"),
            }),
            Capability::PushFiles => json!({ "commit": "0000000" }),
            Capability::SetEnvVars => json!({
                "variables": inputs
                    .get("variables")
                    .and_then(Value::as_object)
                    .map(|vars| vars.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default(),
            }),
            Capability::TriggerDeploy => json!({
                "url": format!("https://{name}.{}.example", self.provider_id),
                "deployment_id": format!("sim-{name}"),
            }),
            Capability::ConfigureDns => {
                let domain = inputs
                    .get("domain")
                    .and_then(Value::as_str)
                    .unwrap_or("example.com");
                json!({ "domain": domain, "url": format!("https://www.{domain}") })
            }
            Capability::SendNotification => json!({ "accepted": true }),
            Capability::RunCi => json!({ "workflow_path": ".github/workflows/deploy.yml" }),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn execute(
        &self,
        capability: Capability,
        inputs: &Value,
        credential: &Credential,
    ) -> ProviderOutcome {
        self.record(capability, inputs, credential);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let parsed: SimulatedInputs = parse_inputs(capability, inputs)?;
        let simulation = parsed.simulate.unwrap_or_default();
        if simulation.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(simulation.delay_ms)).await;
        }

        let key = simulation
            .key
            .clone()
            .unwrap_or_else(|| capability.as_str().to_string());
        let attempt = self.next_attempt(&key);
        debug!(provider = %self.provider_id, %capability, attempt, "simulated call");

        if let Some(failure) = simulation.fail
            && simulation.times.is_none_or(|times| attempt <= times)
        {
            let message = format!("simulated {capability} failure (attempt {attempt})");
            return Err(match failure {
                SimulatedFailure::Auth => ProviderError::Auth(message),
                SimulatedFailure::RateLimit => ProviderError::RateLimit {
                    message,
                    retry_after: simulation.retry_after_ms.map(Duration::from_millis),
                },
                SimulatedFailure::Transient => ProviderError::TransientNetwork(message),
                SimulatedFailure::Permanent => ProviderError::PermanentApi {
                    status: Some(422),
                    message,
                },
            });
        }

        let output = simulation
            .output
            .unwrap_or_else(|| self.default_output(capability, inputs));
        Ok(ProviderResult::new(
            format!("simulated {capability} via {}", self.provider_id),
            output,
        ))
    }
}

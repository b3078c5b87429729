use std::collections::{BTreeMap, HashMap};
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ProviderSettings;
use crate::credentials::Credential;
use crate::error::{OrchestratorError, ProviderError, Result};
use crate::plan::{Capability, Plan};

pub mod email;
pub mod github;
pub mod godaddy;
pub mod http;
pub mod railway;
pub mod render;
pub mod simulated;
pub mod vercel;
pub mod verify;

pub use email::{MailgunAdapter, SendGridAdapter};
pub use github::GithubAdapter;
pub use godaddy::GoDaddyAdapter;
pub use railway::RailwayAdapter;
pub use render::RenderAdapter;
pub use simulated::SimulatedAdapter;
pub use vercel::VercelAdapter;

/// What a provider call produced: a short human summary plus structured output
/// that later steps can reference through `{{steps.<id>.<field>}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub summary: String,
    pub output: Value,
}

impl ProviderResult {
    pub fn new(summary: impl Into<String>, output: Value) -> Self {
        Self {
            summary: summary.into(),
            output,
        }
    }
}

pub type ProviderOutcome = std::result::Result<ProviderResult, ProviderError>;

/// Uniform interface over one external provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Performs one attempt of `capability`. Retrying is the caller's job.
    async fn execute(
        &self,
        capability: Capability,
        inputs: &Value,
        credential: &Credential,
    ) -> ProviderOutcome;
}

/// Adapters keyed by provider id.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A>(&mut self, adapter: A)
    where
        A: ProviderAdapter + 'static,
    {
        self.register_arc(Arc::new(adapter));
    }

    pub fn register_arc(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.provider_id().to_string(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Every step must name a registered provider that supports its capability.
    pub fn validate_plan(&self, plan: &Plan) -> Result<()> {
        for step in plan.steps() {
            let adapter =
                self.adapters
                    .get(&step.provider)
                    .ok_or_else(|| OrchestratorError::UnknownProvider {
                        provider: step.provider.clone(),
                        step: step.id.clone(),
                    })?;
            if !adapter.supports(step.capability) {
                return Err(OrchestratorError::UnsupportedCapability {
                    provider: step.provider.clone(),
                    capability: step.capability.to_string(),
                    step: step.id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Registry of the built-in HTTP adapters.
pub fn default_registry(overrides: &BTreeMap<String, ProviderSettings>) -> Result<AdapterRegistry> {
    default_registry_with_env(overrides, |key| env::var(key).ok())
}

fn default_registry_with_env<F>(
    overrides: &BTreeMap<String, ProviderSettings>,
    get_env: F,
) -> Result<AdapterRegistry>
where
    F: Fn(&str) -> Option<String>,
{
    let api = |provider: &str, default: &str| {
        http::HttpApi::new(resolve_base_url(provider, default, overrides, &get_env))
    };
    let mut registry = AdapterRegistry::new();
    registry.register(GithubAdapter::new(api("github", github::DEFAULT_BASE_URL)?));
    registry.register(RenderAdapter::new(api("render", render::DEFAULT_BASE_URL)?));
    registry.register(RailwayAdapter::new(api("railway", railway::DEFAULT_BASE_URL)?));
    registry.register(VercelAdapter::new(api("vercel", vercel::DEFAULT_BASE_URL)?));
    registry.register(GoDaddyAdapter::new(api("godaddy", godaddy::DEFAULT_BASE_URL)?));
    registry.register(SendGridAdapter::new(api("sendgrid", email::SENDGRID_BASE_URL)?));
    registry.register(MailgunAdapter::new(api("mailgun", email::MAILGUN_BASE_URL)?));
    Ok(registry)
}

/// Simulated adapters for every provider the plan mentions.
pub fn simulated_registry(plan: &Plan) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for provider in plan.providers() {
        registry.register(SimulatedAdapter::new(provider));
    }
    registry
}

/// `DEPLOY_PROVIDER_<ID>_BASE_URL`, then the settings file, then the built-in default.
fn resolve_base_url<F>(
    provider: &str,
    default: &str,
    overrides: &BTreeMap<String, ProviderSettings>,
    get_env: &F,
) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let key = format!("DEPLOY_PROVIDER_{}_BASE_URL", sanitize_key(provider));
    get_env(&key)
        .filter(|value| !value.trim().is_empty())
        .or_else(|| {
            overrides
                .get(provider)
                .and_then(|settings| settings.base_url.clone())
        })
        .unwrap_or_else(|| default.to_string())
}

fn sanitize_key(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Decodes step inputs into an adapter's typed request.
pub(crate) fn parse_inputs<T: DeserializeOwned>(
    capability: Capability,
    inputs: &Value,
) -> std::result::Result<T, ProviderError> {
    T::deserialize(inputs).map_err(|err| {
        ProviderError::permanent(format!("invalid inputs for {capability}: {err}"))
    })
}

pub(crate) fn unsupported(provider: &str, capability: Capability) -> ProviderError {
    ProviderError::permanent(format!("{provider} cannot perform {capability}"))
}

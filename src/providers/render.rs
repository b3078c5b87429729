use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::credentials::Credential;
use crate::error::ProviderError;
use crate::plan::Capability;
use crate::providers::http::{Auth, HttpApi};
use crate::providers::verify::{VerifySpec, verify_deployment};
use crate::providers::{ProviderAdapter, ProviderOutcome, ProviderResult, parse_inputs, unsupported};

pub const DEFAULT_BASE_URL: &str = "https://api.render.com/v1";

const CAPABILITIES: [Capability; 2] = [Capability::TriggerDeploy, Capability::SetEnvVars];

fn default_branch() -> String {
    "main".to_string()
}

fn default_runtime() -> String {
    "python".to_string()
}

#[derive(Debug, Deserialize)]
struct Deploy {
    /// Redeploy an existing service; otherwise a new web service is created.
    #[serde(default)]
    service_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default = "default_runtime")]
    runtime: String,
    #[serde(default)]
    build_command: Option<String>,
    #[serde(default)]
    start_command: Option<String>,
    #[serde(default)]
    env_vars: BTreeMap<String, String>,
    #[serde(default)]
    verify: Option<VerifySpec>,
}

#[derive(Debug, Deserialize)]
struct SetEnv {
    service_id: String,
    variables: BTreeMap<String, String>,
}

pub struct RenderAdapter {
    api: HttpApi,
}

impl RenderAdapter {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    async fn owner_id(&self, auth: &Auth<'_>) -> Result<String, ProviderError> {
        let resp = self
            .api
            .json::<Value>(Method::GET, "owners?limit=1", auth, None)
            .await?;
        resp.body
            .pointer("/0/owner/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::permanent("Render account has no owner"))
    }

    /// Service already registered under `name`, so a retried create redeploys it.
    async fn find_service(&self, name: &str, auth: &Auth<'_>) -> Result<Option<Value>, ProviderError> {
        let resp = self
            .api
            .json::<Value>(Method::GET, &format!("services?name={name}&limit=1"), auth, None)
            .await?;
        Ok(resp
            .body
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.get("service"))
            .find(|service| service.get("name").and_then(Value::as_str) == Some(name))
            .cloned())
    }

    async fn redeploy(&self, service_id: &str, auth: &Auth<'_>) -> ProviderOutcome {
        let body = json!({ "clearCache": "do_not_clear" });
        let resp = self
            .api
            .json(
                Method::POST,
                &format!("services/{service_id}/deploys"),
                auth,
                Some(&body),
            )
            .await?;
        let service = self
            .api
            .json::<Value>(Method::GET, &format!("services/{service_id}"), auth, None)
            .await?;
        info!(service_id, "triggered Render deploy");
        Ok(ProviderResult::new(
            format!("triggered deploy of Render service {service_id}"),
            json!({
                "service_id": service_id,
                "url": service_url(&service.body),
                "deploy_id": resp.body.get("id").cloned().unwrap_or(Value::Null),
            }),
        ))
    }

    async fn deploy(&self, mut req: Deploy, auth: &Auth<'_>) -> ProviderOutcome {
        let verify = req.verify.take();
        let mut result = self.deploy_service(req, auth).await?;
        if let Some(spec) = verify {
            let url = result.output.get("url").and_then(Value::as_str).map(str::to_string);
            result.output["verification"] = verify_deployment(&self.api, &spec, url.as_deref()).await?;
        }
        Ok(result)
    }

    async fn deploy_service(&self, req: Deploy, auth: &Auth<'_>) -> ProviderOutcome {
        if let Some(service_id) = &req.service_id {
            return self.redeploy(service_id, auth).await;
        }
        let (Some(name), Some(repo)) = (req.name, req.repo) else {
            return Err(ProviderError::permanent(
                "Render deploy needs either service_id or name and repo",
            ));
        };
        if let Some(existing) = self.find_service(&name, auth).await?
            && let Some(service_id) = existing.get("id").and_then(Value::as_str)
        {
            info!(service_id, name = %name, "reusing existing Render service");
            return self.redeploy(service_id, auth).await;
        }
        let owner_id = match req.owner_id {
            Some(owner) => owner,
            None => self.owner_id(auth).await?,
        };
        let env_vars: Vec<Value> = req
            .env_vars
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        let body = json!({
            "type": "web_service",
            "name": name,
            "ownerId": owner_id,
            "repo": repo,
            "branch": req.branch,
            "autoDeploy": "yes",
            "envVars": env_vars,
            "serviceDetails": {
                "plan": "free",
                "region": "oregon",
                "runtime": req.runtime,
                "envSpecificDetails": {
                    "buildCommand": req
                        .build_command
                        .unwrap_or_else(|| "pip install -r requirements.txt".to_string()),
                    "startCommand": req
                        .start_command
                        .unwrap_or_else(|| "gunicorn main:app".to_string()),
                }
            }
        });
        let resp = self
            .api
            .json(Method::POST, "services", auth, Some(&body))
            .await?;
        let service = resp.body.get("service").unwrap_or(&resp.body);
        let service_id = service
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::permanent("Render response is missing service id"))?;
        info!(service_id, "created Render service");
        Ok(ProviderResult::new(
            format!("created Render service {name}"),
            json!({
                "service_id": service_id,
                "url": service_url(service),
                "deploy_id": resp.body.get("deployId").cloned().unwrap_or(Value::Null),
            }),
        ))
    }

    async fn set_env(&self, req: SetEnv, auth: &Auth<'_>) -> ProviderOutcome {
        let body: Vec<Value> = req
            .variables
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        self.api
            .json(
                Method::PUT,
                &format!("services/{}/env-vars", req.service_id),
                auth,
                Some(&body),
            )
            .await?;
        Ok(ProviderResult::new(
            format!(
                "set {} env vars on Render service {}",
                req.variables.len(),
                req.service_id
            ),
            json!({
                "service_id": req.service_id,
                "variables": req.variables.keys().collect::<Vec<_>>(),
            }),
        ))
    }
}

fn service_url(service: &Value) -> Value {
    service
        .pointer("/serviceDetails/url")
        .cloned()
        .unwrap_or(Value::Null)
}

#[async_trait]
impl ProviderAdapter for RenderAdapter {
    fn provider_id(&self) -> &str {
        "render"
    }

    fn capabilities(&self) -> &[Capability] {
        &CAPABILITIES
    }

    async fn execute(
        &self,
        capability: Capability,
        inputs: &Value,
        credential: &Credential,
    ) -> ProviderOutcome {
        let auth = Auth::Bearer(credential.secret().expose());
        match capability {
            Capability::TriggerDeploy => self.deploy(parse_inputs(capability, inputs)?, &auth).await,
            Capability::SetEnvVars => self.set_env(parse_inputs(capability, inputs)?, &auth).await,
            other => Err(unsupported("render", other)),
        }
    }
}

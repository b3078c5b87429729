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

pub const DEFAULT_BASE_URL: &str = "https://api.vercel.com";

const CAPABILITIES: [Capability; 2] = [Capability::TriggerDeploy, Capability::SetEnvVars];

fn default_branch() -> String {
    "main".to_string()
}

fn default_targets() -> Vec<String> {
    vec!["production".to_string(), "preview".to_string()]
}

#[derive(Debug, Deserialize)]
struct Deploy {
    name: String,
    /// `owner/name` or a `https://github.com/owner/name(.git)` URL.
    repository: String,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    verify: Option<VerifySpec>,
}

#[derive(Debug, Deserialize)]
struct SetEnv {
    project: String,
    variables: BTreeMap<String, String>,
    #[serde(default = "default_targets")]
    targets: Vec<String>,
    #[serde(default)]
    team_id: Option<String>,
}

pub struct VercelAdapter {
    api: HttpApi,
}

impl VercelAdapter {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    async fn deploy(&self, req: Deploy, auth: &Auth<'_>) -> ProviderOutcome {
        let (org, repo) = split_repository(&req.repository)?;
        let body = json!({
            "name": req.name,
            "target": "production",
            "gitSource": {
                "type": "github",
                "org": org,
                "repo": repo,
                "ref": req.branch,
            },
        });
        let path = with_team("v13/deployments", req.team_id.as_deref());
        let resp = self.api.json(Method::POST, &path, auth, Some(&body)).await?;
        let url = resp
            .body
            .get("url")
            .and_then(Value::as_str)
            .map(|host| format!("https://{host}"));
        info!(project = %req.name, url = url.as_deref().unwrap_or("-"), "Vercel deployment created");
        let mut output = json!({
            "deployment_id": resp.body.get("id").cloned().unwrap_or(Value::Null),
            "url": url,
        });
        if let Some(spec) = &req.verify {
            output["verification"] = verify_deployment(&self.api, spec, url.as_deref()).await?;
        }
        Ok(ProviderResult::new(
            format!("created Vercel deployment for {}", req.name),
            output,
        ))
    }

    async fn set_env(&self, req: SetEnv, auth: &Auth<'_>) -> ProviderOutcome {
        let body: Vec<Value> = req
            .variables
            .iter()
            .map(|(key, value)| {
                json!({
                    "key": key,
                    "value": value,
                    "type": "encrypted",
                    "target": req.targets,
                })
            })
            .collect();
        let path = with_team(
            &format!("v10/projects/{}/env?upsert=true", req.project),
            req.team_id.as_deref(),
        );
        self.api.json(Method::POST, &path, auth, Some(&body)).await?;
        Ok(ProviderResult::new(
            format!(
                "set {} env vars on Vercel project {}",
                req.variables.len(),
                req.project
            ),
            json!({
                "project": req.project,
                "variables": req.variables.keys().collect::<Vec<_>>(),
            }),
        ))
    }
}

fn with_team(path: &str, team_id: Option<&str>) -> String {
    match team_id {
        Some(team) if path.contains('?') => format!("{path}&teamId={team}"),
        Some(team) => format!("{path}?teamId={team}"),
        None => path.to_string(),
    }
}

fn split_repository(repository: &str) -> Result<(String, String), ProviderError> {
    let trimmed = repository
        .trim()
        .trim_start_matches("https://github.com/")
        .trim_end_matches('/')
        .trim_end_matches(".git");
    match trimmed.split_once('/') {
        Some((org, repo)) if !org.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok((org.to_string(), repo.to_string()))
        }
        _ => Err(ProviderError::permanent(format!(
            "repository must look like owner/name, got '{repository}'"
        ))),
    }
}

#[async_trait]
impl ProviderAdapter for VercelAdapter {
    fn provider_id(&self) -> &str {
        "vercel"
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
            other => Err(unsupported("vercel", other)),
        }
    }
}

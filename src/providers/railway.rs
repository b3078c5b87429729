use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::credentials::Credential;
use crate::error::ProviderError;
use crate::plan::Capability;
use crate::providers::http::{Auth, HttpApi};
use crate::providers::verify::{VerifySpec, verify_deployment};
use crate::providers::{ProviderAdapter, ProviderOutcome, ProviderResult, parse_inputs, unsupported};

pub const DEFAULT_BASE_URL: &str = "https://backboard.railway.app/graphql/v2";

const CAPABILITIES: [Capability; 1] = [Capability::TriggerDeploy];

const PROJECTS: &str = "query projects { projects { edges { node { id name \
     environments { edges { node { id name } } } services { edges { node { id name } } } } } } }";
const PROJECT_CREATE: &str = "mutation projectCreate($input: ProjectCreateInput!) { \
     projectCreate(input: $input) { id name \
     environments { edges { node { id name } } } services { edges { node { id name } } } } }";
const SERVICE_CREATE: &str =
    "mutation serviceCreate($input: ServiceCreateInput!) { serviceCreate(input: $input) { id name } }";
const VARIABLE_UPSERT: &str =
    "mutation variableUpsert($input: VariableUpsertInput!) { variableUpsert(input: $input) }";
const DOMAINS: &str = "query domains($projectId: String!, $environmentId: String!, $serviceId: String!) { \
     domains(projectId: $projectId, environmentId: $environmentId, serviceId: $serviceId) { \
     serviceDomains { domain } } }";
const SERVICE_DOMAIN_CREATE: &str = "mutation serviceDomainCreate($input: ServiceDomainCreateInput!) { \
     serviceDomainCreate(input: $input) { domain } }";

/// Environment deployed to when the project has several.
const PRODUCTION: &str = "production";

fn default_branch() -> String {
    "main".to_string()
}

fn default_service() -> String {
    "web".to_string()
}

#[derive(Debug, Deserialize)]
struct Deploy {
    name: String,
    /// `owner/name` of the GitHub repository to build from.
    #[serde(default)]
    repo: Option<String>,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default = "default_service")]
    service: String,
    #[serde(default)]
    env_vars: BTreeMap<String, String>,
    #[serde(default)]
    verify: Option<VerifySpec>,
}

/// Railway GraphQL adapter. Every stage looks up what an earlier attempt may
/// already have created: project by name, service by name, then its domain.
pub struct RailwayAdapter {
    api: HttpApi,
}

impl RailwayAdapter {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    async fn graphql(
        &self,
        query: &str,
        variables: Value,
        auth: &Auth<'_>,
    ) -> Result<Value, ProviderError> {
        let body = json!({ "query": query, "variables": variables });
        let resp = self.api.json(Method::POST, "", auth, Some(&body)).await?;
        if let Some(errors) = resp.body.get("errors").and_then(Value::as_array)
            && let Some(first) = errors.first()
        {
            return Err(graphql_error(first));
        }
        resp.body
            .get("data")
            .cloned()
            .ok_or_else(|| ProviderError::permanent("GraphQL response has no data"))
    }

    async fn mutate(&self, query: &str, input: Value, auth: &Auth<'_>) -> Result<Value, ProviderError> {
        self.graphql(query, json!({ "input": input }), auth).await
    }

    async fn project(&self, name: &str, auth: &Auth<'_>) -> Result<Value, ProviderError> {
        let data = self.graphql(PROJECTS, json!({}), auth).await?;
        if let Some(project) = nodes(&data, "/projects/edges")
            .find(|node| node.get("name").and_then(Value::as_str) == Some(name))
        {
            debug!(project = name, "reusing Railway project");
            return Ok(project.clone());
        }
        let data = self.mutate(PROJECT_CREATE, json!({ "name": name }), auth).await?;
        let project = data
            .get("projectCreate")
            .cloned()
            .ok_or_else(|| ProviderError::permanent("GraphQL response is missing projectCreate"))?;
        info!(project = name, "created Railway project");
        Ok(project)
    }

    async fn service_domain(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
        auth: &Auth<'_>,
    ) -> Result<String, ProviderError> {
        let data = self
            .graphql(
                DOMAINS,
                json!({
                    "projectId": project_id,
                    "environmentId": environment_id,
                    "serviceId": service_id,
                }),
                auth,
            )
            .await?;
        let existing = data
            .pointer("/domains/serviceDomains")
            .and_then(Value::as_array)
            .and_then(|domains| domains.first())
            .and_then(|domain| domain.get("domain"))
            .and_then(Value::as_str);
        if let Some(domain) = existing {
            return Ok(domain.to_string());
        }
        let data = self
            .mutate(
                SERVICE_DOMAIN_CREATE,
                json!({ "serviceId": service_id, "environmentId": environment_id }),
                auth,
            )
            .await?;
        id_at(&data, "/serviceDomainCreate/domain")
    }

    async fn deploy(&self, req: Deploy, auth: &Auth<'_>) -> ProviderOutcome {
        let Some(repo) = &req.repo else {
            return Err(ProviderError::permanent(
                "Railway deploy needs a repo to build the service from",
            ));
        };
        let project = self.project(&req.name, auth).await?;
        let project_id = id_at(&project, "/id")?;
        let environment_id = environment(&project)?;

        let existing = nodes(&project, "/services/edges")
            .find(|node| node.get("name").and_then(Value::as_str) == Some(req.service.as_str()))
            .and_then(|node| node.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let service_id = match existing {
            Some(id) => id,
            None => {
                let data = self
                    .mutate(
                        SERVICE_CREATE,
                        json!({
                            "projectId": project_id,
                            "name": req.service,
                            "source": { "repo": repo },
                            "branch": req.branch,
                        }),
                        auth,
                    )
                    .await?;
                id_at(&data, "/serviceCreate/id")?
            }
        };

        for (name, value) in &req.env_vars {
            self.mutate(
                VARIABLE_UPSERT,
                json!({
                    "projectId": project_id,
                    "environmentId": environment_id,
                    "serviceId": service_id,
                    "name": name,
                    "value": value,
                }),
                auth,
            )
            .await?;
        }

        let domain = self
            .service_domain(&project_id, &environment_id, &service_id, auth)
            .await?;
        let url = format!("https://{domain}");
        info!(%project_id, %service_id, %url, "Railway deployment requested");
        let mut output = json!({
            "project_id": project_id,
            "environment_id": environment_id,
            "service_id": service_id,
            "domain": domain,
            "url": url,
        });
        if let Some(spec) = &req.verify {
            output["verification"] = verify_deployment(&self.api, spec, Some(url.as_str())).await?;
        }
        Ok(ProviderResult::new(
            format!("deployed {} to Railway", req.name),
            output,
        ))
    }
}

/// Nodes of a GraphQL connection at `pointer` (its `edges` array).
fn nodes<'a>(data: &'a Value, pointer: &str) -> impl Iterator<Item = &'a Value> {
    data.pointer(pointer)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|edge| edge.get("node"))
}

fn environment(project: &Value) -> Result<String, ProviderError> {
    let mut environments = nodes(project, "/environments/edges").peekable();
    let first = environments.peek().copied();
    environments
        .find(|node| node.get("name").and_then(Value::as_str) == Some(PRODUCTION))
        .or(first)
        .and_then(|node| node.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::permanent("Railway project has no environment"))
}

fn id_at(data: &Value, pointer: &str) -> Result<String, ProviderError> {
    data.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::permanent(format!("GraphQL response is missing {pointer}")))
}

/// GraphQL reports most failures inside a 200 response.
fn graphql_error(error: &Value) -> ProviderError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown GraphQL error")
        .to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("not authorized") || lowered.contains("unauthenticated") {
        ProviderError::Auth(message)
    } else if lowered.contains("rate limit") {
        ProviderError::RateLimit {
            message,
            retry_after: None,
        }
    } else {
        ProviderError::permanent(message)
    }
}

#[async_trait]
impl ProviderAdapter for RailwayAdapter {
    fn provider_id(&self) -> &str {
        "railway"
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
            other => Err(unsupported("railway", other)),
        }
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use crypto_box::aead::OsRng;
use crypto_box::{KEY_SIZE, PublicKey};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::credentials::Credential;
use crate::error::ProviderError;
use crate::path_safety;
use crate::plan::Capability;
use crate::providers::http::{Auth, HttpApi};
use crate::providers::{ProviderAdapter, ProviderOutcome, ProviderResult, parse_inputs, unsupported};

pub const DEFAULT_BASE_URL: &str = "https://api.github.com";
pub const WORKFLOW_PATH: &str = ".github/workflows/deploy.yml";

const CAPABILITIES: [Capability; 4] = [
    Capability::CreateRepository,
    Capability::PushFiles,
    Capability::SetEnvVars,
    Capability::RunCi,
];

fn default_branch() -> String {
    "main".to_string()
}

fn default_private() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CreateRepository {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_private")]
    private: bool,
    /// Create under an organisation instead of the authenticated user.
    #[serde(default)]
    org: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushFiles {
    repository: String,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default)]
    message: Option<String>,
    /// Inline files keyed by repository path.
    #[serde(default)]
    files: BTreeMap<String, String>,
    /// Local directory whose files are pushed as well.
    #[serde(default)]
    source_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SetVariables {
    repository: String,
    variables: BTreeMap<String, String>,
    /// Store as encrypted Actions secrets; `false` writes plaintext variables.
    #[serde(default = "default_secret")]
    secret: bool,
}

fn default_secret() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SecretsPublicKey {
    key_id: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct RunCi {
    repository: String,
    /// Deployment target the workflow hands off to (railway, vercel, render).
    #[serde(default)]
    platform: Option<String>,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default)]
    service: Option<String>,
    /// Trigger the workflow once committed.
    #[serde(default)]
    dispatch: bool,
}

/// GitHub REST adapter: repositories, contents, Actions variables and workflows.
pub struct GithubAdapter {
    api: HttpApi,
}

impl GithubAdapter {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    async fn create_repository(&self, req: CreateRepository, auth: &Auth<'_>) -> ProviderOutcome {
        let path = match &req.org {
            Some(org) => format!("orgs/{org}/repos"),
            None => "user/repos".to_string(),
        };
        let body = json!({
            "name": &req.name,
            "description": req.description.as_deref().unwrap_or_default(),
            "private": req.private,
            "auto_init": true,
        });
        let (repo, created) = match self.api.json(Method::POST, &path, auth, Some(&body)).await {
            Ok(resp) => (resp.body, true),
            // 422 also covers "name already exists", e.g. when an earlier attempt
            // created the repository but its response was lost.
            Err(err @ ProviderError::PermanentApi {
                status: Some(422), ..
            }) => match self.existing_repository(&req, auth).await? {
                Some(repo) => (repo, false),
                None => return Err(err),
            },
            Err(err) => return Err(err),
        };
        let full_name = field(&repo, "full_name")?;
        if created {
            info!(repository = %full_name, "created GitHub repository");
        } else {
            info!(repository = %full_name, "reusing existing GitHub repository");
        }
        let verb = if created { "created" } else { "reused" };
        Ok(ProviderResult::new(
            format!("{verb} repository {full_name}"),
            json!({
                "full_name": full_name,
                "repo_url": repo.get("html_url").cloned().unwrap_or(Value::Null),
                "clone_url": repo.get("clone_url").cloned().unwrap_or(Value::Null),
                "default_branch": repo
                    .get("default_branch")
                    .cloned()
                    .unwrap_or_else(|| json!("main")),
                "created": created,
            }),
        ))
    }

    async fn existing_repository(
        &self,
        req: &CreateRepository,
        auth: &Auth<'_>,
    ) -> Result<Option<Value>, ProviderError> {
        let owner = match &req.org {
            Some(org) => org.clone(),
            None => {
                let user = self.api.json::<Value>(Method::GET, "user", auth, None).await?;
                field(&user.body, "login")?
            }
        };
        let found = self
            .api
            .get_optional(&format!("repos/{owner}/{}", req.name), auth)
            .await?;
        Ok(found.map(|resp| resp.body))
    }

    async fn push_files(&self, req: PushFiles, auth: &Auth<'_>) -> ProviderOutcome {
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if let Some(dir) = &req.source_dir {
            let collected = path_safety::collect_files(dir)
                .map_err(|err| ProviderError::permanent(format!("{err:#}")))?;
            for (repo_path, absolute) in collected {
                let bytes = fs::read(&absolute).map_err(|err| {
                    ProviderError::permanent(format!("failed to read {}: {err}", absolute.display()))
                })?;
                files.insert(repo_path, bytes);
            }
        }
        for (path, contents) in req.files {
            let repo_path = path_safety::repo_path(&path)
                .map_err(|err| ProviderError::permanent(format!("{err:#}")))?;
            files.insert(repo_path, contents.into_bytes());
        }
        if files.is_empty() {
            return Err(ProviderError::permanent("push_files has nothing to push"));
        }

        let message = req
            .message
            .unwrap_or_else(|| "Deploy application files".to_string());
        let mut digest = Sha256::new();
        let mut commit = Value::Null;
        for (path, contents) in &files {
            digest.update(path.as_bytes());
            digest.update(contents);
            commit = self
                .put_file(&req.repository, &req.branch, path, contents, &message, auth)
                .await?;
        }
        let digest = format!("sha256:{:x}", digest.finalize());
        info!(repository = %req.repository, files = files.len(), %digest, "pushed files");
        Ok(ProviderResult::new(
            format!("pushed {} files to {}", files.len(), req.repository),
            json!({
                "repository": req.repository,
                "branch": req.branch,
                "files": files.keys().collect::<Vec<_>>(),
                "commit": commit,
                "digest": digest,
            }),
        ))
    }

    /// Create or update one file through the contents API; returns the commit sha.
    async fn put_file(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        contents: &[u8],
        message: &str,
        auth: &Auth<'_>,
    ) -> Result<Value, ProviderError> {
        let endpoint = format!("repos/{repository}/contents/{path}");
        let existing = self
            .api
            .get_optional(&format!("{endpoint}?ref={branch}"), auth)
            .await?;
        let mut body = json!({
            "message": message,
            "content": BASE64.encode(contents),
            "branch": branch,
        });
        if let Some(sha) = existing.as_ref().and_then(|resp| resp.body.get("sha")) {
            body["sha"] = sha.clone();
        }
        debug!(repository, path, update = existing.is_some(), "writing file");
        let resp = self.api.json(Method::PUT, &endpoint, auth, Some(&body)).await?;
        Ok(resp
            .body
            .pointer("/commit/sha")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn set_variables(&self, req: SetVariables, auth: &Auth<'_>) -> ProviderOutcome {
        if req.secret {
            return self.set_secrets(req, auth).await;
        }
        let base = format!("repos/{}/actions/variables", req.repository);
        for (name, value) in &req.variables {
            let body = json!({ "name": name, "value": value });
            match self.api.json(Method::POST, &base, auth, Some(&body)).await {
                Ok(_) => {}
                Err(ProviderError::PermanentApi {
                    status: Some(409), ..
                }) => {
                    self.api
                        .json(Method::PATCH, &format!("{base}/{name}"), auth, Some(&body))
                        .await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ProviderResult::new(
            format!(
                "set {} variables on {}",
                req.variables.len(),
                req.repository
            ),
            json!({
                "repository": req.repository,
                "variables": req.variables.keys().collect::<Vec<_>>(),
                "kind": "variable",
            }),
        ))
    }

    /// Seals each value to the repository's Actions public key; the create-or-update
    /// endpoint makes this idempotent.
    async fn set_secrets(&self, req: SetVariables, auth: &Auth<'_>) -> ProviderOutcome {
        let base = format!("repos/{}/actions/secrets", req.repository);
        let resp = self
            .api
            .json::<Value>(Method::GET, &format!("{base}/public-key"), auth, None)
            .await?;
        let public_key: SecretsPublicKey = serde_json::from_value(resp.body)
            .map_err(|err| ProviderError::permanent(format!("invalid secrets public key: {err}")))?;
        let key = sealing_key(&public_key.key)?;
        for (name, value) in &req.variables {
            let body = json!({
                "encrypted_value": seal(&key, value)?,
                "key_id": &public_key.key_id,
            });
            self.api
                .json(Method::PUT, &format!("{base}/{name}"), auth, Some(&body))
                .await?;
            debug!(repository = %req.repository, secret = %name, "stored Actions secret");
        }
        Ok(ProviderResult::new(
            format!(
                "set {} secrets on {}",
                req.variables.len(),
                req.repository
            ),
            json!({
                "repository": req.repository,
                "variables": req.variables.keys().collect::<Vec<_>>(),
                "kind": "secret",
            }),
        ))
    }

    async fn run_ci(&self, req: RunCi, auth: &Auth<'_>) -> ProviderOutcome {
        let workflow = workflow_yaml(req.platform.as_deref(), &req.branch, req.service.as_deref())?;
        let commit = self
            .put_file(
                &req.repository,
                &req.branch,
                WORKFLOW_PATH,
                workflow.as_bytes(),
                "Add deployment workflow",
                auth,
            )
            .await?;
        if req.dispatch {
            let body = json!({ "ref": req.branch });
            self.api
                .json(
                    Method::POST,
                    &format!("repos/{}/actions/workflows/deploy.yml/dispatches", req.repository),
                    auth,
                    Some(&body),
                )
                .await?;
        }
        Ok(ProviderResult::new(
            format!("configured CI workflow on {}", req.repository),
            json!({
                "repository": req.repository,
                "workflow_path": WORKFLOW_PATH,
                "commit": commit,
                "dispatched": req.dispatch,
            }),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for GithubAdapter {
    fn provider_id(&self) -> &str {
        "github"
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
            Capability::CreateRepository => {
                self.create_repository(parse_inputs(capability, inputs)?, &auth)
                    .await
            }
            Capability::PushFiles => self.push_files(parse_inputs(capability, inputs)?, &auth).await,
            Capability::SetEnvVars => {
                self.set_variables(parse_inputs(capability, inputs)?, &auth)
                    .await
            }
            Capability::RunCi => self.run_ci(parse_inputs(capability, inputs)?, &auth).await,
            other => Err(unsupported("github", other)),
        }
    }
}

fn field(value: &Value, key: &str) -> Result<String, ProviderError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::permanent(format!("response is missing '{key}'")))
}

fn sealing_key(encoded: &str) -> Result<PublicKey, ProviderError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|err| ProviderError::permanent(format!("secrets public key is not base64: {err}")))?;
    let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        ProviderError::permanent(format!(
            "secrets public key has {} bytes, expected {KEY_SIZE}",
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

/// libsodium sealed box, base64 encoded, as the Actions secrets API expects.
fn seal(key: &PublicKey, value: &str) -> Result<String, ProviderError> {
    let sealed = key
        .seal(&mut OsRng, value.as_bytes())
        .map_err(|err| ProviderError::permanent(format!("failed to seal secret: {err}")))?;
    Ok(BASE64.encode(sealed))
}

/// GitHub Actions workflow that tests on every push and deploys from `branch`.
pub fn workflow_yaml(
    platform: Option<&str>,
    branch: &str,
    service: Option<&str>,
) -> Result<String, ProviderError> {
    let test_job = json!({
        "runs-on": "ubuntu-latest",
        "steps": [
            { "uses": "actions/checkout@v4" },
            {
                "name": "Set up Python",
                "uses": "actions/setup-python@v5",
                "with": { "python-version": "3.11" }
            },
            { "name": "Install dependencies", "run": "pip install -r requirements.txt" },
            { "name": "Run tests", "run": "python -m pytest tests/ || echo 'No tests found'" }
        ]
    });

    let deploy_step = match platform {
        Some("railway") => Some(json!({
            "name": "Deploy to Railway",
            "run": format!(
                "npm install -g @railway/cli && railway up --service {}",
                service.unwrap_or("web")
            ),
            "env": { "RAILWAY_TOKEN": "${{ secrets.RAILWAY_TOKEN }}" }
        })),
        Some("vercel") => Some(json!({
            "name": "Deploy to Vercel",
            "run": "npx vercel deploy --prod --yes --token \"$VERCEL_TOKEN\"",
            "env": { "VERCEL_TOKEN": "${{ secrets.VERCEL_TOKEN }}" }
        })),
        Some("render") => Some(json!({
            "name": "Trigger Render deploy hook",
            "run": "curl -fsS -X POST \"$RENDER_DEPLOY_HOOK\"",
            "env": { "RENDER_DEPLOY_HOOK": "${{ secrets.RENDER_DEPLOY_HOOK }}" }
        })),
        Some(other) => {
            return Err(ProviderError::permanent(format!(
                "no CI workflow template for platform '{other}'"
            )));
        }
        None => None,
    };

    let mut jobs = serde_json::Map::new();
    jobs.insert("test".into(), test_job);
    let name = match (platform, &deploy_step) {
        (Some(platform), Some(step)) => {
            jobs.insert(
                "deploy".into(),
                json!({
                    "needs": "test",
                    "runs-on": "ubuntu-latest",
                    "if": format!("github.ref == 'refs/heads/{branch}'"),
                    "steps": [ { "uses": "actions/checkout@v4" }, step ]
                }),
            );
            format!("Deploy to {platform}")
        }
        _ => "CI".to_string(),
    };

    let workflow = json!({
        "name": name,
        "on": {
            "push": { "branches": [branch] },
            "pull_request": { "branches": [branch] },
            "workflow_dispatch": {}
        },
        "jobs": jobs,
    });
    serde_yaml_bw::to_string(&workflow)
        .map_err(|err| ProviderError::permanent(format!("failed to render workflow: {err}")))
}

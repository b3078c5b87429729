use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::inputs;
use crate::plan::Plan;

pub const DEFAULT_SCOPE: &str = "default";
pub const ENV_PREFIX: &str = "DEPLOY_CRED_";

/// Secret material; never printed, never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue(<{} bytes redacted>)", self.0.len())
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub provider_id: String,
    pub scope: String,
    secret: SecretValue,
}

impl Credential {
    pub fn new(
        provider_id: impl Into<String>,
        scope: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            scope: scope.into(),
            secret: SecretValue::new(secret),
        }
    }

    pub fn secret(&self) -> &SecretValue {
        &self.secret
    }
}

/// Somewhere credentials can be loaded from at orchestrator start.
pub trait CredentialSource: Send + Sync {
    fn describe(&self) -> String;
    fn load(&self) -> Result<Vec<Credential>>;
}

/// Reads `DEPLOY_CRED_<PROVIDER>` (default scope) and `DEPLOY_CRED_<PROVIDER>__<SCOPE>`.
#[derive(Debug, Clone, Default)]
pub struct EnvSource;

impl EnvSource {
    pub fn load_from<I>(vars: I) -> Vec<Credential>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut found = Vec::new();
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if value.is_empty() || rest.is_empty() {
                continue;
            }
            let (provider, scope) = match rest.split_once("__") {
                Some((provider, scope)) if !scope.is_empty() => (provider, scope),
                Some((provider, _)) => (provider, DEFAULT_SCOPE),
                None => (rest, DEFAULT_SCOPE),
            };
            found.push(Credential::new(
                provider.to_ascii_lowercase(),
                scope.to_ascii_lowercase(),
                value,
            ));
        }
        found
    }
}

impl CredentialSource for EnvSource {
    fn describe(&self) -> String {
        format!("environment ({ENV_PREFIX}*)")
    }

    fn load(&self) -> Result<Vec<Credential>> {
        Ok(Self::load_from(env::vars()))
    }
}

/// Credentials document: `provider -> secret` or `provider -> { scope -> secret }`.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileEntry {
    Single(String),
    Scoped(BTreeMap<String, String>),
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(path: &Path, contents: &str) -> Result<BTreeMap<String, FileEntry>> {
        let unavailable =
            |err: String| OrchestratorError::CredentialStoreUnavailable(format!("{}: {err}", path.display()));
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(contents).map_err(|err| unavailable(err.to_string())),
            Some("toml") => toml::from_str(contents).map_err(|err| unavailable(err.to_string())),
            _ => serde_yaml_bw::from_str(contents).map_err(|err| unavailable(err.to_string())),
        }
    }
}

impl CredentialSource for FileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn load(&self) -> Result<Vec<Credential>> {
        let contents = fs::read_to_string(&self.path).map_err(|err| {
            OrchestratorError::CredentialStoreUnavailable(format!(
                "failed to read {}: {err}",
                self.path.display()
            ))
        })?;
        let mut found = Vec::new();
        for (provider, entry) in Self::parse(&self.path, &contents)? {
            match entry {
                FileEntry::Single(secret) => {
                    found.push(Credential::new(provider, DEFAULT_SCOPE, secret))
                }
                FileEntry::Scoped(scopes) => {
                    for (scope, secret) in scopes {
                        found.push(Credential::new(provider.clone(), scope, secret));
                    }
                }
            }
        }
        Ok(found)
    }
}

/// In-memory, read-only-after-construction store of per-provider secrets.
#[derive(Debug, Default, Clone)]
pub struct CredentialStore {
    entries: HashMap<(String, String), Credential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every source in order; later sources override earlier ones.
    pub fn from_sources(sources: &[Box<dyn CredentialSource>]) -> Result<Self> {
        let mut store = Self::new();
        for source in sources {
            let loaded = source.load()?;
            info!(
                source = %source.describe(),
                count = loaded.len(),
                "loaded credentials"
            );
            for credential in loaded {
                store.put(credential);
            }
        }
        Ok(store)
    }

    pub fn insert(&mut self, provider: &str, scope: &str, secret: impl Into<String>) {
        self.put(Credential::new(provider, scope, secret));
    }

    fn put(&mut self, credential: Credential) {
        debug!(
            provider = %credential.provider_id,
            scope = %credential.scope,
            "registering credential"
        );
        self.entries.insert(
            (credential.provider_id.clone(), credential.scope.clone()),
            credential,
        );
    }

    pub fn get(&self, provider: &str, scope: &str) -> Result<&Credential> {
        self.entries
            .get(&(provider.to_string(), scope.to_string()))
            .ok_or_else(|| OrchestratorError::CredentialNotFound {
                provider: provider.to_string(),
                scope: scope.to_string(),
            })
    }

    pub fn contains(&self, provider: &str, scope: &str) -> bool {
        self.get(provider, scope).is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn providers(&self) -> BTreeSet<&str> {
        self.entries.keys().map(|(provider, _)| provider.as_str()).collect()
    }

    /// Every `(provider, scope)` the plan needs, either to run a step or to fill a placeholder.
    pub fn requirements(plan: &Plan) -> Result<BTreeSet<(String, String)>> {
        let mut needed = BTreeSet::new();
        for step in plan.steps() {
            needed.insert((step.provider.clone(), step.scope.clone()));
            let secrets = inputs::secret_references(&step.inputs)
                .map_err(|err| OrchestratorError::Config(format!("step '{}': {err}", step.id)))?;
            needed.extend(secrets);
        }
        Ok(needed)
    }

    pub fn missing_for(&self, plan: &Plan) -> Result<Vec<(String, String)>> {
        Ok(Self::requirements(plan)?
            .into_iter()
            .filter(|(provider, scope)| !self.contains(provider, scope))
            .collect())
    }

    /// Which of `providers` have at least one credential loaded.
    pub fn readiness<'a, I>(&self, providers: I) -> Readiness
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = Vec::new();
        for provider in providers.into_iter().collect::<BTreeSet<_>>() {
            let mut scopes: Vec<String> = self
                .entries
                .keys()
                .filter(|(p, _)| p == provider)
                .map(|(_, scope)| scope.clone())
                .collect();
            scopes.sort();
            entries.push(ProviderReadiness {
                provider: provider.to_string(),
                ready: !scopes.is_empty(),
                scopes,
            });
        }
        let ready = entries.iter().filter(|entry| entry.ready).count();
        let total = entries.len();
        let percentage = if total == 0 {
            100.0
        } else {
            ((ready as f64 / total as f64) * 1000.0).round() / 10.0
        };
        Readiness {
            providers: entries,
            ready,
            total,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderReadiness {
    pub provider: String,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Readiness {
    pub providers: Vec<ProviderReadiness>,
    pub ready: usize,
    pub total: usize,
    pub percentage: f64,
}

impl Readiness {
    pub fn score(&self) -> String {
        format!("{}/{}", self.ready, self.total)
    }
}

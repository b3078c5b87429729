use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::error::{OrchestratorError, Result};
use crate::executor::RetryPolicy;

/// Available CLI actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Validate,
    Status,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Validate => "validate",
            Action::Status => "status",
        }
    }
}

/// Output format for CLI commands.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// Where credentials and settings come from.
#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Credentials document (JSON/YAML/TOML, provider -> scope -> secret). Repeatable.
    #[arg(long = "credentials")]
    pub credentials: Vec<PathBuf>,

    /// Ignore DEPLOY_CRED_* environment variables.
    #[arg(long, default_value_t = false)]
    pub no_env_credentials: bool,

    /// Settings file (TOML) with [engine], [retry] and [providers.<id>] tables.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Plan document (.yaml, .yml, .json or .toml).
    #[arg(long)]
    pub plan: PathBuf,

    #[command(flatten)]
    pub sources: SourceArgs,

    /// Maximum number of steps executing at once.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Total attempts per step, including the first call.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Deadline per step, covering all attempts and backoff.
    #[arg(long)]
    pub step_timeout_secs: Option<u64>,

    /// Write the JSON report to this file.
    #[arg(long)]
    pub report_out: Option<PathBuf>,

    /// Execute against in-process simulated providers instead of real APIs.
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Output format for the report (text|json|yaml).
    #[arg(long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Plan document (.yaml, .yml, .json or .toml).
    #[arg(long)]
    pub plan: PathBuf,

    #[command(flatten)]
    pub sources: SourceArgs,

    /// Check capabilities against simulated providers.
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    #[arg(long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Limit the readiness check to the providers this plan uses.
    #[arg(long)]
    pub plan: Option<PathBuf>,

    #[command(flatten)]
    pub sources: SourceArgs,

    /// Also render a report saved by `run --report-out`.
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Top-level CLI structure.
#[derive(Debug, Parser)]
#[command(
    name = "deploy-orchestrator",
    version,
    about = "Dependency-aware multi-provider deployment orchestrator.",
    long_about = "Runs a plan of provisioning steps (repository, env vars, deploy, DNS, CI, notifications) across providers, retrying transient failures, skipping dependents of failed steps and reporting the fate of every step."
)]
pub struct CliArgs {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, env = "DEPLOY_ORCHESTRATOR_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a plan.
    Run(RunArgs),
    /// Validate a plan and print its execution order.
    Validate(ValidateArgs),
    /// Show credential readiness, optionally alongside a saved report.
    Status(StatusArgs),
}

/// `[providers.<id>]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub step_timeout_secs: Option<u64>,
}

/// Settings file contents.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub engine: EngineSection,
    pub retry: RetrySection,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            OrchestratorError::Config(format!("failed to read settings {}: {err}", path.display()))
        })?;
        toml::from_str(&contents).map_err(|err| {
            OrchestratorError::Config(format!("invalid settings {}: {err}", path.display()))
        })
    }
}

/// Complete configuration used by the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub action: Action,
    pub plan_path: Option<PathBuf>,
    pub credential_files: Vec<PathBuf>,
    pub env_credentials: bool,
    pub engine: EngineSettings,
    pub providers: BTreeMap<String, ProviderSettings>,
    pub report_out: Option<PathBuf>,
    pub report_in: Option<PathBuf>,
    pub simulate: bool,
    pub output: OutputFormat,
    pub log_level: String,
    pub log_json: bool,
}

/// Per-run overrides that come from CLI flags.
#[derive(Default)]
struct FlagOverrides {
    concurrency: Option<usize>,
    max_attempts: Option<u32>,
    step_timeout_secs: Option<u64>,
}

impl OrchestratorConfig {
    pub fn from_env_and_args(cli: CliArgs) -> Result<Self> {
        Self::from_args_with_env(cli, |key| env::var(key).ok())
    }

    fn from_args_with_env<F>(cli: CliArgs, get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (action, plan_path, sources, flags, report_out, report_in, simulate, output) =
            match cli.command {
                Command::Run(args) => (
                    Action::Run,
                    Some(args.plan),
                    args.sources,
                    FlagOverrides {
                        concurrency: args.concurrency,
                        max_attempts: args.max_attempts,
                        step_timeout_secs: args.step_timeout_secs,
                    },
                    args.report_out,
                    None,
                    args.simulate,
                    args.output,
                ),
                Command::Validate(args) => (
                    Action::Validate,
                    Some(args.plan),
                    args.sources,
                    FlagOverrides::default(),
                    None,
                    None,
                    args.simulate,
                    args.output,
                ),
                Command::Status(args) => (
                    Action::Status,
                    args.plan,
                    args.sources,
                    FlagOverrides::default(),
                    None,
                    args.report,
                    false,
                    args.output,
                ),
            };

        if let Some(plan) = &plan_path
            && !plan.exists()
        {
            return Err(OrchestratorError::Config(format!(
                "plan {} does not exist",
                plan.display()
            )));
        }

        let settings = match &sources.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        let engine = resolve_engine(&settings, &flags, &get_env)?;

        Ok(Self {
            action,
            plan_path,
            credential_files: sources.credentials,
            env_credentials: !sources.no_env_credentials,
            engine,
            providers: settings.providers,
            report_out,
            report_in,
            simulate,
            output,
            log_level: cli.log_level,
            log_json: cli.log_json,
        })
    }
}

fn resolve_engine<F>(settings: &Settings, flags: &FlagOverrides, get_env: &F) -> Result<EngineSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = EngineSettings::default();
    let retry = &settings.retry;

    let concurrency = match flags.concurrency {
        Some(value) => value,
        None => env_number(get_env, "DEPLOY_ORCHESTRATOR_CONCURRENCY")?
            .or(settings.engine.concurrency)
            .unwrap_or(defaults.concurrency),
    };
    let max_attempts = match flags.max_attempts {
        Some(value) => value,
        None => env_number(get_env, "DEPLOY_ORCHESTRATOR_MAX_ATTEMPTS")?
            .or(retry.max_attempts)
            .unwrap_or(defaults.retry.max_attempts),
    };
    let step_timeout = flags
        .step_timeout_secs
        .or(retry.step_timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(defaults.retry.step_timeout);
    let policy = RetryPolicy {
        max_attempts,
        initial_backoff: retry
            .initial_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.initial_backoff),
        max_backoff: retry
            .max_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.max_backoff),
        multiplier: retry.multiplier.unwrap_or(defaults.retry.multiplier),
        step_timeout,
    };

    if concurrency == 0 {
        return Err(OrchestratorError::Config(
            "concurrency must be at least 1".into(),
        ));
    }
    if policy.max_attempts == 0 {
        return Err(OrchestratorError::Config(
            "max_attempts must be at least 1".into(),
        ));
    }
    if policy.multiplier.is_nan() || policy.multiplier < 1.0 {
        return Err(OrchestratorError::Config(
            "retry multiplier must be >= 1.0".into(),
        ));
    }
    if policy.step_timeout.is_zero() {
        return Err(OrchestratorError::Config(
            "step timeout must be greater than zero".into(),
        ));
    }

    Ok(EngineSettings {
        concurrency,
        retry: policy,
    })
}

fn env_number<F, T>(get_env: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = get_env(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| OrchestratorError::Config(format!("{key} must be a number, got '{raw}'")))
}

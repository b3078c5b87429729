use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::config::{Action, OrchestratorConfig, OutputFormat};
use crate::credentials::{CredentialSource, CredentialStore, EnvSource, FileSource, Readiness};
use crate::engine::{Orchestrator, cancellation};
use crate::error::{OrchestratorError, Result};
use crate::plan::Plan;
use crate::providers::{AdapterRegistry, default_registry, simulated_registry};
use crate::report::{DeploymentReport, load_report, render_as, save_report};
use crate::telemetry;

/// How a CLI invocation ended; aborted runs surface as `Err` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every required step succeeded (or nothing was executed).
    Succeeded,
    /// The run completed but some required step failed or was skipped.
    Incomplete,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Succeeded => 0,
            Outcome::Incomplete => 1,
        }
    }
}

pub async fn run(config: OrchestratorConfig) -> Result<Outcome> {
    telemetry::init(&config.log_level, config.log_json)?;
    match config.action {
        Action::Run => execute(&config).await,
        Action::Validate => validate(&config),
        Action::Status => status(&config),
    }
}

async fn execute(config: &OrchestratorConfig) -> Result<Outcome> {
    let plan = {
        let span = stage_span("plan", config);
        let _enter = span.enter();
        load_plan(config)?
    };
    info!(plan = %plan.name(), steps = plan.len(), "loaded plan");

    let credentials = {
        let span = stage_span("credentials", config);
        let _enter = span.enter();
        load_credentials(config)?
    };
    let registry = build_registry(config, &plan)?;

    let orchestrator = Orchestrator::new(
        Arc::new(plan),
        Arc::new(registry),
        Arc::new(credentials),
        config.engine.clone(),
    );

    let (handle, signal) = cancellation();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; letting in-flight steps finish");
            handle.cancel();
        }
    });
    let result = orchestrator.run_with_cancel(signal).await;
    interrupt.abort();
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if let Some(report) = orchestrator.abort_report() {
                publish(config, &report)?;
            }
            return Err(err);
        }
    };
    publish(config, &report)?;

    Ok(if report.is_success() {
        Outcome::Succeeded
    } else {
        Outcome::Incomplete
    })
}

fn publish(config: &OrchestratorConfig, report: &DeploymentReport) -> Result<()> {
    if let Some(path) = &config.report_out {
        save_report(path, report)?;
        info!(path = %path.display(), "report written");
    }
    print!("{}", with_newline(render_as(report, config.output)?));
    Ok(())
}

/// What `validate` prints.
#[derive(Debug, Serialize)]
pub struct PlanSummary {
    pub plan: String,
    pub steps: usize,
    pub order: Vec<String>,
    pub layers: Vec<Vec<String>>,
    pub providers: Vec<String>,
    pub missing_credentials: Vec<String>,
}

impl PlanSummary {
    fn build(plan: &Plan, credentials: &CredentialStore) -> Result<Self> {
        Ok(Self {
            plan: plan.name().to_string(),
            steps: plan.len(),
            order: plan
                .topological_order()
                .into_iter()
                .map(|step| step.id.clone())
                .collect(),
            layers: plan
                .layers()
                .into_iter()
                .map(|layer| layer.into_iter().map(str::to_string).collect())
                .collect(),
            providers: plan.providers().into_iter().map(str::to_string).collect(),
            missing_credentials: credentials
                .missing_for(plan)?
                .into_iter()
                .map(|(provider, scope)| format!("{provider}/{scope}"))
                .collect(),
        })
    }

    fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Plan '{}' is valid ({} steps)", self.plan, self.steps);
        let _ = writeln!(out, "Execution order: {}", self.order.join(" -> "));
        for (index, layer) in self.layers.iter().enumerate() {
            let _ = writeln!(out, "  wave {}: {}", index + 1, layer.join(", "));
        }
        let _ = writeln!(out, "Providers: {}", self.providers.join(", "));
        if self.missing_credentials.is_empty() {
            out.push_str("All required credentials are present\n");
        } else {
            let _ = writeln!(
                out,
                "Missing credentials: {}",
                self.missing_credentials.join(", ")
            );
        }
        out
    }
}

fn validate(config: &OrchestratorConfig) -> Result<Outcome> {
    let span = stage_span("validate", config);
    let _enter = span.enter();

    let plan = load_plan(config)?;
    build_registry(config, &plan)?.validate_plan(&plan)?;
    let credentials = load_credentials(config)?;
    let summary = PlanSummary::build(&plan, &credentials)?;
    let rendered = match config.output {
        OutputFormat::Text => summary.to_text(),
        OutputFormat::Json => serde_json::to_string_pretty(&summary)?,
        OutputFormat::Yaml => serde_yaml_bw::to_string(&summary)?,
    };
    print!("{}", with_newline(rendered));
    Ok(if summary.missing_credentials.is_empty() {
        Outcome::Succeeded
    } else {
        Outcome::Incomplete
    })
}

fn status(config: &OrchestratorConfig) -> Result<Outcome> {
    let span = stage_span("status", config);
    let _enter = span.enter();

    let credentials = load_credentials(config)?;
    let providers: Vec<String> = match &config.plan_path {
        Some(_) => {
            let plan = load_plan(config)?;
            plan.providers().into_iter().map(str::to_string).collect()
        }
        None => default_registry(&config.providers)?
            .ids()
            .into_iter()
            .map(str::to_string)
            .collect(),
    };
    let readiness = credentials.readiness(providers.iter().map(String::as_str));
    let report = config
        .report_in
        .as_deref()
        .map(load_report)
        .transpose()?;

    let rendered = render_status(&readiness, report.as_ref(), config.output)?;
    print!("{}", with_newline(rendered));
    Ok(if readiness.ready == readiness.total {
        Outcome::Succeeded
    } else {
        Outcome::Incomplete
    })
}

#[derive(Serialize)]
struct StatusView<'a> {
    readiness: &'a Readiness,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a DeploymentReport>,
}

fn render_status(
    readiness: &Readiness,
    report: Option<&DeploymentReport>,
    format: OutputFormat,
) -> Result<String> {
    let view = StatusView { readiness, report };
    match format {
        OutputFormat::Json => return Ok(serde_json::to_string_pretty(&view)?),
        OutputFormat::Yaml => return Ok(serde_yaml_bw::to_string(&view)?),
        OutputFormat::Text => {}
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Credential readiness: {} ({:.1}%)",
        readiness.score(),
        readiness.percentage
    );
    for entry in &readiness.providers {
        let mark = if entry.ready { "ok" } else { "missing" };
        let _ = write!(out, "  {:<10} {mark}", entry.provider);
        if !entry.scopes.is_empty() {
            let _ = write!(out, " [{}]", entry.scopes.join(", "));
        }
        out.push('\n');
    }
    if let Some(report) = report {
        out.push('\n');
        out.push_str(&render_as(report, OutputFormat::Text)?);
    }
    Ok(out)
}

fn load_plan(config: &OrchestratorConfig) -> Result<Plan> {
    let path = config
        .plan_path
        .as_deref()
        .ok_or_else(|| OrchestratorError::Config("--plan is required".into()))?;
    Plan::load(path)
}

/// Environment first, then credential files in the order given.
pub fn load_credentials(config: &OrchestratorConfig) -> Result<CredentialStore> {
    let mut sources: Vec<Box<dyn CredentialSource>> = Vec::new();
    if config.env_credentials {
        sources.push(Box::new(EnvSource));
    }
    for path in &config.credential_files {
        sources.push(Box::new(FileSource::new(path)));
    }
    CredentialStore::from_sources(&sources)
}

fn build_registry(config: &OrchestratorConfig, plan: &Plan) -> Result<AdapterRegistry> {
    if config.simulate {
        info!("using simulated providers");
        return Ok(simulated_registry(plan));
    }
    default_registry(&config.providers)
}

fn stage_span(stage: &str, config: &OrchestratorConfig) -> tracing::Span {
    let plan = config
        .plan_path
        .as_deref()
        .map(Path::display)
        .map(|path| path.to_string())
        .unwrap_or_default();
    info_span!(
        "orchestrator",
        stage,
        action = config.action.as_str(),
        %plan,
        simulate = config.simulate
    )
}

fn with_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::OutputFormat;
use crate::engine::RunState;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::plan::{Capability, ProvisioningStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// pending -> running -> {succeeded | failed}; pending -> skipped.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::Running, StepStatus::Succeeded)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one provisioning step within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub provider: String,
    pub capability: Capability,
    pub required: bool,
    pub status: StepStatus,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Unix milliseconds of the latest status transition.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl StepResult {
    pub fn pending(step: &ProvisioningStep) -> Self {
        Self {
            step_id: step.id.clone(),
            provider: step.provider.clone(),
            capability: step.capability,
            required: step.required,
            status: StepStatus::Pending,
            detail: String::new(),
            error: None,
            timestamp: now_ms(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            retry_count: 0,
            output: None,
        }
    }

    fn transition(&mut self, next: StepStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal step transition {} -> {} for {}",
            self.status.as_str(),
            next.as_str(),
            self.step_id
        );
        self.status = next;
        self.timestamp = now_ms();
    }

    pub fn start(&mut self) {
        self.transition(StepStatus::Running);
        self.started_at = Some(self.timestamp);
    }

    pub fn succeed(mut self, detail: impl Into<String>, output: Value, attempts: u32) -> Self {
        self.transition(StepStatus::Succeeded);
        self.finish(attempts);
        self.detail = detail.into();
        self.output = Some(output);
        self
    }

    pub fn fail(mut self, kind: ErrorKind, message: impl Into<String>, attempts: u32) -> Self {
        self.transition(StepStatus::Failed);
        self.finish(attempts);
        let message = message.into();
        self.detail = format!("{kind}: {message}");
        self.error = Some(StepError { kind, message });
        self
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.transition(StepStatus::Skipped);
        self.detail = reason.into();
    }

    fn finish(&mut self, attempts: u32) {
        self.finished_at = Some(self.timestamp);
        self.attempts = attempts;
        self.retry_count = attempts.saturating_sub(1);
    }

    pub fn duration_ms(&self) -> Option<u64> {
        Some(self.finished_at?.saturating_sub(self.started_at?))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|err| err.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Succeeded,
    PartiallySucceeded,
    Failed,
    Aborted,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Succeeded => "succeeded",
            OverallStatus::PartiallySucceeded => "partially_succeeded",
            OverallStatus::Failed => "failed",
            OverallStatus::Aborted => "aborted",
        }
    }
}

/// Tally derived from the step results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overall {
    pub status: OverallStatus,
    pub required: usize,
    pub required_succeeded: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Required-step success rate rounded to one decimal, e.g. `75.0`.
    pub percentage: f64,
}

impl Overall {
    pub fn from_steps(run_state: RunState, steps: &[StepResult]) -> Self {
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        let required = steps.iter().filter(|s| s.required).count();
        let required_succeeded = steps
            .iter()
            .filter(|s| s.required && s.status == StepStatus::Succeeded)
            .count();
        let status = if run_state == RunState::Aborted {
            OverallStatus::Aborted
        } else if required_succeeded == required {
            OverallStatus::Succeeded
        } else if required_succeeded > 0 {
            OverallStatus::PartiallySucceeded
        } else {
            OverallStatus::Failed
        };
        Self {
            status,
            required,
            required_succeeded,
            succeeded: count(StepStatus::Succeeded),
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
            percentage: (success_ratio(required_succeeded, required) * 1000.0).round() / 10.0,
        }
    }

    /// `required_succeeded / required`, in `[0, 1]`; derived so it never drifts
    /// through serialization.
    pub fn success_ratio(&self) -> f64 {
        success_ratio(self.required_succeeded, self.required)
    }
}

fn success_ratio(succeeded: usize, required: usize) -> f64 {
    if required == 0 {
        1.0
    } else {
        succeeded as f64 / required as f64
    }
}

/// Ordered step outcomes of one plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub plan: String,
    pub run_state: RunState,
    pub started_at: u64,
    pub finished_at: u64,
    pub steps: Vec<StepResult>,
    pub overall: Overall,
}

impl DeploymentReport {
    pub fn new(
        plan: impl Into<String>,
        run_state: RunState,
        started_at: u64,
        steps: Vec<StepResult>,
    ) -> Self {
        let overall = Overall::from_steps(run_state, &steps);
        Self {
            plan: plan.into(),
            run_state,
            started_at,
            finished_at: now_ms(),
            steps,
            overall,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.step_id == id)
    }

    pub fn is_success(&self) -> bool {
        self.overall.status == OverallStatus::Succeeded
    }
}

/// One rendered line of the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryLine {
    pub step_id: String,
    pub provider: String,
    pub capability: Capability,
    pub outcome: String,
    pub required: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Structured summary produced by [`render`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub plan: String,
    pub status: OverallStatus,
    pub percentage: f64,
    pub passed: usize,
    pub required: usize,
    pub steps: Vec<SummaryLine>,
}

impl ReportSummary {
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Deployment report for plan '{}'", self.plan);
        let width = self
            .steps
            .iter()
            .map(|line| line.step_id.len())
            .max()
            .unwrap_or(0);
        for line in &self.steps {
            let _ = write!(
                out,
                "  [{:<4}] {:<width$}  {} via {}",
                line.outcome,
                line.step_id,
                line.capability,
                line.provider,
                width = width
            );
            if !line.required {
                out.push_str(" (optional)");
            }
            if line.attempts > 1 {
                let _ = write!(out, ", {} attempts", line.attempts);
            }
            if let Some(kind) = line.error_kind {
                let _ = write!(out, " - {kind}");
            }
            if !line.detail.is_empty() && line.error_kind.is_none() && line.outcome == "skip" {
                let _ = write!(out, " - {}", line.detail);
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "Overall: {} ({}/{} required steps succeeded, {:.1}%)",
            self.status.as_str(),
            self.passed,
            self.required,
            self.percentage
        );
        out
    }
}

/// Builds the structured summary for a report. Pure.
pub fn render(report: &DeploymentReport) -> ReportSummary {
    let steps = report
        .steps
        .iter()
        .map(|step| SummaryLine {
            step_id: step.step_id.clone(),
            provider: step.provider.clone(),
            capability: step.capability,
            outcome: match step.status {
                StepStatus::Succeeded => "pass",
                StepStatus::Failed => "fail",
                StepStatus::Skipped => "skip",
                StepStatus::Pending | StepStatus::Running => "open",
            }
            .to_string(),
            required: step.required,
            attempts: step.attempts,
            error_kind: step.error_kind(),
            detail: match &step.error {
                Some(err) => err.message.clone(),
                None => step.detail.clone(),
            },
        })
        .collect();
    ReportSummary {
        plan: report.plan.clone(),
        status: report.overall.status,
        percentage: report.overall.percentage,
        passed: report.overall.required_succeeded,
        required: report.overall.required,
        steps,
    }
}

/// Renders a report in the requested output format.
pub fn render_as(report: &DeploymentReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(render(report).to_text()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Yaml => Ok(serde_yaml_bw::to_string(report)?),
    }
}

pub fn save_report(path: &Path, report: &DeploymentReport) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

pub fn load_report(path: &Path) -> Result<DeploymentReport> {
    let data = fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|err| {
        OrchestratorError::Config(format!("invalid report {}: {err}", path.display()))
    })
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

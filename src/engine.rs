//! Runs a validated plan: dispatches ready steps onto a bounded set of tasks,
//! propagates failures to dependents and collects the deployment report.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::credentials::CredentialStore;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::executor::{RetryPolicy, StepExecutor};
use crate::inputs::{self, ResolveContext};
use crate::plan::Plan;
use crate::providers::AdapterRegistry;
use crate::report::{DeploymentReport, StepResult, StepStatus, now_ms, render};

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NotStarted => "not_started",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
        }
    }
}

/// Creates a linked cancel handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelSignal(rx))
}

/// Requests cancellation of a run.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observes cancellation; cheap to clone into step tasks.
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Maximum number of steps executing at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

/// Executes one plan exactly once.
pub struct Orchestrator {
    plan: Arc<Plan>,
    registry: Arc<AdapterRegistry>,
    credentials: Arc<CredentialStore>,
    settings: EngineSettings,
    state: Mutex<RunState>,
    aborted: Mutex<Option<DeploymentReport>>,
}

impl Orchestrator {
    pub fn new(
        plan: Arc<Plan>,
        registry: Arc<AdapterRegistry>,
        credentials: Arc<CredentialStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            plan,
            registry,
            credentials,
            settings,
            state: Mutex::new(RunState::NotStarted),
            aborted: Mutex::new(None),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn state(&self) -> RunState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: RunState) {
        *self.lock_state() = next;
    }

    /// The report of a run that was aborted before any step executed.
    pub fn abort_report(&self) -> Option<DeploymentReport> {
        self.aborted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_abort(&self, err: &OrchestratorError) {
        let reason = format!("run aborted: {err}");
        let steps = self
            .plan
            .steps()
            .map(|step| {
                let mut result = StepResult::pending(step);
                result.skip(reason.as_str());
                result
            })
            .collect();
        let report = DeploymentReport::new(self.plan.name(), RunState::Aborted, now_ms(), steps);
        *self
            .aborted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report);
    }

    pub async fn run(&self) -> Result<DeploymentReport> {
        self.run_with_cancel(CancelSignal::never()).await
    }

    /// Runs the plan to completion. Only plan/credential validation errors are
    /// returned as `Err`; every step-level failure lands in the report. An
    /// aborted run leaves its all-skipped report in [`Orchestrator::abort_report`].
    pub async fn run_with_cancel(&self, cancel: CancelSignal) -> Result<DeploymentReport> {
        {
            let mut state = self.lock_state();
            if *state != RunState::NotStarted {
                return Err(OrchestratorError::AlreadyStarted(state.as_str().to_string()));
            }
            *state = RunState::Running;
        }

        let span = info_span!("orchestrate", plan = %self.plan.name(), steps = self.plan.len());
        async {
            if let Err(err) = self.preflight() {
                warn!(error = %err, "aborting run before execution");
                self.set_state(RunState::Aborted);
                self.record_abort(&err);
                return Err(err);
            }
            let started_at = now_ms();
            let results = self.schedule(&cancel).await;
            self.set_state(RunState::Completed);
            let report =
                DeploymentReport::new(self.plan.name(), RunState::Completed, started_at, results);
            let summary = render(&report);
            info!(
                status = summary.status.as_str(),
                percentage = summary.percentage,
                passed = summary.passed,
                required = summary.required,
                "run finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Every step needs an adapter that supports it and every credential it
    /// (or one of its placeholders) names.
    fn preflight(&self) -> Result<()> {
        self.registry.validate_plan(&self.plan)?;
        for (provider, scope) in CredentialStore::requirements(&self.plan)? {
            self.credentials.get(&provider, &scope)?;
        }
        Ok(())
    }

    async fn schedule(&self, cancel: &CancelSignal) -> Vec<StepResult> {
        let mut run = RunBook::new(&self.plan);
        let executor = StepExecutor::new(self.settings.retry.clone());
        let concurrency = self.settings.concurrency.max(1);
        let mut tasks: JoinSet<StepResult> = JoinSet::new();
        let mut running: HashMap<Id, usize> = HashMap::new();

        loop {
            while tasks.len() < concurrency && !cancel.is_cancelled() {
                let Some(index) = run.next_ready() else {
                    break;
                };
                self.dispatch(index, &mut run, &executor, cancel, &mut tasks, &mut running);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            match joined {
                Ok((id, result)) => {
                    if let Some(index) = running.remove(&id) {
                        run.complete(index, result);
                    }
                }
                Err(err) => {
                    let Some(index) = running.remove(&err.id()) else {
                        continue;
                    };
                    warn!(step = %self.plan.step_at(index).id, error = %err, "step task died");
                    let failed = run.results[index].clone().fail(
                        ErrorKind::InternalError,
                        format!("step task failed: {err}"),
                        0,
                    );
                    run.complete(index, failed);
                }
            }
        }

        let reason = if cancel.is_cancelled() {
            "run cancelled before dispatch"
        } else {
            "never became ready"
        };
        run.skip_pending(reason);
        run.results
    }

    fn dispatch(
        &self,
        index: usize,
        run: &mut RunBook<'_>,
        executor: &StepExecutor,
        cancel: &CancelSignal,
        tasks: &mut JoinSet<StepResult>,
        running: &mut HashMap<Id, usize>,
    ) {
        let step = Arc::clone(self.plan.step_at(index));
        let ctx = ResolveContext {
            outputs: &run.outputs,
            credentials: &self.credentials,
        };
        let resolved = inputs::resolve(&step.inputs, &ctx);
        let adapter = self.registry.get(&step.provider);
        let credential = self.credentials.get(&step.provider, &step.scope).cloned();

        let (inputs, adapter, credential) = match (resolved, adapter, credential) {
            (Ok(inputs), Some(adapter), Ok(credential)) => (inputs, adapter, credential),
            (Err(err), _, _) => {
                let mut record = StepResult::pending(&step);
                record.start();
                run.complete(
                    index,
                    record.fail(ErrorKind::InvalidInputError, err.to_string(), 0),
                );
                return;
            }
            (_, None, _) | (_, _, Err(_)) => {
                let mut record = StepResult::pending(&step);
                record.start();
                run.complete(
                    index,
                    record.fail(
                        ErrorKind::InternalError,
                        "adapter or credential disappeared after validation",
                        0,
                    ),
                );
                return;
            }
        };

        run.results[index].start();
        debug!(step = %step.id, provider = %step.provider, "dispatching");
        let executor = executor.clone();
        let cancel = cancel.clone();
        let span = info_span!(
            "step",
            step = %step.id,
            provider = %step.provider,
            capability = %step.capability
        );
        let handle = tasks.spawn(
            async move {
                executor
                    .execute(&step, adapter.as_ref(), &credential, &inputs, &cancel)
                    .await
            }
            .instrument(span),
        );
        running.insert(handle.id(), index);
    }
}

/// Coordinator-owned bookkeeping. Only the scheduling loop mutates it, so step
/// completions are applied one at a time.
struct RunBook<'p> {
    plan: &'p Plan,
    results: Vec<StepResult>,
    outputs: HashMap<String, Value>,
    /// Dependencies of each step that have not yet released it.
    waiting_on: Vec<usize>,
    /// Ready steps keyed by topological rank.
    ready: BTreeSet<(usize, usize)>,
}

impl<'p> RunBook<'p> {
    fn new(plan: &'p Plan) -> Self {
        let results = plan.steps().map(|step| StepResult::pending(step)).collect();
        let waiting_on: Vec<usize> = (0..plan.len())
            .map(|index| plan.dependencies_of(index).len())
            .collect();
        let ready = waiting_on
            .iter()
            .enumerate()
            .filter(|(_, waiting)| **waiting == 0)
            .map(|(index, _)| (plan.rank_of(index), index))
            .collect();
        Self {
            plan,
            results,
            outputs: HashMap::new(),
            waiting_on,
            ready,
        }
    }

    fn next_ready(&mut self) -> Option<usize> {
        self.ready.pop_first().map(|(_, index)| index)
    }

    fn complete(&mut self, index: usize, result: StepResult) {
        let step = self.plan.step_at(index);
        let status = result.status;
        if status == StepStatus::Succeeded {
            self.outputs.insert(
                step.id.clone(),
                result.output.clone().unwrap_or(Value::Null),
            );
        }
        self.results[index] = result;

        if status == StepStatus::Succeeded || !step.required {
            for &dependent in self.plan.dependents_of(index) {
                self.waiting_on[dependent] -= 1;
                if self.waiting_on[dependent] == 0
                    && self.results[dependent].status == StepStatus::Pending
                {
                    self.ready.insert((self.plan.rank_of(dependent), dependent));
                }
            }
            return;
        }

        for dependent in self.plan.transitive_dependents(index) {
            if self.results[dependent].status == StepStatus::Pending {
                self.ready.remove(&(self.plan.rank_of(dependent), dependent));
                self.results[dependent].skip(format!("dependency '{}' failed", step.id));
                debug!(step = %self.plan.step_at(dependent).id, failed = %step.id, "skipping");
            }
        }
    }

    fn skip_pending(&mut self, reason: &str) {
        for result in &mut self.results {
            if result.status == StepStatus::Pending {
                result.skip(reason);
            }
        }
    }
}

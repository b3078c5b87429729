use std::sync::Arc;
use std::time::Duration;

use deploy_orchestrator::providers::SimulatedAdapter;
use deploy_orchestrator::report::{load_report, save_report};
use deploy_orchestrator::{
    AdapterRegistry, Capability, CredentialStore, EngineSettings, ErrorKind, Orchestrator,
    OrchestratorError, Plan, RetryPolicy, RunState, StepSpec, StepStatus, cancellation, render,
};
use serde_json::{Value, json};
use tempfile::tempdir;

fn spec(id: &str, provider: &str, capability: &str, deps: &[&str], inputs: Value) -> StepSpec {
    serde_json::from_value(json!({
        "id": id,
        "provider": provider,
        "capability": capability,
        "depends_on": deps,
        "inputs": inputs,
    }))
    .expect("step spec")
}

fn optional(mut step: StepSpec) -> StepSpec {
    step.required = false;
    step
}

fn settings(concurrency: usize, max_attempts: u32) -> EngineSettings {
    EngineSettings {
        concurrency,
        retry: RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            ..RetryPolicy::default()
        },
    }
}

/// Registry with one shared simulated adapter per provider, returned so tests
/// can inspect the calls made against them.
fn simulated(providers: &[&str]) -> (AdapterRegistry, Vec<Arc<SimulatedAdapter>>) {
    let mut registry = AdapterRegistry::new();
    let mut adapters = Vec::new();
    for provider in providers {
        let adapter = Arc::new(SimulatedAdapter::new(*provider));
        registry.register_arc(adapter.clone());
        adapters.push(adapter);
    }
    (registry, adapters)
}

fn credentials(providers: &[&str]) -> CredentialStore {
    let mut store = CredentialStore::new();
    for provider in providers {
        store.insert(provider, "default", format!("{provider}-secret"));
    }
    store
}

fn orchestrator(plan: Plan, registry: AdapterRegistry, settings: EngineSettings) -> Orchestrator {
    let providers: Vec<String> = plan.providers().into_iter().map(str::to_string).collect();
    let providers: Vec<&str> = providers.iter().map(String::as_str).collect();
    Orchestrator::new(
        Arc::new(plan),
        Arc::new(registry),
        Arc::new(credentials(&providers)),
        settings,
    )
}

fn status_of(report: &deploy_orchestrator::DeploymentReport, id: &str) -> StepStatus {
    report.step(id).expect("step in report").status
}

#[tokio::test(start_paused = true)]
async fn every_step_ends_terminal() {
    let plan = Plan::new(
        "mixed",
        vec![
            spec("repo", "github", "create_repository", &[], json!({"name": "shop"})),
            spec(
                "deploy",
                "render",
                "trigger_deploy",
                &["repo"],
                json!({"simulate": {"fail": "transient", "times": 1}}),
            ),
            spec(
                "dns",
                "godaddy",
                "configure_dns",
                &["deploy"],
                json!({"simulate": {"fail": "permanent"}}),
            ),
            spec("mail", "sendgrid", "send_notification", &["dns"], json!({})),
        ],
    )
    .expect("plan");
    let (registry, _) = simulated(&["github", "render", "godaddy", "sendgrid"]);
    let orchestrator = orchestrator(plan, registry, settings(2, 3));

    let report = orchestrator.run().await.expect("run");

    assert_eq!(orchestrator.state(), RunState::Completed);
    assert_eq!(report.steps.len(), 4);
    assert!(report.steps.iter().all(|step| step.status.is_terminal()));
    assert_eq!(status_of(&report, "deploy"), StepStatus::Succeeded);
    assert_eq!(report.step("deploy").unwrap().attempts, 2);
    assert_eq!(status_of(&report, "dns"), StepStatus::Failed);
    assert_eq!(status_of(&report, "mail"), StepStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn required_failure_skips_exactly_its_transitive_dependents() {
    // a -> b -> c, a -> d, and an unrelated e -> f branch.
    let plan = Plan::new(
        "skips",
        vec![
            spec(
                "a",
                "render",
                "trigger_deploy",
                &[],
                json!({"simulate": {"fail": "auth"}}),
            ),
            spec("b", "godaddy", "configure_dns", &["a"], json!({"domain": "b.io"})),
            spec("c", "sendgrid", "send_notification", &["b"], json!({})),
            spec("d", "github", "run_ci", &["a"], json!({})),
            spec("e", "github", "create_repository", &[], json!({"name": "e"})),
            spec("f", "github", "push_files", &["e"], json!({})),
        ],
    )
    .expect("plan");
    let (registry, adapters) = simulated(&["render", "godaddy", "sendgrid", "github"]);
    let report = orchestrator(plan, registry, settings(4, 3))
        .run()
        .await
        .expect("run");

    assert_eq!(status_of(&report, "a"), StepStatus::Failed);
    for skipped in ["b", "c", "d"] {
        let step = report.step(skipped).unwrap();
        assert_eq!(step.status, StepStatus::Skipped, "{skipped}");
        assert!(step.detail.contains("'a'"), "{}", step.detail);
    }
    assert_eq!(status_of(&report, "e"), StepStatus::Succeeded);
    assert_eq!(status_of(&report, "f"), StepStatus::Succeeded);

    // Nothing was sent to godaddy or sendgrid; github only saw e and f.
    assert_eq!(adapters[1].call_count(), 0);
    assert_eq!(adapters[2].call_count(), 0);
    let github: Vec<Capability> = adapters[3]
        .calls()
        .into_iter()
        .map(|call| call.capability)
        .collect();
    assert_eq!(github, vec![Capability::CreateRepository, Capability::PushFiles]);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_step_spends_whole_budget() {
    let plan = Plan::new(
        "limits",
        vec![spec(
            "dns",
            "godaddy",
            "configure_dns",
            &[],
            json!({"simulate": {"fail": "rate_limit", "retry_after_ms": 250}}),
        )],
    )
    .expect("plan");
    let (registry, adapters) = simulated(&["godaddy"]);
    let report = orchestrator(plan, registry, settings(1, 5))
        .run()
        .await
        .expect("run");

    let dns = report.step("dns").unwrap();
    assert_eq!(dns.status, StepStatus::Failed);
    assert_eq!(dns.error_kind(), Some(ErrorKind::RateLimitError));
    assert_eq!(dns.attempts, 5);
    assert_eq!(dns.retry_count, 4);
    assert_eq!(adapters[0].call_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_is_attempted_once() {
    let plan = Plan::new(
        "auth",
        vec![spec(
            "repo",
            "github",
            "create_repository",
            &[],
            json!({"simulate": {"fail": "auth"}}),
        )],
    )
    .expect("plan");
    let (registry, adapters) = simulated(&["github"]);
    let report = orchestrator(plan, registry, settings(1, 5))
        .run()
        .await
        .expect("run");

    let repo = report.step("repo").unwrap();
    assert_eq!(repo.error_kind(), Some(ErrorKind::AuthError));
    assert_eq!(repo.attempts, 1);
    assert_eq!(adapters[0].call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn three_of_four_required_steps_is_seventy_five_percent() {
    let plan = Plan::new(
        "partial",
        vec![
            spec("repo", "github", "create_repository", &[], json!({"name": "shop"})),
            spec("deploy", "render", "trigger_deploy", &[], json!({})),
            spec("dns", "godaddy", "configure_dns", &[], json!({"domain": "shop.io"})),
            spec(
                "mail",
                "sendgrid",
                "send_notification",
                &[],
                json!({"simulate": {"fail": "permanent"}}),
            ),
        ],
    )
    .expect("plan");
    let (registry, _) = simulated(&["github", "render", "godaddy", "sendgrid"]);
    let report = orchestrator(plan, registry, settings(4, 3))
        .run()
        .await
        .expect("run");

    let summary = render(&report);
    assert_eq!(summary.passed, 3);
    assert_eq!(summary.required, 4);
    assert_eq!(summary.percentage, 75.0);
    assert!(!report.is_success());
    let text = summary.to_text();
    assert!(text.contains("3/4"), "{text}");
    assert!(text.contains("75.0%"), "{text}");
    assert!(text.contains("[fail] mail"), "{text}");
}

#[tokio::test(start_paused = true)]
async fn optional_failure_releases_dependents() {
    let plan = Plan::new(
        "optional",
        vec![
            optional(spec(
                "ci",
                "github",
                "run_ci",
                &[],
                json!({"simulate": {"fail": "permanent"}}),
            )),
            spec("deploy", "render", "trigger_deploy", &["ci"], json!({})),
        ],
    )
    .expect("plan");
    let (registry, _) = simulated(&["github", "render"]);
    let report = orchestrator(plan, registry, settings(2, 3))
        .run()
        .await
        .expect("run");

    assert_eq!(status_of(&report, "ci"), StepStatus::Failed);
    assert_eq!(status_of(&report, "deploy"), StepStatus::Succeeded);
    assert!(report.is_success());
    assert_eq!(render(&report).percentage, 100.0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_is_respected() {
    let steps = (0..6)
        .map(|n| {
            spec(
                &format!("deploy-{n}"),
                "render",
                "trigger_deploy",
                &[],
                json!({"name": format!("svc-{n}"), "simulate": {"delay_ms": 200}}),
            )
        })
        .collect();
    let plan = Plan::new("wide", steps).expect("plan");
    let (registry, adapters) = simulated(&["render"]);
    let report = orchestrator(plan, registry, settings(2, 1))
        .run()
        .await
        .expect("run");

    assert!(report.is_success());
    assert_eq!(adapters[0].call_count(), 6);
    assert_eq!(adapters[0].peak_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn dependencies_run_before_dependents() {
    let plan = Plan::new(
        "chain",
        vec![
            spec("notify", "github", "send_notification", &["dns"], json!({})),
            spec("dns", "github", "configure_dns", &["deploy"], json!({"domain": "a.io"})),
            spec("deploy", "github", "trigger_deploy", &["repo"], json!({})),
            spec("repo", "github", "create_repository", &[], json!({"name": "a"})),
        ],
    )
    .expect("plan");
    let (registry, adapters) = simulated(&["github"]);
    orchestrator(plan, registry, settings(4, 1))
        .run()
        .await
        .expect("run");

    let order: Vec<Capability> = adapters[0]
        .calls()
        .into_iter()
        .map(|call| call.capability)
        .collect();
    assert_eq!(
        order,
        vec![
            Capability::CreateRepository,
            Capability::TriggerDeploy,
            Capability::ConfigureDns,
            Capability::SendNotification,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_skips_undispatched_steps() {
    let plan = Plan::new(
        "cancel",
        vec![
            spec(
                "repo",
                "github",
                "create_repository",
                &[],
                json!({"name": "a", "simulate": {"delay_ms": 1_000}}),
            ),
            spec("push", "github", "push_files", &["repo"], json!({})),
            spec("deploy", "render", "trigger_deploy", &["push"], json!({})),
        ],
    )
    .expect("plan");
    let (registry, adapters) = simulated(&["github", "render"]);
    let orchestrator = orchestrator(plan, registry, settings(2, 1));
    let (handle, signal) = cancellation();

    let (report, ()) = tokio::join!(orchestrator.run_with_cancel(signal), async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });
    let report = report.expect("run");

    // The in-flight step is allowed to finish.
    assert_eq!(status_of(&report, "repo"), StepStatus::Succeeded);
    for id in ["push", "deploy"] {
        let step = report.step(id).unwrap();
        assert_eq!(step.status, StepStatus::Skipped);
        assert!(step.detail.contains("cancelled"), "{}", step.detail);
    }
    assert_eq!(adapters[0].call_count(), 1);
    assert_eq!(adapters[1].call_count(), 0);
    assert_eq!(orchestrator.state(), RunState::Completed);
}

#[test]
fn cyclic_plan_is_rejected_before_anything_runs() {
    let err = Plan::new(
        "cycle",
        vec![
            spec("a", "github", "create_repository", &["c"], json!({})),
            spec("b", "github", "push_files", &["a"], json!({})),
            spec("c", "github", "run_ci", &["b"], json!({})),
        ],
    )
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::CyclicDependency { .. }));
    assert!(format!("{err}").contains("cycle"));

    let err = Plan::new(
        "dangling",
        vec![spec("a", "github", "create_repository", &["ghost"], json!({}))],
    )
    .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::UnknownDependency { ref dependency, .. } if dependency == "ghost"
    ));
}

#[tokio::test]
async fn unsupported_capability_aborts_run() {
    let plan = Plan::new(
        "unsupported",
        vec![spec("dns", "dns-only", "trigger_deploy", &[], json!({}))],
    )
    .expect("plan");
    let mut registry = AdapterRegistry::new();
    let adapter = Arc::new(SimulatedAdapter::with_capabilities(
        "dns-only",
        &[Capability::ConfigureDns],
    ));
    registry.register_arc(adapter.clone());
    let orchestrator = orchestrator(plan, registry, EngineSettings::default());

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnsupportedCapability { .. }));
    assert_eq!(orchestrator.state(), RunState::Aborted);
    assert_eq!(adapter.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn report_survives_a_round_trip_through_disk() {
    let plan = Plan::new(
        "persist",
        vec![
            spec("repo", "github", "create_repository", &[], json!({"name": "shop"})),
            spec(
                "deploy",
                "render",
                "trigger_deploy",
                &["repo"],
                json!({"simulate": {"fail": "permanent"}}),
            ),
        ],
    )
    .expect("plan");
    let (registry, _) = simulated(&["github", "render"]);
    let report = orchestrator(plan, registry, settings(1, 1))
        .run()
        .await
        .expect("run");

    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("reports").join("persist.json");
    save_report(&path, &report).expect("save report");
    let loaded = load_report(&path).expect("load report");

    assert_eq!(loaded.plan, "persist");
    assert_eq!(loaded.run_state, RunState::Completed);
    assert_eq!(loaded.steps.len(), 2);
    let deploy = loaded.step("deploy").unwrap();
    assert_eq!(deploy.status, StepStatus::Failed);
    assert_eq!(deploy.error_kind(), Some(ErrorKind::PermanentApiError));
    assert_eq!(
        loaded.step("repo").unwrap().output.as_ref().unwrap()["repo_url"],
        "https://github.example/shop"
    );
    assert_eq!(render(&loaded).percentage, 50.0);

    let raw = std::fs::read_to_string(&path).expect("read report");
    assert!(raw.contains("PermanentAPIError"), "{raw}");
}

#[tokio::test(start_paused = true)]
async fn slow_step_times_out_without_blocking_siblings() {
    let plan = Plan::new(
        "slow",
        vec![
            spec(
                "deploy",
                "render",
                "trigger_deploy",
                &[],
                json!({"simulate": {"delay_ms": 60_000}}),
            ),
            spec("dns", "godaddy", "configure_dns", &["deploy"], json!({})),
            spec("repo", "github", "create_repository", &[], json!({"name": "shop"})),
        ],
    )
    .expect("plan");
    let (registry, adapters) = simulated(&["render", "godaddy", "github"]);
    let mut settings = settings(2, 3);
    settings.retry.step_timeout = Duration::from_secs(5);
    let orchestrator = orchestrator(plan, registry, settings);

    let report = orchestrator.run().await.expect("run");

    let deploy = report.step("deploy").expect("deploy");
    assert_eq!(deploy.status, StepStatus::Failed);
    assert_eq!(deploy.error_kind(), Some(ErrorKind::TimeoutError));
    assert_eq!(deploy.attempts, 1);
    assert_eq!(status_of(&report, "dns"), StepStatus::Skipped);
    assert_eq!(status_of(&report, "repo"), StepStatus::Succeeded);
    assert_eq!(adapters[1].call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn reading_output_of_failed_optional_step_is_invalid_input() {
    let plan = Plan::new(
        "optional-output",
        vec![
            optional(spec(
                "ci",
                "github",
                "run_ci",
                &[],
                json!({"repository": "acme/shop", "simulate": {"fail": "permanent"}}),
            )),
            spec(
                "announce",
                "sendgrid",
                "send_notification",
                &["ci"],
                json!({"text": "workflow at {{steps.ci.workflow}}"}),
            ),
        ],
    )
    .expect("plan");
    let (registry, adapters) = simulated(&["github", "sendgrid"]);
    let orchestrator = orchestrator(plan, registry, settings(2, 3));

    let report = orchestrator.run().await.expect("run");

    assert_eq!(status_of(&report, "ci"), StepStatus::Failed);
    let announce = report.step("announce").expect("announce");
    assert_eq!(announce.status, StepStatus::Failed);
    assert_eq!(announce.error_kind(), Some(ErrorKind::InvalidInputError));
    assert_eq!(announce.attempts, 0);
    assert_eq!(adapters[1].call_count(), 0);
}

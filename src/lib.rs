#![forbid(unsafe_code)]

pub mod apply;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod executor;
pub mod inputs;
pub mod path_safety;
pub mod plan;
pub mod providers;
pub mod report;
pub mod telemetry;

pub use config::{Action, CliArgs, Command, OrchestratorConfig, OutputFormat};
pub use credentials::{Credential, CredentialStore};
pub use engine::{CancelHandle, CancelSignal, EngineSettings, Orchestrator, RunState, cancellation};
pub use error::{ErrorKind, OrchestratorError, ProviderError};
pub use executor::{RetryPolicy, StepExecutor};
pub use plan::{Capability, Plan, PlanDocument, ProvisioningStep, StepSpec};
pub use providers::{AdapterRegistry, ProviderAdapter, ProviderResult};
pub use report::{DeploymentReport, StepResult, StepStatus, render};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{OrchestratorError, Result};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber. Logs go to stderr so stdout stays
/// reserved for reports. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str, json: bool) -> Result<()> {
    INSTALLED
        .get_or_try_init(|| {
            let filter = build_filter(level)?;
            let registry = tracing_subscriber::registry().with(filter);
            let installed = if json {
                registry
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .try_init()
            } else {
                registry
                    .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                    .try_init()
            };
            // Another subscriber (e.g. a test harness) already owns the global slot.
            if let Err(err) = installed {
                tracing::debug!(error = %err, "tracing subscriber already installed");
            }
            Ok(())
        })
        .map(|_| ())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level)
        .map_err(|err| OrchestratorError::Telemetry(format!("invalid log level '{level}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("debug", false).expect("first init");
        init("info", true).expect("second init is a no-op");
    }

    #[test]
    fn filter_accepts_directives() {
        if std::env::var("RUST_LOG").is_ok() {
            eprintln!("RUST_LOG set; skipping filter test");
            return;
        }
        assert!(build_filter("deploy_orchestrator=debug,reqwest=warn").is_ok());
    }
}

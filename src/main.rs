use clap::Parser;

use deploy_orchestrator::{
    apply,
    config::{CliArgs, OrchestratorConfig},
};

/// Exit status for aborted runs and configuration errors.
const EXIT_ABORTED: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    match OrchestratorConfig::from_env_and_args(cli) {
        Ok(config) => match apply::run(config).await {
            Ok(outcome) => std::process::exit(outcome.exit_code()),
            Err(err) => {
                eprintln!("error: {err}");
                std::process::exit(EXIT_ABORTED);
            }
        },
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(EXIT_ABORTED);
        }
    }
}

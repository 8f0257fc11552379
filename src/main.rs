//! benchkit: sweep a config field and plot client completion time
//!
//! Runs the external build, server and client commands, measures each
//! client run, and writes a chart of mean ± confidence interval per
//! condition. Configuration via CLI arguments or TOML file.

use benchkit::config::Config;
use benchkit::config_store::ConfigStore;
use benchkit::error::HarnessError;
use benchkit::interrupt::Interrupt;
use benchkit::process::ProcessController;
use benchkit::report;
use benchkit::runner::ExperimentRunner;
use benchkit::sampler::ProcessClient;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load().map_err(HarnessError::from)?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        artifact = %config.artifact.display(),
        field = %config.plan.field,
        conditions = ?config.plan.conditions,
        repetitions = config.plan.repetitions,
        confidence = config.plan.confidence,
        topology = ?config.plan.topology,
        failure_policy = ?config.plan.failure_policy,
        output = %config.output.display(),
        "Starting benchkit"
    );

    if let Err(e) = run(config) {
        error!(error = %e, "Experiment aborted");
        return Err(e.into());
    }
    Ok(())
}

fn run(config: Config) -> Result<(), HarnessError> {
    // Children are not in our process group, so Ctrl-C must go through us.
    let interrupt = Interrupt::install()?;

    let store = ConfigStore::new(&config.artifact);
    let controller = ProcessController::new(config.controller.clone());
    let client = ProcessClient::new(
        config.client.clone(),
        config.controller.working_dir.clone(),
        config.client_timeout,
        config.quiet_client,
    )
    .with_interrupt(interrupt.clone());

    let result = ExperimentRunner::new(config.plan.clone(), store, controller, client)
        .with_interrupt(interrupt)
        .run()?;

    if let Some(path) = &config.results {
        report::write_results(&result, path).map_err(|source| HarnessError::Results {
            path: path.clone(),
            source,
        })?;
    }
    report::render(&result, &config.chart, &config.output)?;
    Ok(())
}

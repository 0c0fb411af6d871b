//! Orchestration of a complete load test run.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::entity::OwnerFactory;
use crate::error::Result;
use crate::executor::Executor;
use crate::metrics::{self, Metrics};
use crate::remote::SharedRemote;
use crate::report::{self, RunReport};
use crate::schedule;
use crate::setup;
use crate::vu::RunContext;

/// Runs the configured scenario against `remote` and returns its report.
///
/// The run goes through three phases: seeding baseline owners (or loading them from the seed
/// file), driving the profile's schedule, and assembling the report. Cancelling `cancel` stops
/// the schedule early; the report is still produced and marked as interrupted.
///
/// # Errors
///
/// Fails before any load is generated if the configuration is invalid or the setup phase does
/// not finish within `setup_timeout`. Failed requests never fail the run.
pub async fn run(
    config: &Config,
    remote: SharedRemote,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let registry = config.registry()?;
    let profile = registry.get(&config.scenario)?.clone();
    let factory = OwnerFactory::new(config.phone_len)?;
    let selector = profile.weights.selector()?;

    let metrics = Arc::new(Metrics::new(config.error_samples_max));
    let executor = Executor::new(Arc::clone(&remote), Arc::clone(&metrics), config.retry);

    let started_at = Utc::now();
    let run_id = report::run_id(&profile.name, started_at);
    tracing::info!(
        run_id = %run_id,
        scenario = %profile.name,
        executor = profile.schedule.executor(),
        remote = remote.name(),
        "starting run"
    );

    let (seeds, setup) = if config.reuse_seeds && config.seed_file.exists() {
        setup::load_seed_file(&config.seed_file)?
    } else {
        setup::seed(
            &executor,
            &factory,
            config.seed_count,
            config.setup_pacing,
            config.setup_timeout,
        )
        .await?
    };

    let ctx = Arc::new(RunContext {
        executor,
        factory,
        selector,
        read_scope: profile.read_scope,
        pacing: profile.pacing,
        seeds: seeds.clone(),
    });

    let monitor = tokio::spawn(metrics::run_monitor(
        Arc::clone(&metrics),
        config.monitor_interval,
        metrics::log_window,
    ));

    let start = Instant::now();
    let outcome = schedule::drive(&profile.schedule, ctx, &cancel).await;
    monitor.abort();

    if outcome.interrupted {
        tracing::warn!("run interrupted before the schedule completed");
    }

    let snapshot = metrics.snapshot();
    let report = RunReport {
        run_id,
        scenario: profile.name.clone(),
        attribute: profile.attribute.clone(),
        base_url: config.base_url.clone(),
        started_at,
        duration: start.elapsed(),
        interrupted: outcome.interrupted,
        thresholds: profile.thresholds.evaluate(&snapshot),
        metrics: snapshot,
        setup,
        error_samples: metrics.error_samples(),
        seed_ids: seeds.ids().to_vec(),
    };

    tracing::info!(
        requests = report.metrics.requests,
        passed = report.passed(),
        "run finished"
    );
    Ok(report)
}

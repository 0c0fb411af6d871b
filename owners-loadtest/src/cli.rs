use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::config::{Config, Overrides};
use crate::profile::Registry;
use crate::{observability, remote, runner};

/// Process exit code when at least one threshold was crossed.
pub const THRESHOLDS_FAILED: u8 = 99;

/// Load generator for the owners API.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// traffic-shape profile to run, overriding the configuration
    #[argh(option, short = 's')]
    pub scenario: Option<String>,

    /// base URL of the owners API, or `memory://` for a dry run
    #[argh(option)]
    pub base_url: Option<String>,

    #[argh(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    List(ListCommand),
}

/// run the selected scenario (default)
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// list all available traffic-shape profiles
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "list")]
struct ListCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<ExitCode> {
    let args: Args = argh::from_env();

    let overrides = Overrides {
        scenario: args.scenario,
        base_url: args.base_url,
    };
    let config = Config::load(args.config.as_deref(), &overrides)
        .context("failed to load configuration")?;

    if let Some(Command::List(ListCommand {})) = args.command {
        print_profiles(&config.registry()?);
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("loadtest-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(config.debug);
    tracing::debug!(?config);

    let remote = remote::from_base_url(&config.base_url, config.request_timeout)?;

    let report = runtime.block_on(async {
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("received ctrl-c, stopping virtual users");
                    cancel.cancel();
                }
            }
        });

        let bar = ProgressBar::new_spinner()
            .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
            .with_message(format!("Running scenario {}:", config.scenario));
        bar.enable_steady_tick(Duration::from_millis(100));

        let result = runner::run(&config, remote, cancel).await;
        bar.finish_and_clear();
        anyhow::Ok(result?)
    })?;

    report.print();
    let paths = report
        .write_artifacts(&config.output_dir, &config.seed_file)
        .context("failed to write run artifacts")?;
    for path in paths {
        println!("wrote {}", path.display());
    }

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", "thresholds crossed".bold().red());
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}

fn print_profiles(registry: &Registry) {
    for profile in registry.profiles() {
        let schedule = &profile.schedule;
        println!(
            "{} ({})",
            profile.name.as_str().bold().blue(),
            profile.attribute
        );
        println!(
            "  {}: up to {} vus over {:?}; pacing {:?}",
            schedule.executor(),
            schedule.max_vus().bold(),
            schedule.total_duration(),
            profile.pacing
        );
        let weights: Vec<_> = profile
            .weights
            .weights()
            .iter()
            .map(|w| format!("{}={}", w.action, w.weight))
            .collect();
        println!("  weights: {}", weights.join(", "));
    }
}

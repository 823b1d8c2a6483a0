// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError, PartestExitCode, Result,
    output::{OutputContext, OutputOpts},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use partest_runner::{
    aggregator::ConsolidatedResult,
    config::{PartestConfig, PartestProfile, WorkerCount, default_config_root},
    reporter::{TestReporter, TestReporterBuilder},
    runner::{ProcessSpawner, TestRunnerBuilder},
    signal::SignalHandlerKind,
    suite::TestSuite,
    worker::run_worker_process,
};
use std::io;
use tracing::{debug, warn};

/// The number of slowest tests shown when the profile records durations but `--durations` isn't
/// passed.
const DEFAULT_SLOWEST: usize = 10;

/// A test harness that runs a suite across parallel worker processes.
///
/// Test binaries call [`exec`](Self::exec) with their suite from `main`. Run without a
/// subcommand, the binary coordinates a run; the hidden worker subcommand is how it re-runs itself
/// to execute one partition.
#[derive(Debug, Parser)]
#[command(version, styles = crate::output::clap_styles::style())]
pub struct PartestApp {
    #[command(subcommand)]
    subcommand: Option<PartestSubcommand>,

    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(flatten)]
    runner_opts: TestRunnerOpts,

    #[clap(flatten)]
    reporter_opts: ReporterOpts,
}

impl PartestApp {
    /// Initializes logging and color support, and returns the output context.
    pub fn init_output(&self) -> OutputContext {
        match self.subcommand {
            Some(PartestSubcommand::Worker) => OutputContext::color_never_init(),
            None => self.output.init(),
        }
    }

    /// Executes the app against `suite`, returning the process exit code on success.
    pub fn exec(self, suite: TestSuite, output: OutputContext) -> Result<i32> {
        match self.subcommand {
            Some(PartestSubcommand::Worker) => exec_worker(&suite),
            None => {
                let app = App::new(self.config_opts)?;
                app.exec_run(suite, output, &self.runner_opts, &self.reporter_opts)
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum PartestSubcommand {
    /// Private command, used to run one partition in a worker process.
    #[command(name = partest_runner::runner::WORKER_SUBCOMMAND, hide = true)]
    Worker,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Config options")]
struct ConfigOpts {
    /// Config file [default: .config/partest.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// The partest profile to use.
    ///
    /// Each profile is a set of settings for a run. Unset keys fall back to the default profile.
    #[arg(long, short = 'P', env = "PARTEST_PROFILE", global = true)]
    profile: Option<String>,
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "Runner options")]
struct TestRunnerOpts {
    /// Number of worker processes to run: a positive integer or "num-cpus"
    #[arg(
        long,
        short = 'j',
        visible_alias = "jobs",
        value_name = "WORKERS",
        env = "PARTEST_WORKERS"
    )]
    workers: Option<WorkerCount>,

    /// Cancel the run on the first failure
    #[arg(long, overrides_with = "no_fail_fast")]
    fail_fast: bool,

    /// Run all tests regardless of failure
    #[arg(long, overrides_with = "fail_fast")]
    no_fail_fast: bool,
}

impl TestRunnerOpts {
    fn to_builder(
        &self,
        profile: &PartestProfile<'_>,
        reporter_opts: &ReporterOpts,
    ) -> TestRunnerBuilder {
        let mut builder = TestRunnerBuilder::from_profile(profile);
        if let Some(workers) = self.workers {
            builder.set_workers(workers);
            debug!(%workers, "set workers");
        }
        if self.no_fail_fast {
            builder.set_fail_fast(false);
        } else if self.fail_fast {
            builder.set_fail_fast(true);
        }
        if reporter_opts.durations.is_some() {
            builder.set_durations(true);
        }
        builder
    }
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "Reporter options")]
struct ReporterOpts {
    /// Show the N slowest tests at the end of the run (0 shows all)
    #[arg(long, value_name = "N")]
    durations: Option<usize>,
}

impl ReporterOpts {
    fn to_builder(&self, profile: &PartestProfile<'_>, verbose: bool) -> TestReporterBuilder {
        let slowest = self
            .durations
            .or_else(|| profile.durations().then_some(DEFAULT_SLOWEST));

        let mut builder = TestReporterBuilder::default();
        builder.set_verbose(verbose).set_slowest(slowest);
        builder
    }
}

struct App {
    config: PartestConfig,
    profile_name: String,
}

impl App {
    fn new(config_opts: ConfigOpts) -> Result<Self> {
        let root = default_config_root();
        let config = PartestConfig::from_sources(&root, config_opts.config_file.as_deref())?;
        let profile_name = config_opts
            .profile
            .unwrap_or_else(|| PartestConfig::DEFAULT_PROFILE.to_owned());
        Ok(Self {
            config,
            profile_name,
        })
    }

    fn exec_run(
        &self,
        suite: TestSuite,
        output: OutputContext,
        runner_opts: &TestRunnerOpts,
        reporter_opts: &ReporterOpts,
    ) -> Result<i32> {
        let profile = self.config.profile(&self.profile_name)?;

        let runner_builder = runner_opts.to_builder(&profile, reporter_opts);
        let mut reporter = reporter_opts.to_builder(&profile, output.verbose).build();
        if output.color.should_colorize(supports_color::Stream::Stderr) {
            reporter.colorize();
        }

        let units = suite.units();
        if units.is_empty() {
            warn!("no tests to run");
        }

        let spawner = ProcessSpawner::current_exe()?;
        let runner = runner_builder.build(units, &spawner, SignalHandlerKind::Standard)?;
        debug!(
            profile = profile.name(),
            partitions = runner.partitions().len(),
            "starting test run",
        );

        let mut write_error = None;
        let res = runner.execute(|event| {
            if write_error.is_some() {
                return;
            }
            if let Err(err) = reporter.report_event(&event, io::stderr()) {
                write_error = Some(err);
            }
        });

        let result = match res {
            Ok(result) => result,
            Err(err) => {
                if let Some(partial) = err.partial_result() {
                    report_summary(&reporter, partial)?;
                }
                return Err(err.into());
            }
        };
        if let Some(err) = write_error {
            return Err(ExpectedError::write_output(err));
        }
        report_summary(&reporter, &result)?;

        if result.was_successful() {
            Ok(PartestExitCode::OK)
        } else {
            Err(ExpectedError::TestRunFailed)
        }
    }
}

fn report_summary(reporter: &TestReporter, result: &ConsolidatedResult) -> Result<()> {
    reporter
        .report_summary(result, io::stderr())
        .map_err(ExpectedError::write_output)
}

fn exec_worker(suite: &TestSuite) -> Result<i32> {
    // Stdout carries the event stream. It isn't locked for the whole run, since test code on other
    // threads may print to it too.
    let summary = run_worker_process(suite, io::stdin().lock(), io::stdout())?;
    debug!(
        started = summary.started,
        failed = summary.failed,
        stopped_early = summary.stopped_early,
        "worker finished",
    );
    Ok(PartestExitCode::OK)
}

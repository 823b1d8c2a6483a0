// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints out test execution statuses and the final report.
//!
//! The main structure in this module is [`TestReporter`].

use crate::{
    aggregator::{ConsolidatedResult, ReportedFailure},
    event::{Event, SubTestOutcome},
    runner::{CancelReason, RunnerEvent},
};
use owo_colors::{OwoColorize, Style};
use std::{
    fmt,
    io::{self, Write},
};

const SEPARATOR_HEAVY: &str =
    "======================================================================";
const SEPARATOR_LIGHT: &str =
    "----------------------------------------------------------------------";

/// Test reporter builder.
#[derive(Clone, Debug, Default)]
pub struct TestReporterBuilder {
    verbose: bool,
    slowest: Option<usize>,
}

impl TestReporterBuilder {
    /// Also prints test starts and worker exits.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Prints the `n` slowest tests at the end of the run, or all of them if `n` is 0.
    pub fn set_slowest(&mut self, slowest: Option<usize>) -> &mut Self {
        self.slowest = slowest;
        self
    }

    /// Creates a new test reporter.
    pub fn build(&self) -> TestReporter {
        TestReporter {
            verbose: self.verbose,
            slowest: self.slowest,
            styles: Box::default(),
        }
    }
}

/// Functionality to report test results to stderr and stdout.
#[derive(Debug)]
pub struct TestReporter {
    verbose: bool,
    slowest: Option<usize>,
    styles: Box<Styles>,
}

impl TestReporter {
    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Reports a single event as it happens.
    pub fn report_event(&self, event: &RunnerEvent<'_>, mut writer: impl Write) -> io::Result<()> {
        match event {
            RunnerEvent::RunStarted { workers, units } => {
                writeln!(
                    writer,
                    "{:>12} {} tests across {} workers",
                    "Starting".style(self.styles.pass),
                    units.style(self.styles.count),
                    workers.style(self.styles.count),
                )?;
            }
            RunnerEvent::Test {
                worker,
                identity: Some(identity),
                event,
            } => {
                let Some((status, style)) = self.status_for(event) else {
                    return Ok(());
                };
                write!(
                    writer,
                    "{:>12} [{:>9}] {}",
                    status.style(style),
                    worker.to_string(),
                    identity.id().style(self.styles.test_name),
                )?;
                if let Event::Skip { reason, .. }
                | Event::SubTestResult {
                    outcome: SubTestOutcome::Skip { reason },
                    ..
                } = event
                {
                    write!(writer, ": {reason}")?;
                }
                writeln!(writer)?;
            }
            RunnerEvent::Test { identity: None, .. } => {}
            RunnerEvent::WorkerOutput { line, .. } => {
                writeln!(writer, "{line}")?;
            }
            RunnerEvent::WorkerExited { worker, exit } => {
                if !exit.is_success() {
                    writeln!(
                        writer,
                        "{:>12} {worker} {exit}",
                        "WORKER".style(self.styles.fail),
                    )?;
                } else if self.verbose {
                    writeln!(writer, "{:>12} {worker} {exit}", "WORKER".style(self.styles.pass))?;
                }
            }
            RunnerEvent::Cancelling { reason } => {
                writeln!(
                    writer,
                    "{:>12} due to {}",
                    "Cancelling".style(self.styles.fail),
                    DisplayCancelReason(*reason),
                )?;
            }
        }
        Ok(())
    }

    /// Writes the final report: every error and failure with its traceback, the slowest tests if
    /// requested, and a summary line.
    pub fn report_summary(
        &self,
        result: &ConsolidatedResult,
        mut writer: impl Write,
    ) -> io::Result<()> {
        for error in &result.errors {
            self.write_failure_block(&mut writer, "ERROR", error)?;
        }
        for failure in &result.failures {
            self.write_failure_block(&mut writer, "FAIL", failure)?;
        }

        if let Some(slowest) = self.slowest {
            let durations = result.slowest();
            let count = match slowest {
                0 => durations.len(),
                n => n.min(durations.len()),
            };
            writeln!(writer)?;
            writeln!(writer, "Slowest test durations")?;
            writeln!(writer, "{SEPARATOR_LIGHT}")?;
            for (id, seconds) in &durations[..count] {
                writeln!(writer, "{seconds:>8.3}s {id}")?;
            }
        }

        writeln!(writer, "{SEPARATOR_LIGHT}")?;
        let noun = if result.tests_run == 1 { "test" } else { "tests" };
        writeln!(
            writer,
            "Ran {} {noun} in {:.3}s",
            result.tests_run.style(self.styles.count),
            result.elapsed.as_secs_f64(),
        )?;
        writeln!(writer)?;

        let mut infos = Vec::new();
        if !result.failures.is_empty() {
            infos.push(format!("failures={}", result.failures.len()));
        }
        if !result.errors.is_empty() {
            infos.push(format!("errors={}", result.errors.len()));
        }
        if !result.skipped.is_empty() {
            infos.push(format!("skipped={}", result.skipped.len()));
        }
        if !result.expected_failures.is_empty() {
            infos.push(format!("expected failures={}", result.expected_failures.len()));
        }
        if !result.unexpected_successes.is_empty() {
            infos.push(format!(
                "unexpected successes={}",
                result.unexpected_successes.len()
            ));
        }

        if result.was_successful() {
            write!(writer, "{}", "OK".style(self.styles.pass))?;
        } else {
            write!(writer, "{}", "FAILED".style(self.styles.fail))?;
        }
        if !infos.is_empty() {
            write!(writer, " ({})", infos.join(", "))?;
        }
        if result.stopped_early {
            write!(writer, " [stopped early]")?;
        }
        writeln!(writer)
    }

    // ---
    // Helper methods
    // ---

    fn status_for(&self, event: &Event) -> Option<(&'static str, Style)> {
        let styles = &self.styles;
        let status = match event {
            Event::Started { .. } if self.verbose => ("START", styles.count),
            Event::Started { .. } | Event::Duration { .. } => return None,
            Event::Success { .. } => ("PASS", styles.pass),
            Event::Failure { .. } => ("FAIL", styles.fail),
            Event::Error { .. } => ("ERROR", styles.fail),
            Event::Skip { .. } => ("SKIP", styles.skip),
            Event::ExpectedFailure { .. } => ("XFAIL", styles.skip),
            Event::UnexpectedSuccess { .. } => ("XPASS", styles.fail),
            Event::SubTestResult { outcome, .. } => match outcome {
                SubTestOutcome::Success if self.verbose => ("SUBPASS", styles.pass),
                SubTestOutcome::Success => return None,
                SubTestOutcome::Failure { .. } => ("SUBFAIL", styles.fail),
                SubTestOutcome::Error { .. } => ("SUBERROR", styles.fail),
                SubTestOutcome::Skip { .. } => ("SUBSKIP", styles.skip),
            },
        };
        Some(status)
    }

    fn write_failure_block(
        &self,
        writer: &mut impl Write,
        label: &str,
        failure: &ReportedFailure,
    ) -> io::Result<()> {
        writeln!(writer, "{SEPARATOR_HEAVY}")?;
        writeln!(
            writer,
            "{}: {}",
            label.style(self.styles.fail),
            failure.identity.id().style(self.styles.test_name),
        )?;
        writeln!(writer, "{SEPARATOR_LIGHT}")?;
        writeln!(writer, "{}", failure.traceback.style(self.styles.fail_output))?;
        writeln!(writer)
    }
}

struct DisplayCancelReason(CancelReason);

impl fmt::Display for DisplayCancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            CancelReason::FailFast => write!(f, "test failure"),
            CancelReason::WorkerFailed => write!(f, "worker failure"),
            CancelReason::Signal(signal) => write!(f, "{signal}"),
        }
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    fail_output: Style,
    skip: Style,
    test_name: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.fail_output = Style::new().magenta();
        self.skip = Style::new().yellow().bold();
        self.test_name = Style::new().blue().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregator::TestIdentity, codec::ExceptionPayload, partition::WorkerId, runner::WorkerExit,
        suite::TestUnit,
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn failure(identity: TestIdentity, traceback: &str) -> ReportedFailure {
        let payload = ExceptionPayload::transport_failure(traceback);
        ReportedFailure {
            identity,
            traceback: traceback.to_owned(),
            payload,
        }
    }

    fn render(reporter: &TestReporter, result: &ConsolidatedResult) -> String {
        let mut out = Vec::new();
        reporter.report_summary(result, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn summary_ok() {
        let reporter = TestReporterBuilder::default().build();
        let result = ConsolidatedResult {
            tests_run: 3,
            successes: 2,
            skipped: vec![(
                TestIdentity::Unit(TestUnit::new("g", "s")),
                "later".to_owned(),
            )],
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };

        assert_eq!(
            render(&reporter, &result),
            indoc! {"
                ----------------------------------------------------------------------
                Ran 3 tests in 1.500s

                OK (skipped=1)
            "}
        );
    }

    #[test]
    fn summary_failed() {
        let mut builder = TestReporterBuilder::default();
        builder.set_slowest(Some(1));
        let reporter = builder.build();
        let result = ConsolidatedResult {
            tests_run: 1,
            errors: vec![failure(
                TestIdentity::Placeholder("setup (g::setup)".to_owned()),
                "setup traceback",
            )],
            failures: vec![failure(
                TestIdentity::SubTest {
                    parent: TestUnit::new("g", "t"),
                    label: "(i=1)".to_owned(),
                },
                "subtest traceback",
            )],
            durations: vec![("g::t".to_owned(), 0.25), ("g::u".to_owned(), 1.0)],
            ..Default::default()
        };

        assert_eq!(
            render(&reporter, &result),
            indoc! {"
                ======================================================================
                ERROR: setup (g::setup)
                ----------------------------------------------------------------------
                setup traceback

                ======================================================================
                FAIL: g::t (i=1)
                ----------------------------------------------------------------------
                subtest traceback


                Slowest test durations
                ----------------------------------------------------------------------
                   1.000s g::u
                ----------------------------------------------------------------------
                Ran 1 test in 0.000s

                FAILED (failures=1, errors=1)
            "}
        );
    }

    #[test]
    fn status_lines() {
        let reporter = TestReporterBuilder::default().build();
        let identity = TestIdentity::Unit(TestUnit::new("g", "t"));
        let mut out = Vec::new();

        for event in [
            Event::Started { index: 0 },
            Event::Skip {
                index: 0,
                reason: "flaky".to_owned(),
            },
        ] {
            reporter
                .report_event(
                    &RunnerEvent::Test {
                        worker: WorkerId::new(1),
                        identity: Some(&identity),
                        event: &event,
                    },
                    &mut out,
                )
                .unwrap();
        }
        reporter
            .report_event(
                &RunnerEvent::WorkerExited {
                    worker: WorkerId::new(1),
                    exit: &WorkerExit::Code(2),
                },
                &mut out,
            )
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "        SKIP [ worker-1] g::t: flaky\n      WORKER worker-1 exited with code 2\n",
        );
    }
}

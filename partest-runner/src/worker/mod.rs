// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a partition inside a worker.
//!
//! The main structure in this module is [`WorkerRunner`]. It runs each unit of its partition in
//! order and reports an [`Event`] for every lifecycle callback: `Started`, then exactly one terminal
//! outcome, with `SubTestResult`s in between for subtests and an optional `Duration` after.
//!
//! Group setup and teardown hooks run once per group, around that group's contiguous run of units.
//! If a setup hook fails, no unit of the group has started yet, so the failure is reported with a
//! label instead of an index.

mod context;
mod panic;
mod sink;

pub use context::*;
pub use sink::*;

use crate::{
    codec::{ExceptionPayload, TestError, TestErrorKind},
    errors::WorkerError,
    event::{Event, Subject},
    partition::Partition,
    suite::{Expectation, HookFn, TestCase, TestGroup, TestSuite, TestUnit},
    time::{StopwatchStart, stopwatch},
};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Options that control how a worker runs its partition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerOptions {
    /// Emit a `Duration` event after every unit.
    pub durations: bool,

    /// Stop after the first failing unit.
    pub fail_fast: bool,
}

/// Everything a worker process is given: its partition, and how to run it.
///
/// Sent to worker processes as JSON on stdin.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    /// The units to run.
    pub partition: Partition,

    /// How to run them.
    pub options: WorkerOptions,
}

/// Counts of what a worker did, for logging.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkerSummary {
    /// Units that were started.
    pub started: usize,

    /// Units that failed, errored or unexpectedly passed.
    pub failed: usize,

    /// Units that were never started, because their group's setup failed or the worker stopped
    /// early.
    pub not_started: usize,

    /// True if the worker stopped early because of fail-fast.
    pub stopped_early: bool,
}

/// Runs partitions of a [`TestSuite`].
#[derive(Clone, Copy, Debug)]
pub struct WorkerRunner<'s> {
    suite: &'s TestSuite,
    options: WorkerOptions,
}

impl<'s> WorkerRunner<'s> {
    /// Creates a new runner.
    pub fn new(suite: &'s TestSuite, options: WorkerOptions) -> Self {
        Self { suite, options }
    }

    /// Runs every unit in `partition`, in order, sending events to `sink`.
    ///
    /// Test failures are reported as events, never as errors. An error is returned if a unit
    /// doesn't exist in the suite (checked before anything runs) or if the sink fails.
    pub fn run(
        &self,
        partition: &Partition,
        sink: &mut dyn EventSink,
    ) -> Result<WorkerSummary, WorkerError> {
        panic::install_hook();

        let resolved = partition
            .units()
            .iter()
            .map(|unit| {
                self.suite
                    .resolve(unit)
                    .ok_or_else(|| WorkerError::UnknownUnit { unit: unit.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut summary = WorkerSummary::default();
        let mut current: Option<GroupState<'s>> = None;

        for (index, (unit, (group, case))) in partition.units().iter().zip(resolved).enumerate() {
            if summary.stopped_early {
                summary.not_started += 1;
                continue;
            }

            let state = match current.take() {
                Some(state) if state.group.name() == group.name() => current.insert(state),
                previous => {
                    if let Some(previous) = previous {
                        self.finish_group(previous, sink)?;
                    }
                    let state = self.start_group(group, sink)?;
                    if state.status == GroupStatus::SetupFailed && self.options.fail_fast {
                        summary.stopped_early = true;
                    }
                    current.insert(state)
                }
            };
            match &state.status {
                GroupStatus::Ready => {}
                GroupStatus::SetupFailed => {
                    summary.not_started += 1;
                    continue;
                }
                GroupStatus::Skipped(reason) => {
                    sink.emit(Event::Started { index })?;
                    let stopwatch = stopwatch();
                    sink.emit(Event::Skip {
                        index,
                        reason: reason.clone(),
                    })?;
                    self.emit_duration(unit, stopwatch, sink)?;
                    summary.started += 1;
                    continue;
                }
            }

            summary.started += 1;
            if self.run_case(index, unit, case, sink)? {
                summary.failed += 1;
                if self.options.fail_fast {
                    debug!("{unit} failed, stopping early");
                    summary.stopped_early = true;
                }
            }
        }

        if let Some(previous) = current.take() {
            self.finish_group(previous, sink)?;
        }

        debug!(
            worker = %partition.worker(),
            started = summary.started,
            failed = summary.failed,
            not_started = summary.not_started,
            "partition finished",
        );
        Ok(summary)
    }

    fn start_group(
        &self,
        group: &'s TestGroup,
        sink: &mut dyn EventSink,
    ) -> Result<GroupState<'s>, WorkerError> {
        let status = match group.setup_hook().map(run_hook) {
            None | Some(Ok(())) => GroupStatus::Ready,
            Some(Err(error)) => match error.kind() {
                TestErrorKind::Skip(reason) => GroupStatus::Skipped(reason.clone()),
                TestErrorKind::Failure | TestErrorKind::Error => {
                    debug!("setup for group {} failed: {error}", group.name());
                    sink.emit(Event::Error {
                        subject: Subject::ByLabel(group.setup_label()),
                        payload: error.encode(),
                    })?;
                    GroupStatus::SetupFailed
                }
            },
        };
        Ok(GroupState { group, status })
    }

    fn finish_group(
        &self,
        state: GroupState<'s>,
        sink: &mut dyn EventSink,
    ) -> Result<(), WorkerError> {
        // Teardown only pairs with a setup that succeeded.
        if state.status != GroupStatus::Ready {
            return Ok(());
        }
        if let Some(Err(error)) = state.group.teardown_hook().map(run_hook) {
            if !matches!(error.kind(), TestErrorKind::Skip(_)) {
                sink.emit(Event::Error {
                    subject: Subject::ByLabel(state.group.teardown_label()),
                    payload: error.encode(),
                })?;
            }
        }
        Ok(())
    }

    /// Runs a single case. Returns true if it counts as a failure.
    fn run_case(
        &self,
        index: usize,
        unit: &TestUnit,
        case: &TestCase,
        sink: &mut dyn EventSink,
    ) -> Result<bool, WorkerError> {
        sink.emit(Event::Started { index })?;
        let stopwatch = stopwatch();

        let failed = match case.skip_reason() {
            Some(reason) => {
                sink.emit(Event::Skip {
                    index,
                    reason: reason.to_owned(),
                })?;
                false
            }
            None => {
                let mut cx = TestContext::new(index, case.expectation(), sink);
                let body = case.body();
                let res = panic::catch(|| body(&mut cx)).and_then(|res| res);
                let outcome = cx.finish();
                if let Some(error) = outcome.emit_error {
                    return Err(error.into());
                }

                let (event, failed) = terminal_event(
                    index,
                    case.expectation(),
                    res,
                    outcome.subtest_failures,
                    outcome.first_failure,
                );
                if let Some(event) = event {
                    sink.emit(event)?;
                }
                failed
            }
        };

        self.emit_duration(unit, stopwatch, sink)?;
        Ok(failed)
    }

    fn emit_duration(
        &self,
        unit: &TestUnit,
        stopwatch: StopwatchStart,
        sink: &mut dyn EventSink,
    ) -> Result<(), WorkerError> {
        if self.options.durations {
            sink.emit(Event::Duration {
                id: unit.id(),
                seconds: stopwatch.snapshot().duration.as_secs_f64(),
            })?;
        }
        Ok(())
    }
}

/// Reads a [`WorkerAssignment`] as JSON from `input`, runs it, and writes events to `output`.
///
/// This is the body of a worker process.
pub fn run_worker_process(
    suite: &TestSuite,
    input: impl Read,
    output: impl Write,
) -> Result<WorkerSummary, WorkerError> {
    let assignment: WorkerAssignment =
        serde_json::from_reader(input).map_err(WorkerError::ReadAssignment)?;
    debug!(
        worker = %assignment.partition.worker(),
        units = assignment.partition.len(),
        "worker received assignment",
    );
    let mut sink = JsonLinesSink::new(output);
    WorkerRunner::new(suite, assignment.options).run(&assignment.partition, &mut sink)
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum GroupStatus {
    Ready,
    SetupFailed,
    Skipped(String),
}

#[derive(Debug)]
struct GroupState<'s> {
    group: &'s TestGroup,
    status: GroupStatus,
}

fn run_hook(hook: HookFn) -> Result<(), TestError> {
    panic::catch(hook).and_then(|res| res)
}

/// Decides the terminal event for a case that ran, and whether it counts as a failure.
///
/// A case whose body returned normally but had failing subtests gets no terminal event: the failing
/// subtests already describe its outcome.
fn terminal_event(
    index: usize,
    expectation: Expectation,
    res: Result<(), TestError>,
    subtest_failures: usize,
    first_failure: Option<ExceptionPayload>,
) -> (Option<Event>, bool) {
    let res = match res {
        Err(error) => match error.kind() {
            TestErrorKind::Skip(reason) => {
                let reason = reason.clone();
                return (Some(Event::Skip { index, reason }), false);
            }
            _ => Err(error),
        },
        Ok(()) => Ok(()),
    };

    match (expectation, res) {
        (Expectation::Pass, Ok(())) if subtest_failures > 0 => (None, true),
        (Expectation::Pass, Ok(())) => (Some(Event::Success { index }), false),
        (Expectation::Pass, Err(error)) => {
            let payload = error.encode();
            let event = match error.kind() {
                TestErrorKind::Failure => Event::Failure { index, payload },
                _ => Event::Error {
                    subject: Subject::ByIndex(index),
                    payload,
                },
            };
            (Some(event), true)
        }
        (Expectation::Failure, Ok(())) => match first_failure {
            Some(payload) => (Some(Event::ExpectedFailure { index, payload }), false),
            None => (Some(Event::UnexpectedSuccess { index }), true),
        },
        (Expectation::Failure, Err(error)) => (
            Some(Event::ExpectedFailure {
                index,
                payload: error.encode(),
            }),
            false,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{PANIC_TYPE, TRANSPORT_FAILURE_TYPE},
        event::SubTestOutcome,
        partition::WorkerId,
        suite::TestGroup,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn pass(_: &mut TestContext<'_>) -> Result<(), TestError> {
        Ok(())
    }

    fn fail(_: &mut TestContext<'_>) -> Result<(), TestError> {
        Err(TestError::failure("0 != 1"))
    }

    fn error(_: &mut TestContext<'_>) -> Result<(), TestError> {
        Err(std::io::Error::other("woops"))?;
        Ok(())
    }

    fn panics(_: &mut TestContext<'_>) -> Result<(), TestError> {
        assert_eq!(1 + 1, 3, "math is broken");
        Ok(())
    }

    fn skips(_: &mut TestContext<'_>) -> Result<(), TestError> {
        Err(TestError::skip("not on this platform"))
    }

    fn failing_subtests(cx: &mut TestContext<'_>) -> Result<(), TestError> {
        for i in 0..3 {
            cx.subtest(SubTestLabel::new().param("index", i), || {
                if i == 1 {
                    Ok(())
                } else {
                    Err(TestError::failure(format!("{i} != 1")))
                }
            });
        }
        Ok(())
    }

    fn unserializable_subtest(cx: &mut TestContext<'_>) -> Result<(), TestError> {
        cx.subtest(SubTestLabel::message("cannot serialize a raw buffer"), || {
            let mut buffers = HashMap::new();
            buffers.insert((0u8, 0u8), vec![0u8]);
            Err(TestError::failure("expected failure").with_detail(buffers))
        });
        Ok(())
    }

    fn failing_hook() -> Result<(), TestError> {
        Err(TestError::error(std::io::Error::other("Intentional error")))
    }

    fn skipping_hook() -> Result<(), TestError> {
        Err(TestError::skip("group disabled"))
    }

    fn run(suite: &TestSuite, options: WorkerOptions) -> (Vec<Event>, WorkerSummary) {
        let partition = Partition::new(WorkerId::new(0), suite.units());
        let mut events = Vec::new();
        let summary = WorkerRunner::new(suite, options)
            .run(&partition, &mut events)
            .expect("worker run succeeded");
        (events, summary)
    }

    #[test]
    fn outcomes_in_order() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .case(TestCase::new("pass", pass))
                .case(TestCase::new("fail", fail))
                .case(TestCase::new("error", error))
                .case(TestCase::new("skip", pass).skip("always"))
                .case(TestCase::new("skips", skips))
                .case(TestCase::new("xfail", fail).expected_failure())
                .case(TestCase::new("xpass", pass).expected_failure()),
        );
        let (events, summary) = run(&suite, WorkerOptions::default());

        let kinds: Vec<_> = events.iter().map(|e| (e.kind_str(), e.index())).collect();
        assert_eq!(
            kinds,
            vec![
                ("started", Some(0)),
                ("success", Some(0)),
                ("started", Some(1)),
                ("failure", Some(1)),
                ("started", Some(2)),
                ("error", Some(2)),
                ("started", Some(3)),
                ("skip", Some(3)),
                ("started", Some(4)),
                ("skip", Some(4)),
                ("started", Some(5)),
                ("expected-failure", Some(5)),
                ("started", Some(6)),
                ("unexpected-success", Some(6)),
            ]
        );
        assert_eq!(summary.started, 7);
        assert_eq!(summary.failed, 3);
    }

    #[test]
    fn panics_are_failures() {
        let suite = TestSuite::new().group(TestGroup::new("g").case(TestCase::new("p", panics)));
        let (events, _) = run(&suite, WorkerOptions::default());

        match &events[1] {
            Event::Failure { index: 0, payload } => {
                assert_eq!(payload.type_name(), PANIC_TYPE);
                assert!(payload.message().contains("math is broken"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn subtests_nest_inside_parent() {
        let suite = TestSuite::new()
            .group(TestGroup::new("g").case(TestCase::new("dummy", failing_subtests)));
        let (events, summary) = run(&suite, WorkerOptions::default());

        // started, three subtests, and no terminal event since subtests failed.
        assert_eq!(events.len(), 4);
        let labels: Vec<_> = events[1..]
            .iter()
            .map(|event| match event {
                Event::SubTestResult {
                    index: 0,
                    label,
                    outcome,
                } => (label.as_str(), outcome.is_failure()),
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(
            labels,
            vec![("(index=0)", true), ("(index=1)", false), ("(index=2)", true)]
        );
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn untransportable_subtest_failure() {
        let suite = TestSuite::new()
            .group(TestGroup::new("g").case(TestCase::new("raw", unserializable_subtest)));
        let (events, _) = run(&suite, WorkerOptions::default());

        match &events[1] {
            Event::SubTestResult {
                outcome: SubTestOutcome::Failure { payload },
                ..
            } => {
                assert_eq!(payload.type_name(), TRANSPORT_FAILURE_TYPE);
                assert!(payload.traceback().contains("expected failure"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn expected_failure_absorbs_subtests() {
        let suite = TestSuite::new().group(
            TestGroup::new("g").case(TestCase::new("x", failing_subtests).expected_failure()),
        );
        let (events, summary) = run(&suite, WorkerOptions::default());

        let kinds: Vec<_> = events.iter().map(Event::kind_str).collect();
        assert_eq!(kinds, vec!["started", "subtest-result", "expected-failure"]);
        match &events[2] {
            Event::ExpectedFailure { payload, .. } => assert_eq!(payload.message(), "0 != 1"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn setup_failure_reports_label() {
        let suite = TestSuite::new()
            .group(
                TestGroup::new("always_fail")
                    .setup(failing_hook)
                    .case(TestCase::new("a", pass))
                    .case(TestCase::new("b", pass)),
            )
            .group(TestGroup::new("always_pass").case(TestCase::new("a", pass)));
        let (events, summary) = run(&suite, WorkerOptions::default());

        match &events[0] {
            Event::Error {
                subject: Subject::ByLabel(label),
                payload,
            } => {
                assert_eq!(label, "setup (always_fail::setup)");
                assert!(payload.traceback().contains("Intentional error"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The failing group's units never start; the next group's unit keeps its own index.
        assert_eq!(events[1], Event::Started { index: 2 });
        assert_eq!(events[2], Event::Success { index: 2 });
        assert_eq!(events.len(), 3);
        assert_eq!(summary.not_started, 2);
    }

    #[test]
    fn teardown_failure_reports_label() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .teardown(failing_hook)
                .case(TestCase::new("a", pass)),
        );
        let (events, _) = run(&suite, WorkerOptions::default());

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[2],
            Event::Error { subject: Subject::ByLabel(label), .. }
                if label == "teardown (g::teardown)"
        ));
    }

    #[test]
    fn skipped_setup_skips_group() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .setup(skipping_hook)
                .teardown(failing_hook)
                .case(TestCase::new("a", pass))
                .case(TestCase::new("b", pass)),
        );
        let (events, _) = run(&suite, WorkerOptions::default());

        let kinds: Vec<_> = events.iter().map(Event::kind_str).collect();
        // Teardown doesn't run because setup didn't succeed.
        assert_eq!(kinds, vec!["started", "skip", "started", "skip"]);
    }

    #[test]
    fn skipped_setup_still_records_durations() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .setup(skipping_hook)
                .case(TestCase::new("a", pass))
                .case(TestCase::new("b", pass)),
        );
        let (events, _) = run(
            &suite,
            WorkerOptions {
                durations: true,
                fail_fast: false,
            },
        );

        let kinds: Vec<_> = events.iter().map(Event::kind_str).collect();
        assert_eq!(
            kinds,
            vec!["started", "skip", "duration", "started", "skip", "duration"]
        );
    }

    #[test]
    fn durations_use_ids() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .case(TestCase::new("a", pass))
                .case(TestCase::new("b", fail)),
        );
        let (events, _) = run(
            &suite,
            WorkerOptions {
                durations: true,
                fail_fast: false,
            },
        );

        let ids: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Duration { id, seconds } => {
                    assert!(*seconds >= 0.0);
                    Some(id.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["g::a", "g::b"]);
    }

    #[test]
    fn fail_fast_stops_partition() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .case(TestCase::new("a", fail))
                .case(TestCase::new("b", pass))
                .case(TestCase::new("c", pass)),
        );
        let (events, summary) = run(
            &suite,
            WorkerOptions {
                durations: false,
                fail_fast: true,
            },
        );

        assert_eq!(events.len(), 2);
        assert!(summary.stopped_early);
        assert_eq!(summary.not_started, 2);
    }

    #[test]
    fn unknown_unit_is_an_error() {
        let suite = TestSuite::new().group(TestGroup::new("g").case(TestCase::new("a", pass)));
        let partition = Partition::new(WorkerId::new(0), vec![TestUnit::new("g", "missing")]);
        let mut events = Vec::new();

        let err = WorkerRunner::new(&suite, WorkerOptions::default())
            .run(&partition, &mut events)
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnknownUnit { .. }));
        assert!(events.is_empty(), "nothing runs before units are resolved");
    }

    #[test]
    fn worker_process_reads_assignment() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .case(TestCase::new("a", pass))
                .case(TestCase::new("b", pass)),
        );
        let assignment = WorkerAssignment {
            partition: Partition::new(WorkerId::new(1), vec![TestUnit::new("g", "b")]),
            options: WorkerOptions::default(),
        };
        let input = serde_json::to_vec(&assignment).unwrap();
        let mut output = Vec::new();

        let summary = run_worker_process(&suite, input.as_slice(), &mut output).unwrap();
        assert_eq!(summary.started, 1);

        let output = String::from_utf8(output).unwrap();
        let events: Vec<_> = output
            .lines()
            .map(|line| match WorkerLine::parse(line) {
                WorkerLine::Event { event: Ok(event), .. } => event,
                other => panic!("unexpected line: {other:?}"),
            })
            .collect();
        assert_eq!(
            events,
            vec![Event::Started { index: 0 }, Event::Success { index: 0 }]
        );
    }
}

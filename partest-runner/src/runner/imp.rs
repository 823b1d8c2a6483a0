// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{WorkerChannel, WorkerExit, WorkerMessage, WorkerSpawner};
use crate::{
    aggregator::{ConsolidatedResult, ResultAggregator, TestIdentity},
    config::{PartestProfile, WorkerCount},
    errors::{RunError, TestRunnerBuildError, WorkerFailure, WorkerFailureKind},
    event::Event,
    partition::{Partition, WorkerId, partition_units},
    signal::{ShutdownEvent, SignalHandler, SignalHandlerKind},
    suite::TestUnit,
    time::stopwatch,
    worker::{WorkerAssignment, WorkerOptions},
};
use std::{
    collections::{BTreeSet, HashMap},
    num::NonZeroUsize,
    time::Duration,
};
use tokio::{
    runtime::Runtime,
    sync::{broadcast, mpsc},
};
use tokio_stream::{StreamExt, StreamMap, wrappers::ReceiverStream};
use tracing::{debug, info, warn};

const DEFAULT_CHANNEL_CAPACITY: NonZeroUsize = NonZeroUsize::new(64).unwrap();

/// Test runner options.
#[derive(Clone, Debug)]
pub struct TestRunnerBuilder {
    workers: WorkerCount,
    fail_fast: bool,
    durations: bool,
    channel_capacity: NonZeroUsize,
    terminate_grace_period: Duration,
}

impl Default for TestRunnerBuilder {
    fn default() -> Self {
        Self {
            workers: WorkerCount::NumCpus,
            fail_fast: false,
            durations: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            terminate_grace_period: Duration::from_secs(2),
        }
    }
}

impl TestRunnerBuilder {
    /// Creates a builder with the settings from `profile`.
    pub fn from_profile(profile: &PartestProfile<'_>) -> Self {
        Self {
            workers: profile.workers(),
            fail_fast: profile.fail_fast(),
            durations: profile.durations(),
            channel_capacity: profile.channel_capacity(),
            terminate_grace_period: profile.terminate_grace_period(),
        }
    }

    /// Sets the number of workers.
    pub fn set_workers(&mut self, workers: WorkerCount) -> &mut Self {
        self.workers = workers;
        self
    }

    /// Stops the run after the first failure.
    pub fn set_fail_fast(&mut self, fail_fast: bool) -> &mut Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Records how long each unit takes.
    pub fn set_durations(&mut self, durations: bool) -> &mut Self {
        self.durations = durations;
        self
    }

    /// Sets the number of events buffered per worker.
    pub fn set_channel_capacity(&mut self, channel_capacity: NonZeroUsize) -> &mut Self {
        self.channel_capacity = channel_capacity;
        self
    }

    /// Sets how long a worker gets to exit after being asked to stop.
    pub fn set_terminate_grace_period(&mut self, grace_period: Duration) -> &mut Self {
        self.terminate_grace_period = grace_period;
        self
    }

    /// Creates a new test runner for `units`, starting workers through `spawner`.
    pub fn build<'a>(
        self,
        units: Vec<TestUnit>,
        spawner: &'a dyn WorkerSpawner,
        signal_handler: SignalHandlerKind,
    ) -> Result<TestRunner<'a>, TestRunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("partest-coordinator")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        Ok(self.build_with_handler(units, spawner, runtime, signal_handler))
    }

    fn build_with_handler<'a>(
        self,
        units: Vec<TestUnit>,
        spawner: &'a dyn WorkerSpawner,
        runtime: Runtime,
        signal_handler: SignalHandler,
    ) -> TestRunner<'a> {
        let partitions = partition_units(units, self.workers.compute());
        TestRunner {
            inner: TestRunnerInner {
                partitions,
                spawner,
                options: WorkerOptions {
                    durations: self.durations,
                    fail_fast: self.fail_fast,
                },
                channel_capacity: self.channel_capacity,
                terminate_grace_period: self.terminate_grace_period,
            },
            runtime,
            signal_handler,
        }
    }
}

/// Something that happened during a run, reported to the callback passed to
/// [`TestRunner::execute`].
#[derive(Clone, Debug)]
pub enum RunnerEvent<'a> {
    /// The run started.
    RunStarted {
        /// The number of workers.
        workers: usize,
        /// The total number of units.
        units: usize,
    },

    /// An event was applied to the result.
    Test {
        /// The worker that sent it.
        worker: WorkerId,
        /// What the event was about. `None` for durations.
        identity: Option<&'a TestIdentity>,
        /// The event.
        event: &'a Event,
    },

    /// A worker printed a line that wasn't an event.
    WorkerOutput {
        /// The worker that printed it.
        worker: WorkerId,
        /// The line.
        line: &'a str,
    },

    /// A worker exited.
    WorkerExited {
        /// The worker.
        worker: WorkerId,
        /// How it exited.
        exit: &'a WorkerExit,
    },

    /// The run is stopping early and the remaining workers are being terminated.
    Cancelling {
        /// Why.
        reason: CancelReason,
    },
}

/// Why a run stopped early.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// A test failed and fail-fast is enabled.
    FailFast,

    /// A worker crashed or broke protocol.
    WorkerFailed,

    /// A signal was received.
    Signal(ShutdownEvent),
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner<'a> {
    inner: TestRunnerInner<'a>,
    runtime: Runtime,
    signal_handler: SignalHandler,
}

impl TestRunner<'_> {
    /// Returns the partitions workers will run.
    pub fn partitions(&self) -> &[Partition] {
        &self.inner.partitions
    }

    /// Runs every partition, each in its own worker, and returns the consolidated result.
    ///
    /// The callback is called with each event as it's applied, and with each worker exit.
    ///
    /// If a worker crashes or the run is interrupted, the error carries the result so far.
    pub fn execute<F>(mut self, mut callback: F) -> Result<ConsolidatedResult, RunError>
    where
        F: FnMut(RunnerEvent<'_>),
    {
        let res = self
            .runtime
            .block_on(self.inner.run(&mut self.signal_handler, &mut callback));

        // Don't wait on workers that are still shutting down: their processes are killed when
        // dropped.
        self.runtime.shutdown_background();
        res
    }
}

#[derive(Debug)]
struct TestRunnerInner<'a> {
    partitions: Vec<Partition>,
    spawner: &'a dyn WorkerSpawner,
    options: WorkerOptions,
    channel_capacity: NonZeroUsize,
    terminate_grace_period: Duration,
}

impl TestRunnerInner<'_> {
    async fn run(
        &self,
        signal_handler: &mut SignalHandler,
        callback: &mut dyn FnMut(RunnerEvent<'_>),
    ) -> Result<ConsolidatedResult, RunError> {
        let stopwatch = stopwatch();
        let total_units = self.partitions.iter().map(Partition::len).sum();
        info!(
            workers = self.partitions.len(),
            units = total_units,
            "starting test run",
        );
        callback(RunnerEvent::RunStarted {
            workers: self.partitions.len(),
            units: total_units,
        });

        let (cancel_sender, _) = broadcast::channel(1);
        let mut streams = StreamMap::new();
        for partition in &self.partitions {
            let (sender, receiver) = mpsc::channel(self.channel_capacity.get());
            streams.insert(partition.worker(), ReceiverStream::new(receiver));

            let assignment = WorkerAssignment {
                partition: partition.clone(),
                options: self.options,
            };
            let channel = WorkerChannel {
                sender,
                cancel: cancel_sender.subscribe(),
                grace_period: self.terminate_grace_period,
            };
            if let Err(error) = self.spawner.spawn(assignment, channel) {
                // Stop whatever was already started.
                let _ = cancel_sender.send(());
                return Err(error.into());
            }
        }

        let mut cx = DispatcherContext::new(&self.partitions, self.options.fail_fast);

        loop {
            let cancel_reason = tokio::select! {
                next = streams.next() => {
                    let Some((worker, message)) = next else {
                        break;
                    };
                    cx.handle_message(worker, message, callback)
                }
                Some(signal) = signal_handler.recv() => {
                    info!("received {signal}, stopping workers");
                    Some(CancelReason::Signal(signal))
                }
            };

            if let Some(reason) = cancel_reason {
                if cx.cancel_reason.is_none() {
                    debug!(?reason, "cancelling run");
                    cx.cancel_reason = Some(reason);
                    cx.aggregator.set_stopped_early();
                    let _ = cancel_sender.send(());
                    callback(RunnerEvent::Cancelling { reason });
                }
            }
        }

        let snapshot = stopwatch.snapshot();
        cx.finish(snapshot.start_time, snapshot.duration)
    }
}

struct DispatcherContext<'p> {
    partitions: &'p [Partition],
    aggregator: ResultAggregator<'p>,
    fail_fast: bool,
    cancel_reason: Option<CancelReason>,
    failures: Vec<WorkerFailure>,
    last_started: HashMap<WorkerId, TestUnit>,
    exited: BTreeSet<WorkerId>,
}

impl<'p> DispatcherContext<'p> {
    fn new(partitions: &'p [Partition], fail_fast: bool) -> Self {
        Self {
            partitions,
            aggregator: ResultAggregator::new(partitions),
            fail_fast,
            cancel_reason: None,
            failures: Vec::new(),
            last_started: HashMap::new(),
            exited: BTreeSet::new(),
        }
    }

    /// Handles a single message from a worker, returning a reason to cancel the run if there is
    /// one.
    fn handle_message(
        &mut self,
        worker: WorkerId,
        message: WorkerMessage,
        callback: &mut dyn FnMut(RunnerEvent<'_>),
    ) -> Option<CancelReason> {
        match message {
            WorkerMessage::Event(event) => {
                let was_successful = self.aggregator.result().was_successful();
                match self.aggregator.apply(worker, event.clone()) {
                    Ok(identity) => {
                        if let (Event::Started { .. }, Some(TestIdentity::Unit(unit))) =
                            (&event, &identity)
                        {
                            self.last_started.insert(worker, unit.clone());
                        }
                        callback(RunnerEvent::Test {
                            worker,
                            identity: identity.as_ref(),
                            event: &event,
                        });
                        let newly_failed =
                            was_successful && !self.aggregator.result().was_successful();
                        (self.fail_fast && newly_failed).then_some(CancelReason::FailFast)
                    }
                    Err(error) => {
                        warn!("protocol error: {error}");
                        self.fail(worker, WorkerFailureKind::Protocol(error))
                    }
                }
            }
            WorkerMessage::Output(line) => {
                callback(RunnerEvent::WorkerOutput {
                    worker,
                    line: &line,
                });
                None
            }
            WorkerMessage::Malformed { line, error } => {
                warn!(%worker, "malformed event ({error}): {line}");
                self.fail(worker, WorkerFailureKind::MalformedEvent { line, error })
            }
            WorkerMessage::Exited(exit) => {
                self.exited.insert(worker);
                callback(RunnerEvent::WorkerExited {
                    worker,
                    exit: &exit,
                });
                if exit.is_success() || self.cancel_reason.is_some() {
                    // Workers stopped by the coordinator aren't crashes.
                    debug!(%worker, %exit, "worker exited");
                    return None;
                }
                warn!(%worker, "worker {exit}");
                let last_started = self.last_started.remove(&worker);
                self.fail(worker, WorkerFailureKind::Exited { exit, last_started })
            }
        }
    }

    fn fail(&mut self, worker: WorkerId, kind: WorkerFailureKind) -> Option<CancelReason> {
        self.failures.push(WorkerFailure { worker, kind });
        Some(CancelReason::WorkerFailed)
    }

    fn finish(
        mut self,
        start_time: chrono::DateTime<chrono::Local>,
        elapsed: Duration,
    ) -> Result<ConsolidatedResult, RunError> {
        // A worker whose stream ended without an exit notice went away without cleaning up.
        if self.cancel_reason.is_none() {
            for partition in self.partitions {
                let worker = partition.worker();
                if !self.exited.contains(&worker) {
                    warn!(%worker, "worker disconnected without exiting");
                    let last_started = self.last_started.remove(&worker);
                    self.failures.push(WorkerFailure {
                        worker,
                        kind: WorkerFailureKind::Disconnected { last_started },
                    });
                }
            }
            if !self.failures.is_empty() {
                self.aggregator.set_stopped_early();
            }
        }

        let mut result = self.aggregator.finish();
        result.start_time = Some(start_time);
        result.elapsed = elapsed;

        if !self.failures.is_empty() {
            return Err(RunError::WorkerFailed {
                failures: self.failures,
                partial: Box::new(result),
            });
        }
        match self.cancel_reason {
            Some(CancelReason::Signal(_)) => Err(RunError::Interrupted {
                partial: Box::new(result),
            }),
            Some(CancelReason::FailFast) | Some(CancelReason::WorkerFailed) | None => Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::TestError,
        errors::AggregateError,
        runner::ThreadSpawner,
        suite::{TestCase, TestGroup, TestSuite},
        worker::{SubTestLabel, TestContext},
    };
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn pass(_: &mut TestContext<'_>) -> Result<(), TestError> {
        Ok(())
    }

    fn fail(_: &mut TestContext<'_>) -> Result<(), TestError> {
        Err(TestError::failure("nope"))
    }

    fn slow(_: &mut TestContext<'_>) -> Result<(), TestError> {
        std::thread::sleep(Duration::from_millis(20));
        Ok(())
    }

    fn subtests(cx: &mut TestContext<'_>) -> Result<(), TestError> {
        for i in 0..3 {
            cx.subtest(SubTestLabel::new().param("i", i), || {
                if i == 0 {
                    Ok(())
                } else {
                    Err(TestError::failure(format!("{i} != 0")))
                }
            });
        }
        Ok(())
    }

    fn failing_setup() -> Result<(), TestError> {
        Err(TestError::failure("setup exploded"))
    }

    fn seven_unit_suite() -> TestSuite {
        TestSuite::new()
            .group(
                TestGroup::new("a")
                    .case(TestCase::new("one", pass))
                    .case(TestCase::new("two", pass))
                    .case(TestCase::new("three", pass)),
            )
            .group(
                TestGroup::new("b")
                    .case(TestCase::new("four", pass))
                    .case(TestCase::new("five", pass).skip("not today"))
                    .case(TestCase::new("six", fail).expected_failure())
                    .case(TestCase::new("seven", pass)),
            )
    }

    fn builder(workers: usize) -> TestRunnerBuilder {
        let mut builder = TestRunnerBuilder::default();
        builder
            .set_workers(WorkerCount::Count(workers))
            .set_durations(true)
            .set_terminate_grace_period(Duration::from_millis(100));
        builder
    }

    fn execute(
        builder: TestRunnerBuilder,
        suite: TestSuite,
    ) -> (Result<ConsolidatedResult, RunError>, Vec<String>) {
        let units = suite.units();
        let spawner = ThreadSpawner::new(Arc::new(suite));
        let runner = builder
            .build(units, &spawner, SignalHandlerKind::Noop)
            .expect("runner built");

        let mut log = Vec::new();
        let res = runner.execute(|event| match event {
            RunnerEvent::Test {
                identity: Some(identity),
                event,
                ..
            } => log.push(format!("{} {}", event.kind_str(), identity.id())),
            RunnerEvent::WorkerExited { worker, exit } => log.push(format!("{worker} {exit}")),
            _ => {}
        });
        (res, log)
    }

    #[test]
    fn seven_units_two_workers() {
        let (res, log) = execute(builder(2), seven_unit_suite());
        let result = res.expect("run succeeded");

        assert!(result.was_successful());
        assert_eq!(result.tests_run, 7);
        assert_eq!(result.successes, 5);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.expected_failures.len(), 1);
        assert_eq!(result.expected_failures[0].identity.id(), "b::six");
        assert_eq!(result.durations.len(), 7);
        assert!(result.duration("b::seven").is_some());
        assert!(!result.stopped_early);

        assert!(log.contains(&"worker-0 exited successfully".to_owned()));
        assert!(log.contains(&"worker-1 exited successfully".to_owned()));
        // Each worker's events arrive in order.
        let started_one = log.iter().position(|l| l == "started a::one").unwrap();
        let success_one = log.iter().position(|l| l == "success a::one").unwrap();
        let started_two = log.iter().position(|l| l == "started a::two").unwrap();
        assert!(started_one < success_one && success_one < started_two);
    }

    #[test]
    fn single_worker_uses_same_path() {
        for workers in [1, 100] {
            let suite = TestSuite::new().group(TestGroup::new("only").case(TestCase::new("t", pass)));
            let (res, log) = execute(builder(workers), suite);
            let result = res.expect("run succeeded");
            assert_eq!(result.tests_run, 1);
            assert_eq!(result.successes, 1);
            assert_eq!(log.last().unwrap(), "worker-0 exited successfully");
        }
    }

    #[test]
    fn failures_and_setup_errors_are_aggregated() {
        let suite = TestSuite::new()
            .group(
                TestGroup::new("broken")
                    .setup(failing_setup)
                    .case(TestCase::new("never", pass)),
            )
            .group(TestGroup::new("subs").case(TestCase::new("dummy", subtests)))
            .group(TestGroup::new("plain").case(TestCase::new("fails", fail)));
        let (res, _) = execute(builder(3), suite);
        let result = res.expect("run completes even with failures");

        assert!(!result.was_successful());
        let errors: Vec<_> = result.errors.iter().map(|e| e.identity.id()).collect();
        assert_eq!(errors, vec!["setup (broken::setup)"]);
        let mut failures: Vec<_> = result.failures.iter().map(|f| f.identity.id()).collect();
        failures.sort();
        assert_eq!(
            failures,
            vec!["plain::fails", "subs::dummy (i=1)", "subs::dummy (i=2)"]
        );
        assert_eq!(result.tests_run, 2);
    }

    #[test]
    fn fail_fast_stops_early() {
        let mut cases = TestGroup::new("g").case(TestCase::new("fails", fail));
        for i in 0..20 {
            cases = cases.case(TestCase::new(format!("slow{i}"), slow));
        }
        let mut builder = builder(2);
        builder.set_fail_fast(true);

        let (res, _) = execute(builder, TestSuite::new().group(cases));
        let result = res.expect("fail-fast is not a run error");
        assert!(result.stopped_early);
        assert_eq!(result.failures.len(), 1);
        assert!(result.tests_run < 21, "not every test ran: {}", result.tests_run);
    }

    #[derive(Debug)]
    struct ScriptedSpawner {
        scripts: Mutex<HashMap<WorkerId, Vec<WorkerMessage>>>,
    }

    impl ScriptedSpawner {
        fn new(scripts: impl IntoIterator<Item = (usize, Vec<WorkerMessage>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(worker, messages)| (WorkerId::new(worker), messages))
                        .collect(),
                ),
            }
        }
    }

    impl WorkerSpawner for ScriptedSpawner {
        fn spawn(
            &self,
            assignment: WorkerAssignment,
            channel: WorkerChannel,
        ) -> Result<(), crate::errors::WorkerSpawnError> {
            let messages = self
                .scripts
                .lock()
                .unwrap()
                .remove(&assignment.partition.worker())
                .unwrap_or_default();
            tokio::spawn(async move {
                for message in messages {
                    if channel.sender.send(message).await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        }
    }

    fn scripted(
        units: usize,
        workers: usize,
        spawner: &ScriptedSpawner,
    ) -> Result<ConsolidatedResult, RunError> {
        let units = (0..units)
            .map(|i| TestUnit::new("g", format!("t{i}")))
            .collect();
        builder(workers)
            .build(units, spawner, SignalHandlerKind::Noop)
            .unwrap()
            .execute(|_| {})
    }

    #[test]
    fn crashed_worker_is_a_run_error() {
        let spawner = ScriptedSpawner::new([
            (
                0,
                vec![
                    WorkerMessage::Event(Event::Started { index: 0 }),
                    WorkerMessage::Event(Event::Success { index: 0 }),
                    WorkerMessage::Exited(WorkerExit::Success),
                ],
            ),
            (
                1,
                vec![
                    WorkerMessage::Event(Event::Started { index: 0 }),
                    WorkerMessage::Exited(WorkerExit::Code(3)),
                ],
            ),
        ]);
        let err = scripted(2, 2, &spawner).unwrap_err();

        match &err {
            RunError::WorkerFailed { failures, partial } => {
                assert_eq!(
                    failures,
                    &vec![WorkerFailure {
                        worker: WorkerId::new(1),
                        kind: WorkerFailureKind::Exited {
                            exit: WorkerExit::Code(3),
                            last_started: Some(TestUnit::new("g", "t1")),
                        },
                    }]
                );
                assert_eq!(partial.tests_run, 2);
                assert_eq!(partial.successes, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("while running `g::t1`"));
    }

    #[test]
    fn disconnected_worker_is_a_run_error() {
        // The worker's stream ends without an exit notice.
        let spawner = ScriptedSpawner::new([(
            0,
            vec![WorkerMessage::Event(Event::Started { index: 0 })],
        )]);
        let err = scripted(1, 1, &spawner).unwrap_err();
        match err {
            RunError::WorkerFailed { failures, .. } => {
                assert!(matches!(
                    failures[0].kind,
                    WorkerFailureKind::Disconnected { .. }
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn out_of_range_index_is_a_protocol_error() {
        let spawner = ScriptedSpawner::new([(
            0,
            vec![
                WorkerMessage::Event(Event::Started { index: 5 }),
                WorkerMessage::Exited(WorkerExit::Success),
            ],
        )]);
        let err = scripted(2, 1, &spawner).unwrap_err();
        match err {
            RunError::WorkerFailed { failures, partial } => {
                assert_eq!(
                    failures[0].kind,
                    WorkerFailureKind::Protocol(AggregateError::IndexOutOfRange {
                        worker: WorkerId::new(0),
                        index: 5,
                        len: 2,
                    })
                );
                assert_eq!(partial.tests_run, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn interrupt_returns_partial_result() {
        let mut cases = TestGroup::new("g");
        for i in 0..50 {
            cases = cases.case(TestCase::new(format!("slow{i}"), slow));
        }
        let suite = TestSuite::new().group(cases);
        let units = suite.units();
        let spawner = ThreadSpawner::new(Arc::new(suite));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let (handler, signals) = SignalHandler::injected();
        let runner = builder(2).build_with_handler(units, &spawner, runtime, handler);

        let mut sent = false;
        let err = runner
            .execute(|event| {
                if let RunnerEvent::Test { .. } = event {
                    if !sent {
                        signals.send(ShutdownEvent::Interrupt).unwrap();
                        sent = true;
                    }
                }
            })
            .unwrap_err();

        match err {
            RunError::Interrupted { partial } => {
                assert!(partial.stopped_early);
                assert!(partial.tests_run >= 1);
                assert!(partial.tests_run < 50);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// Runs every worker as `/bin/sh -c <script>`. Workers can tell themselves apart with
    /// `$PARTEST_WORKER_ID`.
    #[cfg(unix)]
    fn shell_spawner(script: &str) -> crate::runner::ProcessSpawner {
        crate::runner::ProcessSpawner::new("/bin/sh", ["-c", script])
    }

    /// Writes `events` as a worker would print them, returning the file's path.
    #[cfg(unix)]
    fn write_events(
        dir: &camino_tempfile::Utf8TempDir,
        name: &str,
        events: Vec<Event>,
    ) -> camino::Utf8PathBuf {
        use crate::worker::{EventSink, JsonLinesSink};

        let mut sink = JsonLinesSink::new(Vec::new());
        for event in events {
            sink.emit(event).unwrap();
        }
        let path = dir.path().join(name);
        std::fs::write(&path, sink.into_inner()).unwrap();
        path
    }

    #[cfg(unix)]
    fn execute_processes(
        builder: TestRunnerBuilder,
        units: usize,
        spawner: &crate::runner::ProcessSpawner,
    ) -> (Result<ConsolidatedResult, RunError>, Vec<String>) {
        let units = (0..units)
            .map(|i| TestUnit::new("g", format!("t{i}")))
            .collect();
        let runner = builder
            .build(units, spawner, SignalHandlerKind::Noop)
            .expect("runner built");

        let mut output = Vec::new();
        let res = runner.execute(|event| {
            if let RunnerEvent::WorkerOutput { line, .. } = event {
                output.push(line.to_owned());
            }
        });
        (res, output)
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_output_keeps_later_events() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let first = write_events(
            &dir,
            "first.jsonl",
            vec![Event::Started { index: 0 }, Event::Success { index: 0 }],
        );
        let second = write_events(
            &dir,
            "second.jsonl",
            vec![Event::Started { index: 1 }, Event::Success { index: 1 }],
        );
        let spawner = shell_spawner(&format!(
            "cat '{first}'; printf 'bad \\377 bytes\\n'; cat '{second}'"
        ));

        let (res, output) = execute_processes(builder(1), 2, &spawner);
        let result = res.expect("run succeeded");
        assert_eq!(result.tests_run, 2);
        assert_eq!(result.successes, 2);
        assert_eq!(output, vec!["bad \u{fffd} bytes".to_owned()]);
    }

    #[cfg(unix)]
    #[test]
    fn fail_fast_terminates_running_worker_processes() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let failing = write_events(
            &dir,
            "failing.jsonl",
            vec![
                Event::Started { index: 0 },
                Event::Failure {
                    index: 0,
                    payload: TestError::failure("nope").encode(),
                },
            ],
        );
        let hanging = write_events(&dir, "hanging.jsonl", vec![Event::Started { index: 0 }]);
        let spawner = shell_spawner(&format!(
            "if [ \"$PARTEST_WORKER_ID\" = 0 ]; then cat '{failing}'; \
             else cat '{hanging}'; sleep 60; fi"
        ));

        // The grace period is long enough that only SIGTERM reaching the whole process group
        // lets the run finish in time.
        let mut builder = builder(2);
        builder
            .set_fail_fast(true)
            .set_terminate_grace_period(Duration::from_secs(30));
        let start = std::time::Instant::now();
        let (res, _) = execute_processes(builder, 2, &spawner);
        let elapsed = start.elapsed();

        let result = res.expect("fail-fast is not a run error");
        assert!(result.stopped_early);
        assert_eq!(result.failures.len(), 1);
        assert!(
            elapsed < Duration::from_secs(10),
            "run finished without waiting on the sleeping worker: {elapsed:?}"
        );
    }
}

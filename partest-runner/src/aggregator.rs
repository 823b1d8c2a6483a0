// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Folding worker events into a single result.
//!
//! The [`ResultAggregator`] lives in the coordinator and is driven by its event loop, one event at a
//! time. It's the only thing that ever mutates a [`ConsolidatedResult`].

use crate::{
    codec::ExceptionPayload,
    errors::AggregateError,
    event::{Event, SubTestOutcome, Subject},
    partition::{Partition, WorkerId},
    suite::TestUnit,
};
use chrono::{DateTime, Local};
use std::{fmt, time::Duration};
use tracing::debug;

/// What a reported outcome is about.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum TestIdentity {
    /// A unit from a partition.
    Unit(TestUnit),

    /// Something that isn't a unit, such as a group's setup hook. Built from the label sent with
    /// the event.
    Placeholder(String),

    /// A subtest of a unit.
    SubTest {
        /// The unit the subtest ran in.
        parent: TestUnit,
        /// The subtest's label.
        label: String,
    },
}

impl TestIdentity {
    /// Returns the id shown in reports.
    ///
    /// For placeholders this is the label itself. For subtests it's the parent's id followed by
    /// the subtest label.
    pub fn id(&self) -> String {
        match self {
            Self::Unit(unit) => unit.id(),
            Self::Placeholder(label) => label.clone(),
            Self::SubTest { parent, label } => format!("{} {label}", parent.id()),
        }
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit(unit) => write!(f, "{unit}"),
            Self::Placeholder(label) => write!(f, "{label}"),
            Self::SubTest { parent, label } => write!(f, "{parent} {label}"),
        }
    }
}

/// A failure or error in a [`ConsolidatedResult`].
#[derive(Clone, Debug, PartialEq)]
pub struct ReportedFailure {
    /// What failed.
    pub identity: TestIdentity,

    /// The traceback text, rendered from the payload.
    pub traceback: String,

    /// The payload the traceback was rendered from.
    pub payload: ExceptionPayload,
}

impl ReportedFailure {
    fn new(identity: TestIdentity, payload: ExceptionPayload) -> Self {
        Self {
            identity,
            traceback: payload.render(),
            payload,
        }
    }
}

/// Everything that happened in a test run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsolidatedResult {
    /// The number of units that started.
    pub tests_run: usize,

    /// The number of units that passed.
    pub successes: usize,

    /// Failed assertions, in arrival order.
    pub failures: Vec<ReportedFailure>,

    /// Unexpected errors, in arrival order.
    pub errors: Vec<ReportedFailure>,

    /// Skipped units and subtests, with reasons.
    pub skipped: Vec<(TestIdentity, String)>,

    /// Units that were expected to fail and did.
    pub expected_failures: Vec<ReportedFailure>,

    /// Units that were expected to fail but passed.
    pub unexpected_successes: Vec<TestIdentity>,

    /// Recorded durations, keyed by test id, in arrival order.
    pub durations: Vec<(String, f64)>,

    /// True if the run was stopped before every worker finished its partition.
    pub stopped_early: bool,

    /// When the run started, if it was timed.
    pub start_time: Option<DateTime<Local>>,

    /// How long the run took.
    pub elapsed: Duration,
}

impl ConsolidatedResult {
    /// Creates an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing failed, errored or unexpectedly passed.
    ///
    /// Skips and expected failures don't count against a run.
    pub fn was_successful(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty() && self.unexpected_successes.is_empty()
    }

    /// Returns the first duration recorded for `id`.
    pub fn duration(&self, id: &str) -> Option<f64> {
        self.durations
            .iter()
            .find_map(|(key, seconds)| (key == id).then_some(*seconds))
    }

    /// Returns the durations sorted from slowest to fastest.
    pub fn slowest(&self) -> Vec<(&str, f64)> {
        let mut durations: Vec<_> = self
            .durations
            .iter()
            .map(|(id, seconds)| (id.as_str(), *seconds))
            .collect();
        durations.sort_by(|a, b| b.1.total_cmp(&a.1));
        durations
    }
}

/// Applies events from workers to a [`ConsolidatedResult`], resolving local indexes against the
/// sending worker's partition.
#[derive(Debug)]
pub struct ResultAggregator<'p> {
    partitions: &'p [Partition],
    result: ConsolidatedResult,
}

impl<'p> ResultAggregator<'p> {
    /// Creates an aggregator for a run over `partitions`.
    ///
    /// Partition `i` must belong to worker `i`, as produced by
    /// [`partition_units`](crate::partition::partition_units).
    pub fn new(partitions: &'p [Partition]) -> Self {
        Self {
            partitions,
            result: ConsolidatedResult::new(),
        }
    }

    /// Returns the result so far.
    pub fn result(&self) -> &ConsolidatedResult {
        &self.result
    }

    /// Marks the result as stopped early.
    pub fn set_stopped_early(&mut self) {
        self.result.stopped_early = true;
    }

    /// Applies a single event sent by `worker`.
    ///
    /// Returns the identity the event was resolved to, if it refers to one. `Duration` events are
    /// keyed by id and don't resolve to an identity.
    ///
    /// An event that can't be resolved leaves the result untouched.
    pub fn apply(
        &mut self,
        worker: WorkerId,
        event: Event,
    ) -> Result<Option<TestIdentity>, AggregateError> {
        let partition = self
            .partitions
            .get(worker.get())
            .filter(|partition| partition.worker() == worker)
            .ok_or(AggregateError::UnknownWorker { worker })?;
        let lookup = |index: usize| {
            partition
                .get(index)
                .cloned()
                .ok_or(AggregateError::IndexOutOfRange {
                    worker,
                    index,
                    len: partition.len(),
                })
        };

        let result = &mut self.result;
        let identity = match event {
            Event::Started { index } => {
                let unit = lookup(index)?;
                result.tests_run += 1;
                TestIdentity::Unit(unit)
            }
            Event::Success { index } => {
                let unit = lookup(index)?;
                result.successes += 1;
                TestIdentity::Unit(unit)
            }
            Event::Failure { index, payload } => {
                let identity = TestIdentity::Unit(lookup(index)?);
                result
                    .failures
                    .push(ReportedFailure::new(identity.clone(), payload));
                identity
            }
            Event::Error { subject, payload } => {
                let identity = match subject {
                    Subject::ByIndex(index) => TestIdentity::Unit(lookup(index)?),
                    Subject::ByLabel(label) => TestIdentity::Placeholder(label),
                };
                result
                    .errors
                    .push(ReportedFailure::new(identity.clone(), payload));
                identity
            }
            Event::Skip { index, reason } => {
                let identity = TestIdentity::Unit(lookup(index)?);
                result.skipped.push((identity.clone(), reason));
                identity
            }
            Event::ExpectedFailure { index, payload } => {
                let identity = TestIdentity::Unit(lookup(index)?);
                result
                    .expected_failures
                    .push(ReportedFailure::new(identity.clone(), payload));
                identity
            }
            Event::UnexpectedSuccess { index } => {
                let identity = TestIdentity::Unit(lookup(index)?);
                result.unexpected_successes.push(identity.clone());
                identity
            }
            Event::SubTestResult {
                index,
                label,
                outcome,
            } => {
                let identity = TestIdentity::SubTest {
                    parent: lookup(index)?,
                    label,
                };
                match outcome {
                    SubTestOutcome::Success => {}
                    SubTestOutcome::Failure { payload } => result
                        .failures
                        .push(ReportedFailure::new(identity.clone(), payload)),
                    SubTestOutcome::Error { payload } => result
                        .errors
                        .push(ReportedFailure::new(identity.clone(), payload)),
                    SubTestOutcome::Skip { reason } => {
                        result.skipped.push((identity.clone(), reason));
                    }
                }
                identity
            }
            Event::Duration { id, seconds } => {
                result.durations.push((id, seconds));
                return Ok(None);
            }
        };

        Ok(Some(identity))
    }

    /// Finishes aggregation, returning the result.
    pub fn finish(self) -> ConsolidatedResult {
        debug!(
            tests_run = self.result.tests_run,
            failures = self.result.failures.len(),
            errors = self.result.errors.len(),
            "aggregation finished",
        );
        self.result
    }
}

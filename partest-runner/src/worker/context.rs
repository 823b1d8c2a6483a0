// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{EventSink, panic};
use crate::{
    codec::{ExceptionPayload, TestError, TestErrorKind},
    errors::EmitError,
    event::{Event, SubTestOutcome},
    suite::Expectation,
};
use std::fmt;

/// The label distinguishing one subtest from its siblings.
///
/// Displayed as `[message] (key=value, key2=value2)`, with either part omitted if empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubTestLabel {
    message: Option<String>,
    params: Vec<(String, String)>,
}

impl SubTestLabel {
    /// Creates an empty label.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a label with a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            params: Vec::new(),
        }
    }

    /// Adds a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }
}

impl fmt::Display for SubTestLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, self.params.is_empty()) {
            (None, true) => write!(f, "(<subtest>)"),
            (message, _) => {
                if let Some(message) = message {
                    write!(f, "[{message}]")?;
                    if !self.params.is_empty() {
                        write!(f, " ")?;
                    }
                }
                if !self.params.is_empty() {
                    write!(f, "(")?;
                    for (i, (key, value)) in self.params.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{key}={value}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

/// Passed to every test body. Used to run subtests.
pub struct TestContext<'a> {
    index: usize,
    expectation: Expectation,
    sink: &'a mut dyn EventSink,
    subtest_failures: usize,
    first_failure: Option<ExceptionPayload>,
    emit_error: Option<EmitError>,
}

impl<'a> TestContext<'a> {
    pub(super) fn new(index: usize, expectation: Expectation, sink: &'a mut dyn EventSink) -> Self {
        Self {
            index,
            expectation,
            sink,
            subtest_failures: 0,
            first_failure: None,
            emit_error: None,
        }
    }

    /// The local index of the running test in its worker's partition.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Runs `f` as a subtest.
    ///
    /// A failing subtest does not stop the test: its outcome is reported and the test body carries
    /// on. Returns true if the subtest passed.
    pub fn subtest<F>(&mut self, label: SubTestLabel, f: F) -> bool
    where
        F: FnOnce() -> Result<(), TestError>,
    {
        let outcome = match panic::catch(f).and_then(|res| res) {
            Ok(()) => SubTestOutcome::Success,
            Err(error) => match error.kind() {
                TestErrorKind::Failure => SubTestOutcome::Failure {
                    payload: error.encode(),
                },
                TestErrorKind::Error => SubTestOutcome::Error {
                    payload: error.encode(),
                },
                TestErrorKind::Skip(reason) => SubTestOutcome::Skip {
                    reason: reason.clone(),
                },
            },
        };
        let passed = !outcome.is_failure();

        if !passed {
            self.subtest_failures += 1;
            if self.expectation == Expectation::Failure {
                // Failures inside an expected-failure test are what was expected: they're folded
                // into the test's own outcome rather than reported one by one.
                if self.first_failure.is_none() {
                    self.first_failure = match outcome {
                        SubTestOutcome::Failure { payload } | SubTestOutcome::Error { payload } => {
                            Some(payload)
                        }
                        _ => None,
                    };
                }
                return passed;
            }
        }

        self.emit(Event::SubTestResult {
            index: self.index,
            label: label.to_string(),
            outcome,
        });
        passed
    }

    fn emit(&mut self, event: Event) {
        if self.emit_error.is_some() {
            return;
        }
        if let Err(error) = self.sink.emit(event) {
            self.emit_error = Some(error);
        }
    }

    pub(super) fn finish(self) -> ContextOutcome {
        ContextOutcome {
            subtest_failures: self.subtest_failures,
            first_failure: self.first_failure,
            emit_error: self.emit_error,
        }
    }
}

impl fmt::Debug for TestContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("index", &self.index)
            .field("expectation", &self.expectation)
            .field("subtest_failures", &self.subtest_failures)
            .finish_non_exhaustive()
    }
}

pub(super) struct ContextOutcome {
    pub(super) subtest_failures: usize,
    pub(super) first_failure: Option<ExceptionPayload>,
    pub(super) emit_error: Option<EmitError>,
}

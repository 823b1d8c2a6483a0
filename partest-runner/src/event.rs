// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events sent from a worker to the coordinator.
//!
//! Each worker produces an ordered stream of [`Event`]s. Events refer to tests by their *local
//! index* in the worker's partition, except when a failure happens before any test in a group has
//! started: those carry a [`Subject::ByLabel`] instead.
//!
//! On the wire, events are JSON objects tagged by `kind`, one per line. Subjects keep the
//! traditional encoding where an index of `-1` means "no test had started yet" and is accompanied
//! by a label.

use crate::{codec::ExceptionPayload, errors::SubjectParseError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a failure is about: a test in the partition, or something that happened outside any test.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSubject", into = "RawSubject")]
pub enum Subject {
    /// The test at this local index in the emitting worker's partition.
    ByIndex(usize),

    /// No test had started; the label identifies what failed (e.g. a group's setup hook).
    ByLabel(String),
}

impl Subject {
    /// The index used on the wire to mean "no test had started yet".
    pub const SENTINEL_INDEX: i64 = -1;

    /// Builds a subject from the wire representation: an index, or the sentinel index plus a
    /// label.
    pub fn from_wire(index: i64, label: Option<String>) -> Result<Self, SubjectParseError> {
        match (index, label) {
            (Self::SENTINEL_INDEX, Some(label)) => Ok(Self::ByLabel(label)),
            (Self::SENTINEL_INDEX, None) => Err(SubjectParseError::MissingLabel),
            (index, None) => usize::try_from(index)
                .map(Self::ByIndex)
                .map_err(|_| SubjectParseError::InvalidIndex { index }),
            (index, Some(_)) => Err(SubjectParseError::UnexpectedLabel { index }),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByIndex(index) => write!(f, "index {index}"),
            Self::ByLabel(label) => write!(f, "{label}"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct RawSubject {
    index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

impl TryFrom<RawSubject> for Subject {
    type Error = SubjectParseError;

    fn try_from(raw: RawSubject) -> Result<Self, Self::Error> {
        Self::from_wire(raw.index, raw.label)
    }
}

impl From<Subject> for RawSubject {
    fn from(subject: Subject) -> Self {
        match subject {
            Subject::ByIndex(index) => RawSubject {
                // Partitions are far smaller than i64::MAX.
                index: index as i64,
                label: None,
            },
            Subject::ByLabel(label) => RawSubject {
                index: Subject::SENTINEL_INDEX,
                label: Some(label),
            },
        }
    }
}

/// The outcome of a single subtest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SubTestOutcome {
    /// The subtest passed.
    Success,

    /// An assertion in the subtest failed.
    Failure {
        /// The encoded error.
        payload: ExceptionPayload,
    },

    /// The subtest hit an unexpected error.
    Error {
        /// The encoded error.
        payload: ExceptionPayload,
    },

    /// The subtest was skipped.
    Skip {
        /// Why the subtest was skipped.
        reason: String,
    },
}

impl SubTestOutcome {
    /// Returns true if this outcome counts against the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. } | Self::Error { .. })
    }
}

/// A single test-lifecycle occurrence, as reported by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    /// The test at `index` started.
    Started {
        /// Local index into the worker's partition.
        index: usize,
    },

    /// The test passed.
    Success {
        /// Local index into the worker's partition.
        index: usize,
    },

    /// An assertion in the test failed.
    Failure {
        /// Local index into the worker's partition.
        index: usize,
        /// The encoded error.
        payload: ExceptionPayload,
    },

    /// The test, or a group hook outside any test, hit an unexpected error.
    Error {
        /// The test, or a label for what failed if no test had started.
        subject: Subject,
        /// The encoded error.
        payload: ExceptionPayload,
    },

    /// The test was skipped.
    Skip {
        /// Local index into the worker's partition.
        index: usize,
        /// Why the test was skipped.
        reason: String,
    },

    /// The test was expected to fail, and did.
    ExpectedFailure {
        /// Local index into the worker's partition.
        index: usize,
        /// The encoded error.
        payload: ExceptionPayload,
    },

    /// The test was expected to fail, but passed.
    UnexpectedSuccess {
        /// Local index into the worker's partition.
        index: usize,
    },

    /// A subtest of the test at `index` finished.
    SubTestResult {
        /// Local index of the parent test.
        index: usize,
        /// The subtest's label, e.g. `(index=2)`.
        label: String,
        /// How the subtest went.
        outcome: SubTestOutcome,
    },

    /// How long a test took. Keyed by the test's id rather than its index.
    Duration {
        /// The test's id.
        id: String,
        /// Wall-clock time, in seconds.
        seconds: f64,
    },
}

impl Event {
    /// Returns the local index this event refers to, if it refers to one.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Started { index }
            | Self::Success { index }
            | Self::Failure { index, .. }
            | Self::Skip { index, .. }
            | Self::ExpectedFailure { index, .. }
            | Self::UnexpectedSuccess { index }
            | Self::SubTestResult { index, .. } => Some(*index),
            Self::Error { subject, .. } => match subject {
                Subject::ByIndex(index) => Some(*index),
                Subject::ByLabel(_) => None,
            },
            Self::Duration { .. } => None,
        }
    }

    /// Returns a short name for the kind of event, used in logs.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Error { .. } => "error",
            Self::Skip { .. } => "skip",
            Self::ExpectedFailure { .. } => "expected-failure",
            Self::UnexpectedSuccess { .. } => "unexpected-success",
            Self::SubTestResult { .. } => "subtest-result",
            Self::Duration { .. } => "duration",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sentinel_subject_wire_format() {
        let event = Event::Error {
            subject: Subject::ByLabel("setUpClass (pkg.Mod.Cls.setUpClass)".to_owned()),
            payload: ExceptionPayload::transport_failure("Traceback"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], json!("error"));
        assert_eq!(
            value["subject"],
            json!({ "index": -1, "label": "setUpClass (pkg.Mod.Cls.setUpClass)" })
        );

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.index(), None);
    }

    #[test]
    fn indexed_subject_wire_format() {
        let value = json!({ "index": 4 });
        let subject: Subject = serde_json::from_value(value).unwrap();
        assert_eq!(subject, Subject::ByIndex(4));
    }

    #[test]
    fn invalid_subjects() {
        for value in [
            json!({ "index": -1 }),
            json!({ "index": -2 }),
            json!({ "index": 3, "label": "setup (g::setup)" }),
        ] {
            let res: Result<Subject, _> = serde_json::from_value(value.clone());
            assert!(res.is_err(), "{value} should be rejected");
        }
    }

    #[test]
    fn subtest_outcome_wire_format() {
        let event = Event::SubTestResult {
            index: 0,
            label: "(index=2)".to_owned(),
            outcome: SubTestOutcome::Skip {
                reason: "not today".to_owned(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "sub-test-result",
                "index": 0,
                "label": "(index=2)",
                "outcome": { "status": "skip", "reason": "not today" },
            })
        );
    }
}

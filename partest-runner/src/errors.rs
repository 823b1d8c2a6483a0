// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by partest.

use crate::{
    aggregator::ConsolidatedResult,
    partition::WorkerId,
    runner::WorkerExit,
    suite::TestUnit,
};
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, io};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse partest config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error which indicates that a profile was requested but not known to partest.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a
/// [`WorkerCount`](crate::config::WorkerCount) value from a string.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized value for workers: {input}\n(hint: expected a positive integer or \"num-cpus\")"
)]
pub struct WorkerCountParseError {
    input: String,
}

impl WorkerCountParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while encoding or decoding the detail attached to a test error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The detail could not be serialized.
    #[error("failed to serialize error detail")]
    Serialize(#[source] serde_json::Error),

    /// The serialized detail could not be turned back into its own type.
    #[error("failed to reconstruct error detail from its serialized form")]
    Reconstruct(#[source] serde_json::Error),

    /// The detail is of a kind that can never leave its process.
    #[error("error detail cannot be transported out of its process")]
    Opaque,

    /// Serializing the detail panicked.
    #[error("serializing error detail panicked")]
    Panicked,
}

/// An error that occurs while reading the subject of an error event off the wire.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum SubjectParseError {
    /// The sentinel index was used without a label.
    #[error("error event has index -1 but no label")]
    MissingLabel,

    /// A negative index other than the sentinel.
    #[error("error event has invalid index {index}")]
    InvalidIndex {
        /// The index that was read.
        index: i64,
    },

    /// A real index was accompanied by a label.
    #[error("error event has index {index} and a label; only index -1 carries a label")]
    UnexpectedLabel {
        /// The index that was read.
        index: i64,
    },
}

/// An error that occurs while a worker sends an event.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EmitError {
    /// The event could not be serialized.
    #[error("failed to serialize event")]
    Serialize(#[source] serde_json::Error),

    /// The event could not be written.
    #[error("failed to write event")]
    Write(#[source] io::Error),

    /// The coordinator is no longer listening.
    #[error("coordinator disconnected")]
    Disconnected,
}

/// An error that stops a worker from running its partition.
///
/// Test failures are never errors: they're reported as events.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// A unit in the partition doesn't exist in the suite.
    #[error("test `{unit}` not found in this test binary")]
    UnknownUnit {
        /// The unit that wasn't found.
        unit: TestUnit,
    },

    /// An event could not be sent.
    #[error(transparent)]
    Emit(#[from] EmitError),

    /// The assignment could not be read from stdin.
    #[error("failed to read worker assignment")]
    ReadAssignment(#[source] serde_json::Error),
}

/// An error that occurs while starting a worker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerSpawnError {
    /// The path to the current executable could not be determined.
    #[error("failed to determine current executable")]
    CurrentExe(#[source] io::Error),

    /// The worker process could not be started.
    #[error("failed to spawn worker process for {worker}")]
    Process {
        /// The worker that failed to start.
        worker: WorkerId,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The assignment could not be sent to the worker.
    #[error("failed to send assignment to {worker}")]
    SendAssignment {
        /// The worker.
        worker: WorkerId,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The worker thread could not be started.
    #[error("failed to spawn worker thread for {worker}")]
    Thread {
        /// The worker that failed to start.
        worker: WorkerId,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An event that cannot be applied to the result.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum AggregateError {
    /// The event's index doesn't refer to a unit in the worker's partition.
    #[error("{worker} sent index {index}, but its partition has {len} units")]
    IndexOutOfRange {
        /// The worker that sent the event.
        worker: WorkerId,
        /// The index in the event.
        index: usize,
        /// The number of units in the worker's partition.
        len: usize,
    },

    /// The event came from a worker with no partition.
    #[error("event from unknown {worker}")]
    UnknownWorker {
        /// The worker that sent the event.
        worker: WorkerId,
    },
}

/// Why a worker failed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum WorkerFailureKind {
    /// The worker exited unsuccessfully.
    Exited {
        /// How it exited.
        exit: WorkerExit,
        /// The last unit it started, if any.
        last_started: Option<TestUnit>,
    },

    /// The worker's event stream ended without the worker exiting.
    Disconnected {
        /// The last unit it started, if any.
        last_started: Option<TestUnit>,
    },

    /// The worker sent an event that couldn't be applied.
    Protocol(AggregateError),

    /// The worker sent a line that looked like an event but couldn't be parsed.
    MalformedEvent {
        /// The JSON text.
        line: String,
        /// The parse error, rendered.
        error: String,
    },
}

/// A worker that crashed or broke protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerFailure {
    /// The worker.
    pub worker: WorkerId,

    /// What went wrong.
    pub kind: WorkerFailureKind,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last_started = match &self.kind {
            WorkerFailureKind::Exited { exit, last_started } => {
                write!(f, "{} {exit}", self.worker)?;
                last_started
            }
            WorkerFailureKind::Disconnected { last_started } => {
                write!(f, "{} closed its event stream without exiting", self.worker)?;
                last_started
            }
            WorkerFailureKind::Protocol(error) => return write!(f, "protocol error: {error}"),
            WorkerFailureKind::MalformedEvent { line, error } => {
                return write!(
                    f,
                    "{} sent a malformed event ({error}): {line}",
                    self.worker
                );
            }
        };
        if let Some(unit) = last_started {
            write!(f, " (while running `{unit}`)")?;
        }
        Ok(())
    }
}

/// An error that makes a test run incomplete.
///
/// Each variant carries whatever was aggregated before the error, so it can still be reported.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// One or more workers crashed or broke protocol.
    #[error("{} worker(s) failed: {}", .failures.len(), DisplayFailures(.failures))]
    WorkerFailed {
        /// The failed workers.
        failures: Vec<WorkerFailure>,
        /// The result aggregated before the run was stopped.
        partial: Box<ConsolidatedResult>,
    },

    /// The run was interrupted by a signal.
    #[error("test run interrupted")]
    Interrupted {
        /// The result aggregated before the run was stopped.
        partial: Box<ConsolidatedResult>,
    },

    /// A worker could not be started.
    #[error(transparent)]
    Spawn(#[from] WorkerSpawnError),
}

impl RunError {
    /// Returns the partial result, if the run got far enough to have one.
    pub fn partial_result(&self) -> Option<&ConsolidatedResult> {
        match self {
            Self::WorkerFailed { partial, .. } | Self::Interrupted { partial } => Some(partial),
            Self::Spawn(_) => None,
        }
    }
}

struct DisplayFailures<'a>(&'a [WorkerFailure]);

impl fmt::Display for DisplayFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// An error that occurred while setting up the test runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),
}

/// An error occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SignalHandlerSetupError(#[from] io::Error);

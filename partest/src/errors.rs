// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::NO_HEADING_TARGET;
use partest_runner::errors::*;
use std::{error::Error, io};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Documented exit codes for partest failures.
///
/// Unknown or unexpected failures always result in exit code 1.
pub enum PartestExitCode {}

impl PartestExitCode {
    /// No errors occurred and partest exited normally.
    pub const OK: i32 = 0;

    /// One or more tests failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// A worker crashed or broke protocol, so the run is incomplete.
    pub const WORKER_FAILED: i32 = 101;

    /// The run was interrupted by a signal.
    pub const INTERRUPTED: i32 = 102;

    /// Writing the report failed.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// A worker process could not run its assignment.
    pub const WORKER_PROCESS_ERROR: i32 = 70;

    /// An error was encountered while setting up the run.
    pub const SETUP_ERROR: i32 = 96;
}

// The #[error()] strings are short placeholders. Errors are printed with display_to_stderr, which
// walks the source chain.

/// An error that partest expects might happen, and that it reports without a panic.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("worker spawn error")]
    WorkerSpawnError {
        #[from]
        err: WorkerSpawnError,
    },
    #[error("test runner build error")]
    TestRunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("test run error")]
    RunError {
        #[from]
        err: RunError,
    },
    #[error("test run failed")]
    TestRunFailed,
    #[error("worker process error")]
    WorkerProcessError {
        #[from]
        err: WorkerError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn write_output(err: io::Error) -> Self {
        Self::WriteOutputError { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. }
            | Self::ProfileNotFound { .. }
            | Self::WorkerSpawnError { .. }
            | Self::TestRunnerBuildError { .. } => PartestExitCode::SETUP_ERROR,
            Self::RunError { err } => match err {
                RunError::WorkerFailed { .. } => PartestExitCode::WORKER_FAILED,
                RunError::Interrupted { .. } => PartestExitCode::INTERRUPTED,
                _ => PartestExitCode::SETUP_ERROR,
            },
            Self::TestRunFailed => PartestExitCode::TEST_RUN_FAILED,
            Self::WorkerProcessError { .. } => PartestExitCode::WORKER_PROCESS_ERROR,
            Self::WriteOutputError { .. } => PartestExitCode::WRITE_OUTPUT_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self) {
        let mut next_error = match &self {
            Self::ConfigParseError { err } => {
                error!("failed to parse partest config at `{}`", err.config_file());
                err.source()
            }
            Self::ProfileNotFound { err } => {
                error!("{err}");
                None
            }
            Self::WorkerSpawnError { err } => {
                error!("{err}");
                err.source()
            }
            Self::TestRunnerBuildError { err } => {
                error!("failed to build test runner");
                Some(err as &dyn Error)
            }
            Self::RunError { err } => match err {
                RunError::WorkerFailed { failures, .. } => {
                    let noun = if failures.len() == 1 {
                        "worker"
                    } else {
                        "workers"
                    };
                    error!("test run incomplete: {} {noun} failed", failures.len());
                    for failure in failures {
                        error!(target: NO_HEADING_TARGET, "  {failure}");
                    }
                    None
                }
                RunError::Interrupted { .. } => {
                    error!("test run interrupted");
                    None
                }
                _ => {
                    error!("{err}");
                    err.source()
                }
            },
            Self::TestRunFailed => {
                error!("test run failed");
                None
            }
            Self::WorkerProcessError { err } => {
                error!("worker process failed");
                Some(err as &dyn Error)
            }
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partest_runner::aggregator::ConsolidatedResult;

    #[test]
    fn run_error_exit_codes() {
        let interrupted = ExpectedError::from(RunError::Interrupted {
            partial: Box::new(ConsolidatedResult::default()),
        });
        assert_eq!(
            interrupted.process_exit_code(),
            PartestExitCode::INTERRUPTED
        );

        let failed = ExpectedError::from(RunError::WorkerFailed {
            failures: Vec::new(),
            partial: Box::new(ConsolidatedResult::default()),
        });
        assert_eq!(failed.process_exit_code(), PartestExitCode::WORKER_FAILED);

        assert_eq!(
            ExpectedError::TestRunFailed.process_exit_code(),
            PartestExitCode::TEST_RUN_FAILED
        );
    }
}

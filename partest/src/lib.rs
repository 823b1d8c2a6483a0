// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test harness that splits a suite into contiguous partitions and runs each one in its own
//! worker process.
//!
//! A test binary builds its [`TestSuite`] and hands it to [`run_main`]:
//!
//! ```no_run
//! use partest::{TestCase, TestContext, TestError, TestGroup, TestSuite};
//!
//! fn adds(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
//!     if 1 + 1 != 2 {
//!         return Err(TestError::failure("1 + 1 != 2"));
//!     }
//!     Ok(())
//! }
//!
//! fn main() {
//!     let suite = TestSuite::new().group(TestGroup::new("math").case(TestCase::new("adds", adds)));
//!     partest::run_main(suite)
//! }
//! ```
//!
//! The core machinery lives in the `partest-runner` crate.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
pub use output::{LOG_ENV, OutputContext};
pub use partest_runner::{
    codec::TestError,
    suite::{TestCase, TestGroup, TestSuite},
    worker::{SubTestLabel, TestContext},
};

use clap::Parser;

/// Parses the command line, runs `suite` as a coordinator or a worker, and exits the process.
pub fn run_main(suite: TestSuite) -> ! {
    let _ = enable_ansi_support::enable_ansi_support();

    let opts = PartestApp::parse();
    let output = opts.init_output();

    match opts.exec(suite, output) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr();
            std::process::exit(error.process_exit_code())
        }
    }
}

// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A sample suite covering every kind of outcome partest reports.
//!
//! Setting `PARTEST_DEMO_CRASH=1` makes one test exit its worker process mid-run.

use color_eyre::Result;
use partest::{SubTestLabel, TestCase, TestContext, TestError, TestGroup, TestSuite};
use serde::{Deserialize, Serialize, Serializer, ser::Error as _};

const CRASH_ENV: &str = "PARTEST_DEMO_CRASH";

fn main() -> Result<()> {
    color_eyre::install()?;
    partest::run_main(suite())
}

fn suite() -> TestSuite {
    TestSuite::new()
        .group(
            TestGroup::new("arith")
                .case(TestCase::new("adds", adds))
                .case(TestCase::new("subtracts", subtracts))
                .case(TestCase::new("divides", divides))
                .case(TestCase::new("parses", parses)),
        )
        .group(
            TestGroup::new("expectations")
                .case(TestCase::new("known_bug", known_bug).expected_failure())
                .case(TestCase::new("fixed_bug", adds).expected_failure())
                .case(TestCase::new("later", adds).skip("not implemented yet"))
                .case(TestCase::new("needs_network", needs_network)),
        )
        .group(
            TestGroup::new("database")
                .setup(connect)
                .case(TestCase::new("inserts", adds))
                .case(TestCase::new("queries", adds)),
        )
        .group(
            TestGroup::new("params")
                .case(TestCase::new("evens", evens))
                .case(TestCase::new("details", details)),
        )
        .group(
            TestGroup::new("cleanup")
                .teardown(remove_scratch_dir)
                .case(TestCase::new("uses_scratch_dir", adds)),
        )
        .group(
            TestGroup::new("output")
                .case(TestCase::new("prints", prints))
                .case(TestCase::new("maybe_crashes", maybe_crashes)),
        )
}

fn adds(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    check_eq(2 + 2, 4)
}

fn subtracts(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    check_eq(7 - 3, 4)
}

fn divides(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    let numerator = 7;
    let half = numerator / 2;
    assert_eq!(half * 2, numerator, "{numerator} is odd");
    Ok(())
}

fn parses(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    let value: u8 = "300".parse()?;
    check_eq(value, 44)
}

fn known_bug(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    check_eq("tab\twidth".len(), 9)?;
    Err(TestError::failure("tabs are not expanded"))
}

fn needs_network(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    Err(TestError::skip("network access is disabled"))
}

fn connect() -> Result<(), TestError> {
    let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
    Err(TestError::error(err))
}

fn remove_scratch_dir() -> Result<(), TestError> {
    Err(TestError::failure("scratch dir still in use"))
}

fn evens(cx: &mut TestContext<'_>) -> Result<(), TestError> {
    for i in 0..4 {
        cx.subtest(SubTestLabel::new().param("i", i), || check_eq(i % 2, 0));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct Mismatch {
    expected: String,
    actual: String,
}

/// Refuses to serialize, like an open file handle.
#[derive(Debug, Deserialize)]
struct Handle {
    fd: i32,
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom(format!("fd {} can't leave this process", self.fd)))
    }
}

fn details(cx: &mut TestContext<'_>) -> Result<(), TestError> {
    cx.subtest(SubTestLabel::message("structured"), || {
        Err(TestError::failure("greeting mismatch").with_detail(Mismatch {
            expected: "hello".to_owned(),
            actual: "hullo".to_owned(),
        }))
    });
    cx.subtest(SubTestLabel::message("handle"), || {
        Err(TestError::failure("handle left open").with_detail(Handle { fd: 3 }))
    });
    Ok(())
}

fn prints(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    println!("hello from a test");
    Ok(())
}

fn maybe_crashes(_cx: &mut TestContext<'_>) -> Result<(), TestError> {
    if std::env::var_os(CRASH_ENV).is_some() {
        std::process::exit(3);
    }
    Ok(())
}

#[track_caller]
fn check_eq<T: PartialEq + std::fmt::Debug>(actual: T, expected: T) -> Result<(), TestError> {
    if actual == expected {
        Ok(())
    } else {
        Err(TestError::failure(format!(
            "assertion failed: {actual:?} != {expected:?}"
        )))
    }
}

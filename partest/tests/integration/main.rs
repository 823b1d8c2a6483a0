// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs the demo suite through real worker processes.

use camino_tempfile::Utf8TempDir;
use indoc::indoc;
use partest::PartestExitCode;
use pretty_assertions::assert_eq;
use std::{fmt, process::Output};

const DEMO_BIN: &str = env!("CARGO_BIN_EXE_partest-demo");

/// Variables cleared for every run unless a test sets them.
const ISOLATED_ENV: [&str; 4] = [
    "PARTEST_LOG",
    "PARTEST_PROFILE",
    "PARTEST_WORKERS",
    "PARTEST_DEMO_CRASH",
];

struct DemoOutput {
    args: Vec<String>,
    output: Output,
}

impl DemoOutput {
    fn code(&self) -> Option<i32> {
        self.output.status.code()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.output.stderr).into_owned()
    }
}

impl fmt::Display for DemoOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "args: {:?}\nexit code: {:?}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
            self.args,
            self.code(),
            String::from_utf8_lossy(&self.output.stdout),
            self.stderr(),
        )
    }
}

/// Runs the demo in `dir` (a fresh temp dir if `None`), so no stray config is picked up.
fn run_demo(dir: Option<&Utf8TempDir>, args: &[&str], envs: &[(&str, &str)]) -> DemoOutput {
    let fallback;
    let dir = match dir {
        Some(dir) => dir,
        None => {
            fallback = Utf8TempDir::new().expect("created temp dir");
            &fallback
        }
    };

    // Each duct modifier wraps the expression built so far, so a removal chained after a set
    // would still win. Only clear the variables the caller doesn't set.
    let mut expr = duct::cmd(DEMO_BIN, args)
        .dir(dir.path().as_std_path())
        .env("PARTEST_COLOR", "never");
    for key in ISOLATED_ENV {
        if !envs.iter().any(|(set, _)| *set == key) {
            expr = expr.env_remove(key);
        }
    }
    for (key, value) in envs {
        expr = expr.env(key, value);
    }
    let output = expr
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .expect("demo binary ran");

    DemoOutput {
        args: args.iter().map(|arg| arg.to_string()).collect(),
        output,
    }
}

const FULL_SUMMARY: &str =
    "FAILED (failures=5, errors=3, skipped=2, expected failures=1, unexpected successes=1)";

#[test]
fn single_worker_run() {
    let output = run_demo(None, &["-j", "1"], &[]);
    assert_eq!(
        output.code(),
        Some(PartestExitCode::TEST_RUN_FAILED),
        "{output}"
    );

    let stderr = output.stderr();
    assert!(stderr.contains("Ran 13 tests in "), "{output}");
    assert!(stderr.contains(FULL_SUMMARY), "{output}");
    assert!(stderr.contains("error: test run failed"), "{output}");
}

#[test]
fn multi_worker_run_matches_single_worker() {
    let single = run_demo(None, &["-j", "1"], &[]);
    let multi = run_demo(None, &["-j", "3"], &[]);
    assert_eq!(multi.code(), single.code(), "{multi}");

    let stderr = multi.stderr();
    assert!(stderr.contains("Starting 15 tests across 3 workers"), "{multi}");
    assert!(stderr.contains("Ran 13 tests in "), "{multi}");
    assert!(stderr.contains(FULL_SUMMARY), "{multi}");
}

#[test]
fn report_blocks() {
    let output = run_demo(None, &["-j", "2"], &[]);
    let stderr = output.stderr();

    for expected in [
        "FAIL: arith::divides",
        "ERROR: arith::parses",
        "ERROR: setup (database::setup)",
        "ERROR: teardown (cleanup::teardown)",
        "FAIL: params::evens (i=1)",
        "FAIL: params::evens (i=3)",
        "FAIL: params::details [structured]",
        "FAIL: params::details [handle]",
        "7 is odd",
        "connection refused",
        "scratch dir still in use",
    ] {
        assert!(stderr.contains(expected), "missing {expected:?}:\n{output}");
    }
    assert!(
        !stderr.contains("FAIL: params::evens (i=0)"),
        "passing subtests aren't reported:\n{output}"
    );
    assert!(!stderr.contains("database::inserts"), "{output}");
}

#[test]
fn untransportable_detail_keeps_traceback() {
    let output = run_demo(None, &["-j", "2"], &[]);
    let stderr = output.stderr();

    let block = stderr
        .split("FAIL: params::details [handle]")
        .nth(1)
        .expect("handle block present");
    assert!(block.contains("handle left open"), "{output}");
    assert!(block.contains("partest::TransportFailure"), "{output}");
}

#[test]
fn worker_stdout_is_passed_through() {
    let output = run_demo(None, &["-j", "3"], &[]);
    assert!(
        output.stderr().contains("hello from a test"),
        "{output}"
    );
}

#[test]
fn fail_fast_stops_early() {
    let output = run_demo(None, &["-j", "1", "--fail-fast"], &[]);
    assert_eq!(
        output.code(),
        Some(PartestExitCode::TEST_RUN_FAILED),
        "{output}"
    );

    let stderr = output.stderr();
    assert!(stderr.contains("Ran 3 tests in "), "{output}");
    assert!(
        stderr.contains("FAILED (failures=1) [stopped early]"),
        "{output}"
    );
}

#[test]
fn crashed_worker_fails_the_run() {
    let output = run_demo(None, &["-j", "3"], &[("PARTEST_DEMO_CRASH", "1")]);
    assert_eq!(
        output.code(),
        Some(PartestExitCode::WORKER_FAILED),
        "{output}"
    );

    let stderr = output.stderr();
    assert!(
        stderr.contains("error: test run incomplete: 1 worker failed"),
        "{output}"
    );
    assert!(
        stderr.contains("worker-2 exited with code 3 (while running `output::maybe_crashes`)"),
        "{output}"
    );
    // The partial result is still reported.
    assert!(stderr.contains("Ran "), "{output}");
}

#[test]
fn durations_table() {
    let output = run_demo(None, &["-j", "2", "--durations", "2"], &[]);
    let stderr = output.stderr();

    let table = stderr
        .split("Slowest test durations")
        .nth(1)
        .expect("durations table present");
    let rows: Vec<_> = table
        .lines()
        .skip(2)
        .take_while(|line| !line.starts_with("---"))
        .collect();
    assert_eq!(rows.len(), 2, "{output}");
    assert!(rows.iter().all(|row| row.contains("s ")), "{output}");
}

#[test]
fn profile_from_config_file() {
    let dir = Utf8TempDir::new().expect("created temp dir");
    std::fs::create_dir(dir.path().join(".config")).expect("created .config");
    std::fs::write(
        dir.path().join(".config/partest.toml"),
        indoc! {r#"
            [profile.quick]
            workers = 2
            fail-fast = true
        "#},
    )
    .expect("wrote config");

    let output = run_demo(Some(&dir), &["--profile", "quick"], &[]);
    let stderr = output.stderr();
    assert!(stderr.contains("across 2 workers"), "{output}");
    assert!(stderr.contains("[stopped early]"), "{output}");

    let output = run_demo(Some(&dir), &["--profile", "quick", "--no-fail-fast"], &[]);
    assert!(output.stderr().contains(FULL_SUMMARY), "{output}");
}

#[test]
fn unknown_profile() {
    let output = run_demo(None, &["--profile", "nope"], &[]);
    assert_eq!(output.code(), Some(PartestExitCode::SETUP_ERROR), "{output}");
    assert!(
        output
            .stderr()
            .contains("profile `nope` not found (known profiles: ci, default)"),
        "{output}"
    );
}

#[test]
fn invalid_worker_count() {
    let dir = Utf8TempDir::new().expect("created temp dir");
    let config_file = dir.path().join("partest.toml");
    std::fs::write(&config_file, "[profile.default]\nworkers = 0\n").expect("wrote config");

    let output = run_demo(Some(&dir), &["--config-file", config_file.as_str()], &[]);
    assert_eq!(output.code(), Some(PartestExitCode::SETUP_ERROR), "{output}");
    assert!(
        output.stderr().contains("failed to parse partest config"),
        "{output}"
    );

    let output = run_demo(None, &["-j", "0"], &[]);
    assert_eq!(output.code(), Some(2), "clap rejects the argument:\n{output}");
}

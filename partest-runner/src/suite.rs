// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test suite model.
//!
//! A [`TestSuite`] is an ordered list of [`TestGroup`]s, each an ordered list of [`TestCase`]s. A
//! group may have setup and teardown hooks that run once per group per worker.
//!
//! The coordinator only ever sees [`TestUnit`]s, which identify a case. Workers resolve units back
//! to the case bodies through [`TestSuite::resolve`]: since workers re-execute the same binary, both
//! sides build the same suite.

use crate::{codec::TestError, worker::TestContext};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The signature of a test body.
pub type TestFn = fn(&mut TestContext<'_>) -> Result<(), TestError>;

/// The signature of a group setup or teardown hook.
pub type HookFn = fn() -> Result<(), TestError>;

/// Identifies a single test case: the group it's in, and its name within the group.
///
/// This is all that crosses process boundaries about a test.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TestUnit {
    group: String,
    name: String,
}

impl TestUnit {
    /// Creates a new unit.
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    /// The group this unit belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The name of this unit within its group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human-readable id of this unit: `group::name`.
    pub fn id(&self) -> String {
        format!("{}::{}", self.group, self.name)
    }
}

impl fmt::Display for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group, self.name)
    }
}

/// Whether a test case is expected to pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Expectation {
    /// The test should pass.
    #[default]
    Pass,

    /// The test is known to fail. A failure is reported as an expected failure and a pass as an
    /// unexpected success.
    Failure,
}

/// A single test case.
#[derive(Clone)]
pub struct TestCase {
    name: String,
    body: TestFn,
    expectation: Expectation,
    skip: Option<String>,
}

impl TestCase {
    /// Creates a new test case.
    pub fn new(name: impl Into<String>, body: TestFn) -> Self {
        Self {
            name: name.into(),
            body,
            expectation: Expectation::Pass,
            skip: None,
        }
    }

    /// Marks this test as expected to fail.
    pub fn expected_failure(mut self) -> Self {
        self.expectation = Expectation::Failure;
        self
    }

    /// Marks this test as always skipped.
    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    /// The name of this test case.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The body of this test case.
    pub fn body(&self) -> TestFn {
        self.body
    }

    /// Whether this test is expected to pass.
    pub fn expectation(&self) -> Expectation {
        self.expectation
    }

    /// The reason this test is always skipped, if it is.
    pub fn skip_reason(&self) -> Option<&str> {
        self.skip.as_deref()
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("expectation", &self.expectation)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

/// A group of test cases sharing once-per-group setup and teardown.
#[derive(Clone)]
pub struct TestGroup {
    name: String,
    setup: Option<HookFn>,
    teardown: Option<HookFn>,
    cases: IndexMap<String, TestCase>,
}

impl TestGroup {
    /// Creates a new, empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: None,
            teardown: None,
            cases: IndexMap::new(),
        }
    }

    /// Sets the hook run before the first test of this group in a worker.
    pub fn setup(mut self, hook: HookFn) -> Self {
        self.setup = Some(hook);
        self
    }

    /// Sets the hook run after the last test of this group in a worker.
    pub fn teardown(mut self, hook: HookFn) -> Self {
        self.teardown = Some(hook);
        self
    }

    /// Adds a test case. A case with the same name replaces the earlier one.
    pub fn case(mut self, case: TestCase) -> Self {
        self.cases.insert(case.name.clone(), case);
        self
    }

    /// The name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterates over the cases in this group, in order.
    pub fn cases(&self) -> impl ExactSizeIterator<Item = &TestCase> + '_ {
        self.cases.values()
    }

    pub(crate) fn setup_hook(&self) -> Option<HookFn> {
        self.setup
    }

    pub(crate) fn teardown_hook(&self) -> Option<HookFn> {
        self.teardown
    }

    /// The label reported when this group's setup hook fails.
    pub fn setup_label(&self) -> String {
        format!("setup ({}::setup)", self.name)
    }

    /// The label reported when this group's teardown hook fails.
    pub fn teardown_label(&self) -> String {
        format!("teardown ({}::teardown)", self.name)
    }
}

impl fmt::Debug for TestGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestGroup")
            .field("name", &self.name)
            .field("has_setup", &self.setup.is_some())
            .field("has_teardown", &self.teardown.is_some())
            .field("cases", &self.cases.values().collect::<Vec<_>>())
            .finish()
    }
}

/// An ordered collection of test groups.
#[derive(Clone, Debug, Default)]
pub struct TestSuite {
    groups: IndexMap<String, TestGroup>,
}

impl TestSuite {
    /// Creates a new, empty suite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group. A group with the same name replaces the earlier one.
    pub fn group(mut self, group: TestGroup) -> Self {
        self.groups.insert(group.name.clone(), group);
        self
    }

    /// Iterates over the groups in this suite, in order.
    pub fn groups(&self) -> impl ExactSizeIterator<Item = &TestGroup> + '_ {
        self.groups.values()
    }

    /// Returns the ordered list of all units in this suite.
    pub fn units(&self) -> Vec<TestUnit> {
        self.groups
            .values()
            .flat_map(|group| {
                group
                    .cases
                    .keys()
                    .map(|name| TestUnit::new(group.name.clone(), name.clone()))
            })
            .collect()
    }

    /// Returns the total number of test cases.
    pub fn case_count(&self) -> usize {
        self.groups.values().map(|group| group.cases.len()).sum()
    }

    /// Finds the group and case a unit refers to.
    pub fn resolve(&self, unit: &TestUnit) -> Option<(&TestGroup, &TestCase)> {
        let group = self.groups.get(unit.group())?;
        let case = group.cases.get(unit.name())?;
        Some((group, case))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pass(_: &mut TestContext<'_>) -> Result<(), TestError> {
        Ok(())
    }

    #[test]
    fn units_preserve_order() {
        let suite = TestSuite::new()
            .group(
                TestGroup::new("b")
                    .case(TestCase::new("second", pass))
                    .case(TestCase::new("first", pass)),
            )
            .group(TestGroup::new("a").case(TestCase::new("only", pass)));

        let ids: Vec<_> = suite.units().iter().map(TestUnit::id).collect();
        assert_eq!(ids, vec!["b::second", "b::first", "a::only"]);
        assert_eq!(suite.case_count(), 3);
    }

    #[test]
    fn resolve_units() {
        let suite = TestSuite::new().group(
            TestGroup::new("g")
                .case(TestCase::new("t", pass).expected_failure())
                .case(TestCase::new("s", pass).skip("later")),
        );

        let (group, case) = suite.resolve(&TestUnit::new("g", "t")).unwrap();
        assert_eq!(group.name(), "g");
        assert_eq!(case.expectation(), Expectation::Failure);
        let (_, case) = suite.resolve(&TestUnit::new("g", "s")).unwrap();
        assert_eq!(case.skip_reason(), Some("later"));

        assert!(suite.resolve(&TestUnit::new("g", "missing")).is_none());
        assert!(suite.resolve(&TestUnit::new("missing", "t")).is_none());
    }

    #[test]
    fn hook_labels() {
        let group = TestGroup::new("pkg::Cls");
        assert_eq!(group.setup_label(), "setup (pkg::Cls::setup)");
        assert_eq!(group.teardown_label(), "teardown (pkg::Cls::teardown)");
    }
}

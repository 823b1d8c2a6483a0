// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for partest, a test harness that splits a suite into contiguous partitions,
//! runs each partition in its own worker process, and folds the workers' event streams back into a
//! single result.
//!
//! The flow of a run is:
//!
//! 1. [`suite::TestSuite::units`] produces the ordered list of [`suite::TestUnit`]s.
//! 2. [`partition::partition_units`] splits them into one [`partition::Partition`] per worker.
//! 3. [`runner::TestRunner`] starts a worker per partition through a [`runner::WorkerSpawner`].
//! 4. Each worker runs its partition with a [`worker::WorkerRunner`], which reports one
//!    [`event::Event`] per lifecycle callback.
//! 5. The coordinator feeds every event to a [`aggregator::ResultAggregator`], producing an
//!    [`aggregator::ConsolidatedResult`].

pub mod aggregator;
pub mod codec;
pub mod config;
pub mod errors;
pub mod event;
pub mod partition;
pub mod reporter;
pub mod runner;
pub mod signal;
pub mod suite;
mod time;
pub mod worker;

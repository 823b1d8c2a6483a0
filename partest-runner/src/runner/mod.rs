// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The coordinator.
//!
//! The main structure in this module is [`TestRunner`]. It splits the units into partitions, starts
//! one worker per partition through a [`WorkerSpawner`], and folds every worker's events into a
//! single [`ConsolidatedResult`](crate::aggregator::ConsolidatedResult).

mod imp;
mod spawn;

#[cfg(unix)]
#[path = "unix.rs"]
mod os;

#[cfg(windows)]
#[path = "windows.rs"]
mod os;

pub use imp::*;
pub use spawn::*;

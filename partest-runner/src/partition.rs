// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Splitting a suite's units across workers.
//!
//! Partitioning is static: it's decided once, before any worker starts. Units are split into
//! contiguous runs whose sizes differ by at most one, with the trailing partitions absorbing the
//! remainder. A unit's position within its partition is its *local index*, which is what workers
//! use to refer to it.

use crate::suite::TestUnit;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a worker, and the partition assigned to it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    /// Creates a new worker ID.
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Returns the zero-based position of this worker.
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// An ordered, contiguous slice of the suite assigned to one worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    worker: WorkerId,
    units: Vec<TestUnit>,
}

impl Partition {
    /// Creates a new partition.
    pub fn new(worker: WorkerId, units: Vec<TestUnit>) -> Self {
        Self { worker, units }
    }

    /// The worker this partition is assigned to.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Returns the unit at the given local index.
    pub fn get(&self, index: usize) -> Option<&TestUnit> {
        self.units.get(index)
    }

    /// The units in this partition, in order.
    pub fn units(&self) -> &[TestUnit] {
        &self.units
    }

    /// The number of units in this partition.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if this partition has no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Splits `units` into contiguous partitions, one per worker.
///
/// The number of partitions is `process_count`, clamped to at least 1 and at most the number of
/// units (an empty input produces a single empty partition). Partition sizes differ by at most one:
/// the remainder is spread over the trailing partitions, one extra unit each.
pub fn partition_units(units: Vec<TestUnit>, process_count: usize) -> Vec<Partition> {
    let count = process_count.clamp(1, units.len().max(1));
    let chunk = units.len() / count;
    let first_larger = count - units.len() % count;

    let mut partitions = Vec::with_capacity(count);
    let mut rest = units;
    for id in 0..count - 1 {
        let size = if id < first_larger { chunk } else { chunk + 1 };
        let tail = rest.split_off(size);
        partitions.push(Partition::new(WorkerId::new(id), rest));
        rest = tail;
    }
    partitions.push(Partition::new(WorkerId::new(count - 1), rest));

    tracing::debug!(
        sizes = ?partitions.iter().map(Partition::len).collect::<Vec<_>>(),
        "partitioned units across {count} workers",
    );
    partitions
}

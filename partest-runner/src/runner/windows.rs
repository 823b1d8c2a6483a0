// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

pub(super) fn set_process_group(_cmd: &mut std::process::Command) {}

/// Kills the worker. Windows has no graceful equivalent of SIGTERM for console processes, so the
/// grace period is unused.
pub(super) async fn terminate_child(child: &mut Child, _grace_period: Duration) {
    if let Err(error) = child.start_kill() {
        debug!("failed to kill worker: {error}");
    }
}

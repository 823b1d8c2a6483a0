// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use libc::{SIGKILL, SIGTERM};
use std::{os::unix::process::CommandExt, time::Duration};
use tokio::process::Child;
use tracing::debug;

/// Pre-execution configuration on Unix.
///
/// Each worker leads its own process group, so terminal signals reach only the coordinator and
/// terminating a worker also terminates anything the tests under it started.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

/// Sends SIGTERM to the worker's process group, then SIGKILL if it's still around after the grace
/// period.
pub(super) async fn terminate_child(child: &mut Child, grace_period: Duration) {
    let Some(pid) = child.id() else {
        // Already exited.
        return;
    };
    let pgid = -(pid as i32);

    unsafe { libc::kill(pgid, SIGTERM) };

    tokio::select! {
        _ = child.wait() => {}
        () = tokio::time::sleep(grace_period) => {
            debug!(pid, "worker didn't exit within {grace_period:?}, killing it");
            unsafe { libc::kill(pgid, SIGKILL) };
        }
    }
}

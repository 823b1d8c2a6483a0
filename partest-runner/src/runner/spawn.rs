// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Starting workers.
//!
//! A [`WorkerSpawner`] starts one worker per partition and hands it a [`WorkerChannel`] to report
//! back on. Two spawners are provided: [`ProcessSpawner`], which runs each worker in its own
//! process, and [`ThreadSpawner`], which runs workers on threads in the current process.

use super::os;
use crate::{
    errors::{EmitError, WorkerSpawnError},
    event::Event,
    partition::WorkerId,
    suite::TestSuite,
    worker::{EventSink, WorkerAssignment, WorkerLine, WorkerRunner},
};
use std::{
    borrow::Cow,
    ffi::OsString,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
    sync::{broadcast, mpsc},
};
use tracing::{debug, warn};

/// The hidden subcommand a test binary runs in worker mode.
pub const WORKER_SUBCOMMAND: &str = "__partest-worker";

/// The environment variable set to the worker's ID in worker processes.
pub const WORKER_ID_ENV: &str = "PARTEST_WORKER_ID";

/// A message from a worker to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMessage {
    /// An event.
    Event(Event),

    /// A line of output that wasn't an event.
    Output(String),

    /// A line that was marked as an event but couldn't be parsed.
    Malformed {
        /// The JSON text.
        line: String,
        /// The parse error, rendered.
        error: String,
    },

    /// The worker exited. This is the last message a worker sends.
    Exited(WorkerExit),
}

impl WorkerMessage {
    /// Turns a line read from a worker's stdout into messages.
    pub fn from_line(line: &str) -> Vec<Self> {
        match WorkerLine::parse(line) {
            WorkerLine::Output(output) => vec![Self::Output(output.to_owned())],
            WorkerLine::Event {
                leading_output,
                event,
            } => {
                let mut messages = Vec::with_capacity(2);
                if !leading_output.is_empty() {
                    messages.push(Self::Output(leading_output.to_owned()));
                }
                messages.push(match event {
                    Ok(event) => Self::Event(event),
                    Err((json, error)) => Self::Malformed {
                        line: json.to_owned(),
                        error: error.to_string(),
                    },
                });
                messages
            }
        }
    }
}

/// How a worker exited.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerExit {
    /// The worker ran its whole partition.
    Success,

    /// The worker process exited with a non-zero code.
    Code(i32),

    /// The worker process was killed by a signal.
    Signal(i32),

    /// An in-process worker returned an error or panicked, or the process couldn't be waited on.
    Failed(String),
}

impl WorkerExit {
    /// Returns true if the worker finished normally.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return Self::Success;
        }
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Failed(status.to_string())
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "exited successfully"),
            Self::Code(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "was killed by signal {signal}"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// The coordinator's end of the connection, handed to a worker when it's spawned.
#[derive(Debug)]
pub struct WorkerChannel {
    /// Sends messages to the coordinator. Bounded: a worker that gets ahead waits for the
    /// coordinator to catch up.
    pub sender: mpsc::Sender<WorkerMessage>,

    /// Receives a message when the coordinator wants the worker to stop.
    pub cancel: broadcast::Receiver<()>,

    /// How long a stopping worker gets before it's killed.
    pub grace_period: Duration,
}

/// Starts workers.
///
/// `spawn` is called from within the coordinator's Tokio runtime, and must not block.
pub trait WorkerSpawner: fmt::Debug + Send + Sync {
    /// Starts a worker running `assignment`.
    ///
    /// The worker sends its events through `channel`, followed by a single
    /// [`WorkerMessage::Exited`], and then drops the sender.
    fn spawn(
        &self,
        assignment: WorkerAssignment,
        channel: WorkerChannel,
    ) -> Result<(), WorkerSpawnError>;
}

/// Runs each worker in its own process.
///
/// The worker process is sent its assignment as JSON on stdin, and writes events as lines on
/// stdout. Its stderr is inherited.
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    /// Creates a spawner that runs `program` with `args` as the worker.
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a spawner that re-runs the current executable with [`WORKER_SUBCOMMAND`].
    pub fn current_exe() -> Result<Self, WorkerSpawnError> {
        let program = std::env::current_exe().map_err(WorkerSpawnError::CurrentExe)?;
        Ok(Self::new(program, [WORKER_SUBCOMMAND]))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        assignment: WorkerAssignment,
        channel: WorkerChannel,
    ) -> Result<(), WorkerSpawnError> {
        let worker = assignment.partition.worker();
        let input = serde_json::to_vec(&assignment).map_err(|error| {
            WorkerSpawnError::SendAssignment {
                worker,
                error: error.into(),
            }
        })?;

        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ID_ENV, worker.get().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        os::set_process_group(&mut cmd);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|error| WorkerSpawnError::Process { worker, error })?;
        debug!(
            %worker,
            pid = ?child.id(),
            units = assignment.partition.len(),
            "spawned worker process",
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        tokio::spawn(drive_process(worker, child, stdin, input, stdout, channel));
        Ok(())
    }
}

async fn drive_process(
    worker: WorkerId,
    mut child: Child,
    stdin: Option<ChildStdin>,
    input: Vec<u8>,
    stdout: Option<ChildStdout>,
    mut channel: WorkerChannel,
) {
    if let Some(mut stdin) = stdin {
        // Dropping stdin closes it, so the worker sees the end of its assignment.
        if let Err(error) = stdin.write_all(&input).await {
            debug!(%worker, "failed to write assignment: {error}");
        }
    }

    let mut cancelled = false;
    let mut read_error = None;
    if let Some(stdout) = stdout {
        // Test code may print arbitrary bytes, so lines are split on raw newlines and decoded
        // lossily rather than rejected.
        let mut lines = BufReader::new(stdout).split(b'\n');
        'read: loop {
            tokio::select! {
                line = lines.next_segment() => match line {
                    Ok(Some(line)) => {
                        for message in WorkerMessage::from_line(&decode_line(&line)) {
                            if channel.sender.send(message).await.is_err() {
                                // The coordinator has gone away.
                                let _ = child.start_kill();
                                break 'read;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(%worker, "failed to read worker output: {error}");
                        // Events after this point would be lost, so the worker can't finish
                        // cleanly.
                        let _ = child.start_kill();
                        read_error = Some(error);
                        break;
                    }
                },
                recv = channel.cancel.recv(), if !cancelled => {
                    cancelled = true;
                    if recv.is_ok() {
                        debug!(%worker, "terminating worker");
                    }
                    os::terminate_child(&mut child, channel.grace_period).await;
                }
            }
        }
    }

    let exit = match (child.wait().await, read_error) {
        (_, Some(error)) => WorkerExit::Failed(format!("failed to read worker output: {error}")),
        (Ok(status), None) => WorkerExit::from_status(status),
        (Err(error), None) => {
            WorkerExit::Failed(format!("failed to wait for worker process: {error}"))
        }
    };
    debug!(%worker, %exit, "worker process finished");
    let _ = channel.sender.send(WorkerMessage::Exited(exit)).await;
}

fn decode_line(line: &[u8]) -> Cow<'_, str> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

/// Runs each worker on a thread in the current process.
///
/// Workers share no mutable state with the coordinator: they see only their assignment and send
/// events over their channel. A cancelled worker stops at its next event, since threads can't be
/// killed.
#[derive(Clone, Debug)]
pub struct ThreadSpawner {
    suite: Arc<TestSuite>,
}

impl ThreadSpawner {
    /// Creates a spawner running tests from `suite`.
    pub fn new(suite: Arc<TestSuite>) -> Self {
        Self { suite }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &self,
        assignment: WorkerAssignment,
        channel: WorkerChannel,
    ) -> Result<(), WorkerSpawnError> {
        let worker = assignment.partition.worker();
        let suite = self.suite.clone();

        std::thread::Builder::new()
            .name(format!("partest-{worker}"))
            .spawn(move || {
                let WorkerChannel { sender, cancel, .. } = channel;
                let mut sink = ChannelSink {
                    sender: sender.clone(),
                    cancel,
                };
                let res = catch_unwind(AssertUnwindSafe(|| {
                    WorkerRunner::new(&suite, assignment.options)
                        .run(&assignment.partition, &mut sink)
                }));
                let exit = match res {
                    Ok(Ok(_)) => WorkerExit::Success,
                    Ok(Err(error)) => WorkerExit::Failed(error.to_string()),
                    Err(_) => WorkerExit::Failed("worker thread panicked".to_owned()),
                };
                let _ = sender.blocking_send(WorkerMessage::Exited(exit));
            })
            .map_err(|error| WorkerSpawnError::Thread { worker, error })?;
        Ok(())
    }
}

struct ChannelSink {
    sender: mpsc::Sender<WorkerMessage>,
    cancel: broadcast::Receiver<()>,
}

impl EventSink for ChannelSink {
    fn emit(&mut self, event: Event) -> Result<(), EmitError> {
        match self.cancel.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => return Err(EmitError::Disconnected),
        }
        self.sender
            .blocking_send(WorkerMessage::Event(event))
            .map_err(|_| EmitError::Disconnected)
    }
}

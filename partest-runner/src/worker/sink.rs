// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{errors::EmitError, event::Event};
use std::io::Write;

/// The prefix that marks a line on a worker's stdout as an event.
///
/// Test code may print to stdout too. Lines without the prefix are passed through as output, and
/// output that wasn't newline-terminated before an event shows up ahead of the prefix.
pub const EVENT_LINE_PREFIX: &str = "\u{1e}partest-event:";

/// Where a worker sends its events.
pub trait EventSink {
    /// Sends a single event. Events must arrive in the order they're emitted.
    fn emit(&mut self, event: Event) -> Result<(), EmitError>;
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) -> Result<(), EmitError> {
        self.push(event);
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: Event) -> Result<(), EmitError> {
        (**self).emit(event)
    }
}

/// Writes events as prefixed JSON lines, flushing after each one.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    /// Creates a new sink around `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn emit(&mut self, event: Event) -> Result<(), EmitError> {
        let json = serde_json::to_string(&event).map_err(EmitError::Serialize)?;
        // One write call per event, so the line can't be split by other writers.
        let line = format!("{EVENT_LINE_PREFIX}{json}\n");
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(EmitError::Write)
    }
}

/// A line read from a worker's stdout.
#[derive(Debug)]
pub enum WorkerLine<'a> {
    /// Plain output from test code.
    Output(&'a str),

    /// An event, possibly preceded by unterminated output from test code.
    Event {
        /// Output that appeared on the same line before the event.
        leading_output: &'a str,
        /// The parsed event, or the JSON that failed to parse and the parse error.
        event: Result<Event, (&'a str, serde_json::Error)>,
    },
}

impl<'a> WorkerLine<'a> {
    /// Classifies a single line, without its trailing newline.
    pub fn parse(line: &'a str) -> Self {
        match line.find(EVENT_LINE_PREFIX) {
            Some(pos) => {
                let json = &line[pos + EVENT_LINE_PREFIX.len()..];
                Self::Event {
                    leading_output: &line[..pos],
                    event: serde_json::from_str(json).map_err(|error| (json, error)),
                }
            }
            None => Self::Output(line),
        }
    }
}

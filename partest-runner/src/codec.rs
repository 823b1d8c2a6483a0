// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Converting live test errors into payloads that can cross a process boundary.
//!
//! A [`TestError`] is created inside a worker and may carry arbitrary structured state. Only an
//! [`ExceptionPayload`] ever leaves the worker: a type name, a message and the formatted traceback
//! text, plus the structured detail if (and only if) it survives a serialization round trip.
//!
//! The traceback text is rendered when the error is constructed, before any transport is attempted,
//! so it is available even when the detail cannot be transported.

use crate::errors::TransportError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    borrow::Cow,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
};
use swrite::{SWrite, swrite, swriteln};

/// The type name used in place of the original one when an error could not be transported.
pub const TRANSPORT_FAILURE_TYPE: &str = "partest::TransportFailure";

/// The message used in place of the original one when an error could not be transported.
pub const TRANSPORT_FAILURE_MESSAGE: &str = "the original error could not be transported out of \
     the worker process; see the traceback text for the original failure";

/// The type name used for test failures created through [`TestError::failure`].
pub const FAILURE_TYPE: &str = "partest::Failure";

/// The type name used for panics with a string payload.
pub const PANIC_TYPE: &str = "panic";

/// What a [`TestError`] means for the test that produced it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestErrorKind {
    /// An assertion failed. Rust's assertion macros panic, so string panics map here too.
    Failure,

    /// The test hit an unexpected error.
    Error,

    /// The test asked to be skipped.
    Skip(String),
}

/// An error returned (or raised through a panic) by a test body.
///
/// Any `std::error::Error` converts into a `TestError` of kind [`TestErrorKind::Error`], so `?`
/// works inside test bodies.
pub struct TestError {
    kind: TestErrorKind,
    type_name: Cow<'static, str>,
    message: String,
    traceback: String,
    detail: Option<Box<dyn TransportDetail>>,
}

impl TestError {
    /// Creates a test failure, the equivalent of a failed assertion.
    #[track_caller]
    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        let location = std::panic::Location::caller();
        let mut traceback = String::new();
        swriteln!(traceback, "failure raised at {location}:");
        swrite!(traceback, "{FAILURE_TYPE}: {message}");
        push_backtrace(&mut traceback, &Backtrace::capture());

        Self {
            kind: TestErrorKind::Failure,
            type_name: Cow::Borrowed(FAILURE_TYPE),
            message,
            traceback,
            detail: None,
        }
    }

    /// Creates an error from any `std::error::Error`, recording its source chain.
    pub fn error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<E>();
        let message = error.to_string();
        let mut traceback = format!("{type_name}: {message}");
        let mut source = error.source();
        if source.is_some() {
            swrite!(traceback, "\n\nCaused by:");
        }
        while let Some(cause) = source {
            swrite!(traceback, "\n    {cause}");
            source = cause.source();
        }
        push_backtrace(&mut traceback, &Backtrace::capture());

        Self {
            kind: TestErrorKind::Error,
            type_name: Cow::Borrowed(type_name),
            message,
            traceback,
            detail: None,
        }
    }

    /// Creates a request to skip the current test or subtest.
    pub fn skip(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            kind: TestErrorKind::Skip(reason.clone()),
            type_name: Cow::Borrowed("partest::Skip"),
            traceback: format!("skipped: {reason}"),
            message: reason,
            detail: None,
        }
    }

    /// Builds an error from a caught panic.
    ///
    /// `location` and `backtrace` come from the panic hook, if it ran.
    pub(crate) fn from_panic(
        payload: Box<dyn Any + Send>,
        location: Option<String>,
        backtrace: Option<&Backtrace>,
    ) -> Self {
        let location = location.unwrap_or_else(|| "<unknown location>".to_owned());
        let message = match payload.downcast_ref::<&'static str>() {
            Some(s) => Some((*s).to_owned()),
            None => payload.downcast_ref::<String>().cloned(),
        };

        match message {
            Some(message) => {
                let mut traceback = format!("panicked at {location}:\n{message}");
                if let Some(backtrace) = backtrace {
                    push_backtrace(&mut traceback, backtrace);
                }
                Self {
                    kind: TestErrorKind::Failure,
                    type_name: Cow::Borrowed(PANIC_TYPE),
                    message,
                    traceback,
                    detail: None,
                }
            }
            None => {
                let message = "panicked with a non-string payload".to_owned();
                let mut traceback = format!("panicked at {location}:\n{message}");
                if let Some(backtrace) = backtrace {
                    push_backtrace(&mut traceback, backtrace);
                }
                Self {
                    kind: TestErrorKind::Error,
                    type_name: Cow::Borrowed("panic(Box<dyn Any>)"),
                    message,
                    traceback,
                    detail: Some(Box::new(OpaquePanicPayload { _payload: payload })),
                }
            }
        }
    }

    /// Attaches structured state that should travel with the error.
    ///
    /// The state is transported only if it serializes to JSON and deserializes back into `T`. If
    /// either step fails, the whole error degrades to a transport-failure payload when encoded.
    pub fn with_detail<T>(mut self, detail: T) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.detail = Some(Box::new(SerdeDetail(detail)));
        self
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> &TestErrorKind {
        &self.kind
    }

    /// Returns the name of the error's type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the traceback text rendered when the error was created.
    pub fn traceback(&self) -> &str {
        &self.traceback
    }

    /// Encodes this error into a transport-safe payload. See [`ExceptionPayload::encode`].
    pub fn encode(&self) -> ExceptionPayload {
        ExceptionPayload::encode(self)
    }
}

impl<E> From<E> for TestError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::error(error)
    }
}

impl fmt::Debug for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestError")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("message", &self.message)
            .field("has_detail", &self.detail.is_some())
            .finish()
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// The transport-safe form of a [`TestError`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExceptionPayload {
    type_name: String,
    message: String,
    traceback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl ExceptionPayload {
    /// Encodes a live error.
    ///
    /// This never fails and never panics. If the error's detail cannot be transported, the result
    /// is a payload with type [`TRANSPORT_FAILURE_TYPE`] and message [`TRANSPORT_FAILURE_MESSAGE`]
    /// that still carries the original traceback text verbatim.
    pub fn encode(error: &TestError) -> Self {
        let detail = match &error.detail {
            None => Ok(None),
            Some(detail) => {
                // A user-provided Serialize impl may panic: treat that as a transport failure too.
                match catch_unwind(AssertUnwindSafe(|| detail.transport())) {
                    Ok(res) => res.map(Some),
                    Err(_) => Err(TransportError::Panicked),
                }
            }
        };

        match detail {
            Ok(detail) => Self {
                type_name: error.type_name.clone().into_owned(),
                message: error.message.clone(),
                traceback: error.traceback.clone(),
                detail,
            },
            Err(err) => {
                tracing::debug!(
                    type_name = %error.type_name,
                    "error could not be transported, degrading: {err}",
                );
                Self::transport_failure(error.traceback.clone())
            }
        }
    }

    /// Creates a transport-failure payload around the given traceback text.
    pub fn transport_failure(traceback: impl Into<String>) -> Self {
        Self {
            type_name: TRANSPORT_FAILURE_TYPE.to_owned(),
            message: TRANSPORT_FAILURE_MESSAGE.to_owned(),
            traceback: traceback.into(),
            detail: None,
        }
    }

    /// Returns the type name: either the original type's, or [`TRANSPORT_FAILURE_TYPE`].
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the original traceback text.
    pub fn traceback(&self) -> &str {
        &self.traceback
    }

    /// Returns true if the original error could not be transported.
    pub fn is_transport_failure(&self) -> bool {
        self.type_name == TRANSPORT_FAILURE_TYPE
    }

    /// Returns the transported detail as raw JSON, if any was attached and preserved.
    pub fn detail(&self) -> Option<&serde_json::Value> {
        self.detail.as_ref()
    }

    /// Reconstructs the transported detail as `T`.
    ///
    /// Returns `Ok(None)` if no detail was preserved.
    pub fn decode_detail<T: DeserializeOwned>(&self) -> Result<Option<T>, TransportError> {
        self.detail
            .as_ref()
            .map(|value| T::deserialize(value).map_err(TransportError::Reconstruct))
            .transpose()
    }

    /// Renders the text shown to users in reports.
    ///
    /// This is the traceback text, followed by a note when the error was degraded.
    pub fn render(&self) -> String {
        let mut out = self.traceback.clone();
        if self.is_transport_failure() {
            swrite!(out, "\n\n{}: {}", self.type_name, self.message);
        }
        out
    }
}

fn push_backtrace(out: &mut String, backtrace: &Backtrace) {
    if backtrace.status() == BacktraceStatus::Captured {
        swrite!(out, "\n\nstack backtrace:\n{backtrace}");
    }
}

/// Structured state attached to a [`TestError`].
trait TransportDetail: Send {
    /// Serializes the state and confirms that it can be reconstructed.
    fn transport(&self) -> Result<serde_json::Value, TransportError>;
}

struct SerdeDetail<T>(T);

impl<T> TransportDetail for SerdeDetail<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn transport(&self) -> Result<serde_json::Value, TransportError> {
        let value = serde_json::to_value(&self.0).map_err(TransportError::Serialize)?;
        // The coordinator must be able to rebuild the state, so check that here.
        T::deserialize(&value).map_err(TransportError::Reconstruct)?;
        Ok(value)
    }
}

// Kept alive (and dropped in the worker) but never transported.
struct OpaquePanicPayload {
    _payload: Box<dyn Any + Send>,
}

impl TransportDetail for OpaquePanicPayload {
    fn transport(&self) -> Result<serde_json::Value, TransportError> {
        Err(TransportError::Opaque)
    }
}

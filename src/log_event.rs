//! Log event representation for the relay.
//!
//! A `FemtoLogEvent` is an immutable value captured at the point the
//! application logs. The timestamp is taken at construction so events that
//! spend time in the fallback store keep their original capture time when
//! they are eventually replayed to the broker.

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::level::FemtoLevel;

/// Serialisable description of an error attached to a log event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Top-level error message.
    pub message: String,
    /// Free-form trace text. May span multiple lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Capture `err` and its `source()` chain.
    ///
    /// Each cause is rendered on its own `caused by:` line in `trace`.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            trace: (!causes.is_empty()).then(|| causes.join("\n")),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trace {
            Some(trace) => write!(f, "{}\n{}", self.message, trace),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FemtoLogEvent {
    /// Time the event was captured.
    pub timestamp: DateTime<Utc>,
    pub level: FemtoLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl FemtoLogEvent {
    /// Construct an event stamped with the current time.
    pub fn new(level: FemtoLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: ErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    /// Construct an event with an explicit capture time.
    pub fn at(timestamp: DateTime<Utc>, level: FemtoLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
            error: None,
        }
    }
}

impl fmt::Display for FemtoLogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.message
        )?;
        if let Some(error) = &self.error {
            write!(f, "\n {error}")?;
        }
        Ok(())
    }
}

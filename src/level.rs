use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity attached to every [`FemtoLogEvent`](crate::log_event::FemtoLogEvent).
///
/// The ordering follows severity, so `FemtoLevel::Warning < FemtoLevel::Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FemtoLevel {
    Information,
    Warning,
    Error,
    Critical,
}

impl Default for FemtoLevel {
    fn default() -> Self {
        Self::Information
    }
}

impl FemtoLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            FemtoLevel::Information => "INFORMATION",
            FemtoLevel::Warning => "WARNING",
            FemtoLevel::Error => "ERROR",
            FemtoLevel::Critical => "CRITICAL",
        }
    }

    pub fn parse_or_information(s: &str) -> Self {
        s.parse().unwrap_or(Self::Information)
    }
}

impl fmt::Display for FemtoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name is not recognised.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct ParseLevelError(String);

impl FromStr for FemtoLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Framework levels below Information collapse onto it.
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "DEBUG" | "INFO" | "INFORMATION" => Ok(Self::Information),
            "WARN" | "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" | "FATAL" => Ok(Self::Critical),
            _ => Err(ParseLevelError(s.to_owned())),
        }
    }
}

impl From<log::Level> for FemtoLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace | log::Level::Debug | log::Level::Info => Self::Information,
            log::Level::Warn => Self::Warning,
            log::Level::Error => Self::Error,
        }
    }
}

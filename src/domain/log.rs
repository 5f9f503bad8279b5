//! Build log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a build log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One line of a step's user-visible log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,

    /// Severity
    pub level: LogLevel,

    /// Display text
    pub message: String,

    /// Display colour requested by a structured tool message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colour: Option<String>,
}

impl LogEntry {
    /// Create an entry stamped with the current time
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            colour: None,
        }
    }

    /// Attach a display colour (empty colours are dropped)
    pub fn with_colour(mut self, colour: impl Into<String>) -> Self {
        let colour = colour.into();
        if !colour.is_empty() {
            self.colour = Some(colour);
        }
        self
    }
}

//! Streamed child-process output.
//!
//! Every process run produces a finite sequence of `ProcessOutputLine`s that
//! ends with exactly one terminal line: `Completed`, `Cancelled`, or an
//! `Error` line carrying a fault.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a streamed output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Standard output (or the start notification)
    Output,

    /// Standard error, or a terminal failure when a fault is attached
    Error,

    /// The process exited on its own
    Completed,

    /// The caller cancelled the run
    Cancelled,
}

/// Why a process run ended abnormally
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "fault")]
pub enum ProcessFault {
    #[error("process timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("process was cancelled")]
    Cancelled,

    #[error("failed to start '{executable}': {reason}")]
    Spawn { executable: String, reason: String },

    #[error("failed to read process output: {message}")]
    Io { message: String },

    #[error("process supervisor stopped unexpectedly: {message}")]
    Internal { message: String },
}

impl ProcessFault {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One unit of streamed process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutputLine {
    pub content: String,
    pub kind: OutputKind,

    /// Display colour from a structured message
    pub colour: Option<String>,

    /// Whether the content came from a structured (JSON) line
    pub parsed_json: bool,

    pub fault: Option<ProcessFault>,
    pub exit_code: Option<i32>,

    /// OS process id, set on the start notification
    pub process_id: Option<u32>,
}

impl ProcessOutputLine {
    fn with_kind(kind: OutputKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind,
            colour: None,
            parsed_json: false,
            fault: None,
            exit_code: None,
            process_id: None,
        }
    }

    /// Plain standard-output line
    pub fn output(content: impl Into<String>) -> Self {
        Self::with_kind(OutputKind::Output, content)
    }

    /// Message decoded from a structured standard-output line
    pub fn structured(content: impl Into<String>, colour: impl Into<String>) -> Self {
        let colour = colour.into();
        let mut line = Self::with_kind(OutputKind::Output, content);
        line.parsed_json = true;
        line.colour = (!colour.is_empty()).then_some(colour);
        line
    }

    /// Standard-error line (not terminal)
    pub fn stderr(content: impl Into<String>) -> Self {
        Self::with_kind(OutputKind::Error, content)
    }

    /// Start notification
    pub fn started(process_id: Option<u32>, description: &str) -> Self {
        let content = match process_id {
            Some(pid) => format!("Started process {} ({})", pid, description),
            None => format!("Started process ({})", description),
        };
        let mut line = Self::with_kind(OutputKind::Output, content);
        line.process_id = process_id;
        line
    }

    /// Terminal: the process exited with a code
    pub fn completed(exit_code: i32) -> Self {
        let mut line = Self::with_kind(
            OutputKind::Completed,
            format!("Process exited with code {}", exit_code),
        );
        line.exit_code = Some(exit_code);
        line
    }

    /// Terminal: the caller cancelled the run
    pub fn cancelled() -> Self {
        let mut line = Self::with_kind(OutputKind::Cancelled, "Process was cancelled");
        line.fault = Some(ProcessFault::Cancelled);
        line
    }

    /// Terminal: the run failed
    pub fn fault(fault: ProcessFault) -> Self {
        let mut line = Self::with_kind(OutputKind::Error, fault.to_string());
        line.fault = Some(fault);
        line
    }

    /// Whether no further lines may follow this one
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            OutputKind::Completed | OutputKind::Cancelled => true,
            OutputKind::Error => self.fault.is_some(),
            OutputKind::Output => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_kinds() {
        assert!(!ProcessOutputLine::output("hello").is_terminal());
        assert!(!ProcessOutputLine::stderr("warning: foo").is_terminal());
        assert!(!ProcessOutputLine::started(Some(42), "sh").is_terminal());
        assert!(ProcessOutputLine::completed(0).is_terminal());
        assert!(ProcessOutputLine::cancelled().is_terminal());
        assert!(ProcessOutputLine::fault(ProcessFault::Timeout {
            after: Duration::from_secs(1)
        })
        .is_terminal());
    }

    #[test]
    fn test_structured_drops_empty_colour() {
        let line = ProcessOutputLine::structured("hi", "");
        assert!(line.parsed_json);
        assert_eq!(line.colour, None);

        let line = ProcessOutputLine::structured("hi", "red");
        assert_eq!(line.colour.as_deref(), Some("red"));
    }

    #[test]
    fn test_timeout_fault_message() {
        let fault = ProcessFault::Timeout {
            after: Duration::from_millis(1500),
        };
        assert_eq!(fault.to_string(), "process timed out after 1500ms");
        assert!(fault.is_timeout());
        assert!(!fault.is_cancellation());
    }
}

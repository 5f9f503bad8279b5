//! Supervised execution of external tools.
//!
//! `ProcessExecutor::execute` spawns one command on a background task and
//! hands back a `ProcessStream` the caller drains concurrently. The run stops
//! when the process exits, when the caller's token is cancelled, or when the
//! per-run timeout elapses, and always ends with exactly one terminal line.
//! Failures never escape as errors; they arrive as terminal lines.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{ProcessFault, ProcessOutputLine};

use super::output_parser;
use super::tracker::ProcessTracker;

/// Timeout used when a request does not set one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a stopped child gets to be reaped before it is left to the sweep
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One command to run
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub executable: PathBuf,
    pub working_dir: PathBuf,

    /// Raw argument string, split without a shell (see [`split_arguments`])
    pub arguments: String,

    pub timeout: Duration,

    /// Build to track the process under; untracked when `None`
    pub build_id: Option<Uuid>,
}

impl ProcessRequest {
    pub fn new(
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
            arguments: arguments.into(),
            timeout: DEFAULT_TIMEOUT,
            build_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn for_build(mut self, build_id: Uuid) -> Self {
        self.build_id = Some(build_id);
        self
    }

    /// Human-readable command line
    pub fn describe(&self) -> String {
        if self.arguments.trim().is_empty() {
            self.executable.display().to_string()
        } else {
            format!("{} {}", self.executable.display(), self.arguments.trim())
        }
    }
}

/// Spawns supervised processes
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    tracker: Arc<ProcessTracker>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(ProcessTracker::shared())
    }
}

impl ProcessExecutor {
    /// Create an executor registering its processes with `tracker`
    pub fn new(tracker: Arc<ProcessTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    /// Start a process run
    ///
    /// Must be called inside a Tokio runtime. The returned stream is
    /// finite and cannot be restarted.
    pub fn execute(&self, request: ProcessRequest, cancel: &CancellationToken) -> ProcessStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let run = ProcessRun {
            request,
            tracker: self.tracker.clone(),
            tx,
        };
        let handle = tokio::spawn(run.drive(cancel.clone()));

        ProcessStream {
            rx,
            handle: Some(handle),
            finished: false,
        }
    }
}

/// Receiving side of a process run
pub struct ProcessStream {
    rx: mpsc::UnboundedReceiver<ProcessOutputLine>,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl ProcessStream {
    /// Next output line; `None` once the terminal line has been returned
    pub async fn next(&mut self) -> Option<ProcessOutputLine> {
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(line) => {
                self.finished = line.is_terminal();
                Some(line)
            }
            None => {
                // The producer went away without a terminal line
                self.finished = true;
                let message = match self.handle.take() {
                    Some(handle) => match handle.await {
                        Err(e) if e.is_panic() => "process supervisor panicked".to_string(),
                        Err(e) => e.to_string(),
                        Ok(()) => "output closed without a terminal event".to_string(),
                    },
                    None => "output closed without a terminal event".to_string(),
                };
                Some(ProcessOutputLine::fault(ProcessFault::Internal { message }))
            }
        }
    }

    /// Drain the whole run
    pub async fn collect(mut self) -> Vec<ProcessOutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = self.next().await {
            lines.push(line);
        }
        lines
    }
}

enum RunEnd {
    Exited(i32),

    /// Stopped by cancellation or timeout
    Interrupted,
}

enum Pipe {
    Stdout(String),
    Stderr(String),
}

/// Producer side of one run; dropping it closes the output channel
struct ProcessRun {
    request: ProcessRequest,
    tracker: Arc<ProcessTracker>,
    tx: mpsc::UnboundedSender<ProcessOutputLine>,
}

impl ProcessRun {
    fn emit(&self, line: ProcessOutputLine) {
        // The consumer may have stopped listening
        let _ = self.tx.send(line);
    }

    #[instrument(skip_all, fields(command = %self.request.describe(), build_id = ?self.request.build_id))]
    async fn drive(self, cancel: CancellationToken) {
        // Fires on caller cancellation or when the timer elapses
        let linked = cancel.child_token();
        let timeout = self.request.timeout;
        let timer = {
            let linked = linked.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                linked.cancel();
            })
        };

        let result = self.run(&linked).await;
        timer.abort();

        let terminal = match result {
            Ok(RunEnd::Exited(code)) => ProcessOutputLine::completed(code),
            Ok(RunEnd::Interrupted) if cancel.is_cancelled() => {
                info!("process cancelled by caller");
                ProcessOutputLine::cancelled()
            }
            Ok(RunEnd::Interrupted) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "process timed out");
                ProcessOutputLine::fault(ProcessFault::Timeout { after: timeout })
            }
            Err(fault) => {
                warn!(error = %fault, "process run failed");
                ProcessOutputLine::fault(fault)
            }
        };
        self.emit(terminal);
    }

    async fn run(&self, linked: &CancellationToken) -> Result<RunEnd, ProcessFault> {
        if linked.is_cancelled() {
            return Ok(RunEnd::Interrupted);
        }

        let mut command = Command::new(&self.request.executable);
        command
            .args(split_arguments(&self.request.arguments))
            .current_dir(&self.request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| ProcessFault::Spawn {
            executable: self.request.executable.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let description = self.request.describe();
        if let (Some(pid), Some(build_id)) = (pid, self.request.build_id) {
            self.tracker.register(pid, build_id, description.clone());
        }
        info!(?pid, "process started");
        self.emit(ProcessOutputLine::started(pid, &description));

        let (pipe_tx, mut pipes) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Pipe::Stdout, pipe_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Pipe::Stderr, pipe_tx.clone()));
        }
        drop(pipe_tx);

        let result = self.supervise(&mut child, &mut pipes, linked).await;
        match result {
            Ok(RunEnd::Exited(code)) => {
                info!(?pid, exit_code = code, "process exited");
                if let Some(pid) = pid {
                    self.tracker.unregister(pid);
                }
            }
            _ => self.stop_child(&mut child, pid).await,
        }
        for reader in readers {
            reader.abort();
        }

        result
    }

    async fn supervise(
        &self,
        child: &mut Child,
        pipes: &mut mpsc::UnboundedReceiver<io::Result<Pipe>>,
        linked: &CancellationToken,
    ) -> Result<RunEnd, ProcessFault> {
        let mut pipes_open = true;

        loop {
            tokio::select! {
                biased;

                () = linked.cancelled() => return Ok(RunEnd::Interrupted),

                piped = pipes.recv(), if pipes_open => match piped {
                    Some(Ok(Pipe::Stdout(chunk))) => self.publish_stdout(&chunk),
                    Some(Ok(Pipe::Stderr(line))) => self.emit(ProcessOutputLine::stderr(line)),
                    Some(Err(e)) => return Err(ProcessFault::Io { message: e.to_string() }),
                    None => pipes_open = false,
                },

                status = child.wait(), if !pipes_open => {
                    let status = status.map_err(|e| ProcessFault::Io { message: e.to_string() })?;
                    return Ok(RunEnd::Exited(exit_code(status)));
                }
            }
        }
    }

    /// Split a stdout chunk into trimmed lines and decode structured ones
    fn publish_stdout(&self, chunk: &str) {
        for line in chunk.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
            let parsed = output_parser::try_parse(line);
            if parsed.structured {
                for (text, colour) in parsed.messages {
                    self.emit(ProcessOutputLine::structured(text, colour));
                }
            } else {
                self.emit(ProcessOutputLine::output(line));
            }
        }
    }

    /// Kill and reap the direct child after an interrupted or failed run
    async fn stop_child(&self, child: &mut Child, pid: Option<u32>) {
        if let Err(e) = child.start_kill() {
            debug!(?pid, error = %e, "kill failed; process may already have exited");
        }

        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(_)) => {
                if let Some(pid) = pid {
                    self.tracker.unregister(pid);
                }
            }
            Ok(Err(e)) => {
                warn!(?pid, error = %e, "could not reap stopped process; leaving it tracked");
            }
            Err(_) => {
                warn!(?pid, "process ignored kill; leaving it tracked for the sweep");
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn spawn_reader<R>(
    reader: R,
    wrap: fn(String) -> Pipe,
    tx: mpsc::UnboundedSender<io::Result<Pipe>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(&['\n', '\r'][..])
                        .to_string();
                    if tx.send(Ok(wrap(line))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    })
}

/// Split a raw argument string into argv without invoking a shell
///
/// Whitespace separates arguments. Single and double quotes group text;
/// inside double quotes a backslash escapes `"` or `\`.
pub fn split_arguments(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => match chars.peek().copied() {
                Some(next) if next == '"' || next == '\\' => {
                    current.push(next);
                    chars.next();
                }
                _ => current.push(c),
            },
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_arg = true;
                }
                c if c.is_whitespace() => {
                    if in_arg {
                        args.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_arg = true;
                }
            },
        }
    }
    if in_arg {
        args.push(current);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutputKind;

    #[test]
    fn test_split_plain_arguments() {
        assert_eq!(split_arguments("sign  --verbose  a.exe"), vec!["sign", "--verbose", "a.exe"]);
        assert!(split_arguments("   ").is_empty());
    }

    #[test]
    fn test_split_quoted_arguments() {
        assert_eq!(
            split_arguments(r#"-c "echo hello; echo oops 1>&2""#),
            vec!["-c", "echo hello; echo oops 1>&2"]
        );
        assert_eq!(split_arguments("commit -m 'two words'"), vec!["commit", "-m", "two words"]);
        assert_eq!(split_arguments(r#"say "a \"quoted\" word""#), vec!["say", r#"a "quoted" word"#]);
        assert_eq!(split_arguments(r#"--name="" x"#), vec!["--name=", "x"]);
        assert_eq!(split_arguments(r#""""#), vec![""]);
    }

    #[test]
    fn test_describe_request() {
        let request = ProcessRequest::new("git", "/tmp", "  fetch --all ");
        assert_eq!(request.describe(), "git fetch --all");
        assert_eq!(ProcessRequest::new("git", "/tmp", "").describe(), "git");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_is_split_and_trimmed() {
        let executor = ProcessExecutor::new(Arc::new(ProcessTracker::new()));
        let request = ProcessRequest::new("sh", ".", r#"-c "printf '  one  \n\n two\n'""#);

        let lines = executor.execute(request, &CancellationToken::new()).collect().await;
        let outputs: Vec<&str> = lines
            .iter()
            .filter(|l| l.kind == OutputKind::Output && l.process_id.is_none())
            .map(|l| l.content.as_str())
            .collect();

        assert_eq!(outputs, vec!["one", "two"]);
        assert_eq!(lines.last().unwrap().kind, OutputKind::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_structured_output_is_decoded() {
        let executor = ProcessExecutor::new(Arc::new(ProcessTracker::new()));
        let request = ProcessRequest::new(
            "sh",
            ".",
            r#"-c "echo 'JSON{\"message\":\"hi\",\"colour\":\"red\"}'""#,
        );

        let lines = executor.execute(request, &CancellationToken::new()).collect().await;
        let structured: Vec<_> = lines.iter().filter(|l| l.parsed_json).collect();

        assert_eq!(structured.len(), 1);
        assert_eq!(structured[0].content, "hi");
        assert_eq!(structured[0].colour.as_deref(), Some("red"));
    }
}

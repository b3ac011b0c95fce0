//! Running external tools.
//!
//! A [`ProcessRunner`] executes exactly one tool invocation: it enforces the
//! deadline, keeps a bounded tail of the combined stdout/stderr for
//! diagnostics, and reports which output file (if any) the tool produced.
//! It never retries and never interprets tool-specific flags.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default number of output lines kept for diagnostics
pub const DEFAULT_TAIL_LINES: usize = 40;

/// Longest single line kept in the tail; the rest of the line is dropped
const MAX_LINE_LEN: usize = 512;

/// How long to wait for the output readers once the process is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// File extensions left behind by interrupted downloads
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp", ".tmp"];

/// What the caller expects the tool to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputExpectation {
    /// Nothing is expected on disk
    None,
    /// Exactly this path
    File(PathBuf),
    /// A file in `dir` whose name starts with `prefix`, for tools that choose
    /// the extension themselves
    Prefixed { dir: PathBuf, prefix: String },
}

/// One invocation of an external tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub expect: OutputExpectation,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            expect: OutputExpectation::None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn expect(mut self, expect: OutputExpectation) -> Self {
        self.expect = expect;
        self
    }
}

/// Outcome of a tool that ran to completion (whatever its exit code)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub output_tail: String,
    pub produced_path: Option<PathBuf>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        program: String,
        timeout: Duration,
        output_tail: String,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String, output_tail: String },
}

impl RunError {
    pub fn output_tail(&self) -> &str {
        match self {
            RunError::Timeout { output_tail, .. } | RunError::Cancelled { output_tail, .. } => {
                output_tail
            }
            _ => "",
        }
    }
}

/// Executes external tools. Implemented by [`CommandRunner`] for real
/// processes and by scripted fakes in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run one invocation. Firing `cancel` terminates the process the same way
    /// an expired deadline does, but reports [`RunError::Cancelled`].
    async fn run(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<RunResult, RunError>;
}

/// Bounded ring of the most recent output lines
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    current: Vec<u8>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            current: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Feed raw bytes. Both `\n` and `\r` end a line so progress meters that
    /// redraw in place do not grow a single unbounded line.
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.end_line();
            } else if self.current.len() < MAX_LINE_LEN {
                self.current.push(byte);
            }
        }
    }

    fn end_line(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.current).trim_end().to_string();
        self.current.clear();
        if line.is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn finish(mut self) -> String {
        self.end_line();
        self.lines.into_iter().collect::<Vec<_>>().join("\n")
    }

    fn snapshot(&self) -> String {
        let pending = String::from_utf8_lossy(&self.current);
        let mut lines: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        if !pending.trim().is_empty() {
            lines.push(pending.trim_end());
        }
        lines.join("\n")
    }
}

/// Runs tools as child processes on the tokio runtime
#[derive(Debug, Clone)]
pub struct CommandRunner {
    tail_lines: usize,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    fn spawn_reader<R>(reader: Option<R>, tail: Arc<Mutex<OutputTail>>) -> Option<JoinHandle<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = reader?;
        Some(tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut tail) = tail.lock() {
                            tail.push_bytes(&buf[..n]);
                        }
                    }
                }
            }
        }))
    }

    async fn drain_readers(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            if tokio::time::timeout(READER_GRACE, handle).await.is_err() {
                tracing::debug!("Output reader still busy after process exit, detaching");
            }
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

enum Waited {
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessRunner for CommandRunner {
    async fn run(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<RunResult, RunError> {
        let Invocation {
            program,
            args,
            timeout,
            expect,
        } = invocation;

        tracing::debug!(program = %program, args = ?args, timeout = ?timeout, "Starting process");
        let started = Instant::now();

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.clone(),
                source,
            })?;

        let tail = Arc::new(Mutex::new(OutputTail::new(self.tail_lines)));
        let readers: Vec<JoinHandle<()>> = [
            Self::spawn_reader(child.stdout.take(), tail.clone()),
            Self::spawn_reader(child.stderr.take(), tail.clone()),
        ]
        .into_iter()
        .flatten()
        .collect();

        let waited = tokio::select! {
            status = tokio::time::timeout(timeout, child.wait()) => match status {
                Ok(Ok(status)) => Waited::Exited(status),
                Ok(Err(e)) => Waited::WaitFailed(e),
                Err(_) => Waited::TimedOut,
            },
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        if matches!(waited, Waited::TimedOut | Waited::Cancelled) {
            if let Err(e) = child.kill().await {
                tracing::warn!(program = %program, error = %e, "Failed to kill process");
            }
        }

        Self::drain_readers(readers).await;
        let output_tail = match tail.lock() {
            Ok(tail) => tail.snapshot(),
            Err(_) => String::new(),
        };

        match waited {
            Waited::Exited(status) => {
                let exit_code = status.code();
                let produced_path = if status.success() {
                    resolve_output(&expect).await
                } else {
                    None
                };
                tracing::debug!(
                    program = %program,
                    exit_code = ?exit_code,
                    elapsed = ?started.elapsed(),
                    "Process exited"
                );
                Ok(RunResult {
                    exit_code,
                    output_tail,
                    produced_path,
                })
            }
            Waited::WaitFailed(source) => Err(RunError::Wait { program, source }),
            Waited::TimedOut => {
                tracing::warn!(program = %program, timeout = ?timeout, "Process timed out, killed");
                Err(RunError::Timeout {
                    program,
                    timeout,
                    output_tail,
                })
            }
            Waited::Cancelled => {
                tracing::info!(program = %program, "Process cancelled, killed");
                Err(RunError::Cancelled {
                    program,
                    output_tail,
                })
            }
        }
    }
}

/// Locate the file a tool produced according to `expect`
pub async fn resolve_output(expect: &OutputExpectation) -> Option<PathBuf> {
    match expect {
        OutputExpectation::None => None,
        OutputExpectation::File(path) => match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Some(path.clone()),
            _ => None,
        },
        OutputExpectation::Prefixed { dir, prefix } => find_prefixed(dir, prefix).await,
    }
}

async fn find_prefixed(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut best: Option<(u64, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(prefix) || PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if best.as_ref().map_or(true, |(len, _)| meta.len() > *len) {
            best = Some((meta.len(), entry.path()));
        }
    }

    best.map(|(_, path)| path)
}

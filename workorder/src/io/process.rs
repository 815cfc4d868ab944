//! Helpers for running child processes with timeouts and bounded output.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// Interval between cancellation checks while waiting on a child.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long output readers may lag behind a killed process tree.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// The OS refused to start the program (missing binary, permission denied).
///
/// Kept as a distinct type so callers can tell launch failures from other
/// plumbing errors with `downcast_ref`.
#[derive(Debug, Error)]
#[error("failed to launch {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Render both streams with truncation markers, for log files.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_lossy());
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_lossy());
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        if self.cancelled {
            buf.push_str(&format!("\n[{label} cancelled]\n"));
        }
        buf
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// When `cancel` is set the child is killed as soon as the token fires. The child is always
/// reaped before this returns, including on timeout and cancellation.
///
/// On Unix the child leads its own process group and the whole group is killed, so
/// descendants holding the output pipes cannot keep the call alive past `timeout`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(source) => {
            error!(err = %source, program = %program, "failed to spawn command");
            return Err(SpawnError { program, source }.into());
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || match child_stdin.write_all(&input) {
                Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
                _ => Ok(()),
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let mut readers = OutputReaders::spawn(stdout, stderr, output_limit_bytes);

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        let slice = if cancel.is_some() {
            remaining.min(POLL_INTERVAL)
        } else {
            remaining
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("cancellation requested, killing");
            cancelled = true;
        } else if started.elapsed() >= timeout {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        kill_tree(&mut child);
        break child.wait().context("wait command after kill")?;
    };

    // Descendants may still hold the pipes after the child itself exited; that
    // counts against the same timeout.
    let drain_deadline = if timed_out || cancelled {
        Instant::now() + KILL_GRACE
    } else {
        (started + timeout).max(Instant::now())
    };
    if !readers.wait_until(drain_deadline) && !timed_out && !cancelled {
        warn!("output still open after child exit, killing process group");
        timed_out = true;
        kill_tree(&mut child);
        readers.wait_until(Instant::now() + KILL_GRACE);
    }
    let elapsed = started.elapsed();

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(err = %err, "failed to write stdin"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }
    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = readers.finish()?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        elapsed,
    })
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type Captured = (Vec<u8>, usize);

/// Reader threads for both pipes, collected with a deadline.
struct OutputReaders {
    rx: Receiver<(Stream, Result<Captured>)>,
    stdout: Option<Result<Captured>>,
    stderr: Option<Result<Captured>>,
}

impl OutputReaders {
    fn spawn<O, E>(stdout: O, stderr: E, limit: usize) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        thread::spawn(move || {
            let _ = tx.send((Stream::Stdout, read_stream_limited(stdout, limit)));
        });
        thread::spawn(move || {
            let _ = err_tx.send((Stream::Stderr, read_stream_limited(stderr, limit)));
        });
        Self {
            rx,
            stdout: None,
            stderr: None,
        }
    }

    fn done(&self) -> bool {
        self.stdout.is_some() && self.stderr.is_some()
    }

    /// Wait for both streams to hit EOF; `false` if `deadline` passed first.
    fn wait_until(&mut self, deadline: Instant) -> bool {
        while !self.done() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok((Stream::Stdout, result)) => self.stdout = Some(result),
                Ok((Stream::Stderr, result)) => self.stderr = Some(result),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {
                    let lost = || Err(anyhow!("output reader thread panicked"));
                    self.stdout.get_or_insert_with(lost);
                    self.stderr.get_or_insert_with(lost);
                }
            }
        }
        true
    }

    /// Captured streams; a stream still held open is reported empty.
    fn finish(self) -> Result<(Captured, Captured)> {
        if !self.done() {
            warn!("abandoning output readers held open by an escaped process");
        }
        let stdout = self.stdout.unwrap_or_else(|| Ok((Vec::new(), 0)));
        let stderr = self.stderr.unwrap_or_else(|| Ok((Vec::new(), 0)));
        Ok((stdout.context("read stdout")?, stderr.context("read stderr")?))
    }
}

/// Kill the child's process group (Unix), then the child itself.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let result = Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => debug!(group = %group, "killed process group"),
            Ok(status) => debug!(group = %group, ?status, "process group already gone"),
            Err(err) => warn!(err = %err, "failed to run kill for process group"),
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill child");
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

//! Running child processes with a timeout while appending their output to a log.
//!
//! On unix the child leads its own process group, so a timeout or an
//! interrupt kills everything it started, not only the direct child.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::signals::CancelToken;

/// Exit code reported when the runner itself killed the child on timeout.
pub const EXIT_TIMEOUT: i32 = 124;

const WAIT_SLICE: Duration = Duration::from_millis(200);
/// How long output pipes may stay open after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Outcome of a logged child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code, `128 + signal` for signal deaths, 124 on runner timeout.
    pub exit_code: i32,
    pub timed_out: bool,
    /// The cancel token fired and the child was killed.
    pub cancelled: bool,
    /// Bytes dropped from the middle of the output once the limit was reached.
    pub truncated_bytes: usize,
}

type SharedLog = Arc<Mutex<LogSink>>;

/// Log writer with a byte budget split between the head and the tail.
///
/// Lines are written as they arrive until the head half is spent. After that
/// they are held in a ring that keeps the last `tail_limit` bytes, written
/// behind an omission marker when the process ends. Summaries printed at the
/// end of a run therefore always reach the log.
struct LogSink {
    writer: BufWriter<File>,
    head_remaining: usize,
    tail: VecDeque<Vec<u8>>,
    tail_bytes: usize,
    tail_limit: usize,
    truncated: usize,
    closed: bool,
}

impl LogSink {
    fn new(file: File, limit: usize) -> Self {
        let head = limit / 2;
        Self {
            writer: BufWriter::new(file),
            head_remaining: head,
            tail: VecDeque::new(),
            tail_bytes: 0,
            tail_limit: limit - head,
            truncated: 0,
            closed: false,
        }
    }

    fn write_line(&mut self, line: &[u8]) {
        if self.closed {
            return;
        }
        if self.tail.is_empty() && line.len() <= self.head_remaining {
            self.head_remaining -= line.len();
            self.append(line);
            return;
        }
        // Once a line spills over, everything goes through the ring to keep order.
        self.head_remaining = 0;
        self.tail_bytes += line.len();
        self.tail.push_back(line.to_vec());
        while self.tail_bytes > self.tail_limit {
            let excess = self.tail_bytes - self.tail_limit;
            let Some(front) = self.tail.front_mut() else {
                break;
            };
            if front.len() <= excess {
                self.tail_bytes -= front.len();
                self.truncated += front.len();
                self.tail.pop_front();
            } else {
                front.drain(..excess);
                self.tail_bytes -= excess;
                self.truncated += excess;
            }
        }
    }

    /// Write the held-back tail; later lines are ignored.
    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.truncated > 0 {
            let marker = format!("[buildloop] ... {} bytes of output omitted ...\n", self.truncated);
            self.append(marker.as_bytes());
        }
        let tail = std::mem::take(&mut self.tail);
        for line in &tail {
            self.append(line);
        }
        self.tail_bytes = 0;
    }

    fn append(&mut self, bytes: &[u8]) {
        if let Err(e) = self
            .writer
            .write_all(bytes)
            .and_then(|()| self.writer.flush())
        {
            warn!(err = %e, "failed to append to log");
        }
    }
}

/// Run `cmd`, appending stdout and stderr line by line to `log_path`.
///
/// Output is read concurrently while the child runs so pipes never fill up.
/// At most `output_limit_bytes` are kept: the start of the output and its
/// last lines, with the middle dropped and counted. The child's process group
/// is killed when `timeout` elapses or `cancel` fires, and also when the child
/// exits but processes it left behind keep the output pipes open.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), log = %log_path.display()))]
pub fn run_logged(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    log_path: &Path,
    cancel: &CancelToken,
) -> Result<ProcessOutcome> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log {}", log_path.display()))?;
    let sink: SharedLog = Arc::new(Mutex::new(LogSink::new(file, output_limit_bytes)));

    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // A child that exits without reading stdin closes the pipe; that is not our error.
            Some(thread::spawn(move || {
                let _ = child_stdin.write_all(&input);
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
    let stdout_sink = sink.clone();
    let stderr_sink = sink.clone();
    let readers = [
        thread::spawn(move || tee_lines(stdout, &stdout_sink)),
        thread::spawn(move || tee_lines(stderr, &stderr_sink)),
    ];

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(WAIT_SLICE).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing child process group");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            timed_out = true;
        } else {
            continue;
        }
        kill_process_group(&mut child)?;
        break child.wait().context("wait command after kill")?;
    };

    if !readers_finished(&readers, DRAIN_GRACE) {
        warn!("output pipes still open after the child exited, killing leftover processes");
        kill_process_group(&mut child)?;
        if !readers_finished(&readers, DRAIN_GRACE) {
            warn!("output pipes held outside the process group, not waiting for them");
        }
    }
    for reader in readers {
        if reader.is_finished() {
            join_reader(reader).context("join output reader")?;
        }
    }
    if let Some(handle) = stdin_handle {
        if handle.is_finished() {
            let _ = handle.join();
        }
    }

    let truncated_bytes = match sink.lock() {
        Ok(mut sink) => {
            sink.finish();
            sink.truncated
        }
        Err(_) => return Err(anyhow!("log writer poisoned")),
    };
    if truncated_bytes > 0 {
        warn!(truncated_bytes, "output limit reached, middle of the log dropped");
    }

    let exit_code = if cancelled {
        cancel.exit_code()
    } else if timed_out {
        EXIT_TIMEOUT
    } else {
        exit_code_of(status)
    };
    debug!(exit_code, timed_out, cancelled, "command finished");
    Ok(ProcessOutcome {
        exit_code,
        timed_out,
        cancelled,
        truncated_bytes,
    })
}

/// Exit code of a finished process; signal deaths map to `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// SIGKILL the child's process group. A group that is already gone is fine.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context("kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e).context("kill command"),
    }
}

fn readers_finished(readers: &[JoinHandle<Result<()>>], grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if readers.iter().all(JoinHandle::is_finished) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(DRAIN_POLL);
    }
}

fn tee_lines<R: Read>(reader: R, sink: &SharedLog) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            return Ok(());
        }
        let mut sink = sink.lock().map_err(|_| anyhow!("log writer poisoned"))?;
        sink.write_line(&line);
    }
}

fn join_reader(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

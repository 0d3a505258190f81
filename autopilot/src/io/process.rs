//! Helpers for running child processes with timeouts and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Failure to run a child process.
///
/// Spawn failures are split out so callers can treat "the program never
/// started" differently from failures after it was running.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
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
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Options for [`run_command`].
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bound on stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// When set, every stdout line is also appended to this file as it arrives.
    pub stream_path: Option<PathBuf>,
}

type StreamSink = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. A child that outlives
/// `timeout` is killed and reported with `timed_out = true`.
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs(), streaming = options.stream_path.is_some()))]
pub fn run_command(mut cmd: Command, options: &RunOptions<'_>) -> Result<CommandOutput, CommandError> {
    if options.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(program = %program, err = %e, "failed to spawn command");
            return Err(CommandError::Spawn { program, source: e });
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let sink: StreamSink = Arc::new(open_stream_file(options.stream_path.as_deref())?);
    let limit = options.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, sink));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    if let Some(input) = options.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin closes the pipe; its exit status tells the story.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "failed to write child stdin");
        }
    }

    let mut timed_out = false;
    let status = match child
        .wait_timeout(options.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = options.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn open_stream_file(path: Option<&Path>) -> anyhow::Result<Option<Mutex<BufWriter<File>>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
    Ok(Some(Mutex::new(BufWriter::new(file))))
}

fn join_output(
    handle: thread::JoinHandle<anyhow::Result<(Vec<u8>, usize)>>,
) -> anyhow::Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, tee-ing each line to `sink`.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    sink: StreamSink,
) -> anyhow::Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *sink
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> anyhow::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn options(timeout: Duration) -> RunOptions<'static> {
        RunOptions {
            stdin: None,
            timeout,
            output_limit_bytes: 1_000,
            stream_path: None,
        }
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = run_command(cmd, &options(Duration::from_secs(10))).expect("run");
        assert_eq!(output.stdout_lossy().trim(), "hello");
        assert_eq!(output.stderr_lossy().trim(), "oops");
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin_to_child() {
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let opts = RunOptions {
            stdin: Some(b"prompt text"),
            ..options(Duration::from_secs(10))
        };
        let output = run_command(cmd, &opts).expect("run");
        assert_eq!(output.stdout_lossy(), "prompt text");
    }

    #[test]
    fn kills_child_after_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let output = run_command(cmd, &options(Duration::from_millis(100))).expect("run");
        assert!(output.timed_out);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-binary-autopilot");
        let err = run_command(cmd, &options(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn truncates_and_streams_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs/stream.jsonl");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'line-one\\nline-two\\n'"]);
        let opts = RunOptions {
            output_limit_bytes: 4,
            stream_path: Some(stream.clone()),
            ..options(Duration::from_secs(10))
        };
        let output = run_command(cmd, &opts).expect("run");
        assert_eq!(output.stdout, b"line");
        assert_eq!(output.stdout_truncated, 14);
        let streamed = std::fs::read_to_string(&stream).expect("read stream");
        assert_eq!(streamed, "line-one\nline-two\n");
    }
}

//! Child-process plumbing: bounded capture and line-streamed stdout.
//!
//! Exit status is always read from the child handle returned by the spawn,
//! never inferred from surrounding shell state, and output is drained on
//! reader threads so a chatty child cannot deadlock against a full pipe.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of a child process run with [`run_capture`].
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Result of a child process run with [`run_streaming`]; stdout went to the
/// sink line by line instead of being collected here.
#[derive(Debug)]
pub struct StreamedOutput {
    pub status: ExitStatus,
    pub stderr: String,
    pub timed_out: bool,
}

/// Receives each stdout line as the child produces it.
pub trait LineSink {
    /// Called once per line, without the trailing newline.
    fn line(&mut self, line: &str);
}

/// Run a command, handing each stdout line to `sink` as it arrives.
///
/// The sink runs on a dedicated reader thread and is returned once the child
/// has exited, so callers get their accumulated state back. On timeout the
/// child is killed and `timed_out` is set; the recorded status is then the
/// kill status.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_streaming<S>(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    stderr_limit_bytes: usize,
    sink: S,
) -> Result<(StreamedOutput, S)>
where
    S: LineSink + Send + 'static,
{
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        write_stdin(&mut child_stdin, input)?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || -> Result<S> {
        let mut sink = sink;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).context("read stdout line")?;
            if n == 0 {
                break;
            }
            sink.line(line.trim_end_matches(['\r', '\n']));
        }
        Ok(sink)
    });
    let stderr_handle = thread::spawn(move || read_limited(stderr, stderr_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let sink = stdout_handle
        .join()
        .map_err(|_| anyhow!("stdout reader thread panicked"))??;
    let (stderr, stderr_truncated) = stderr_handle
        .join()
        .map_err(|_| anyhow!("stderr reader thread panicked"))??;
    if stderr_truncated > 0 {
        warn!(stderr_truncated, "stderr truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok((
        StreamedOutput {
            status,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
        },
        sink,
    ))
}

/// Run a command with a timeout and capture stdout/stderr, both bounded by
/// `output_limit_bytes` (bytes beyond the limit are discarded while still
/// draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_capture(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CapturedOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        write_stdin(&mut child_stdin, input)?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
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
    Ok(CapturedOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
    })
}

/// Feed input to the child's stdin.
///
/// A child that exits (or closes stdin) before consuming everything breaks
/// the pipe; that is not an error here, the exit status and whatever output
/// the child produced still matter.
fn write_stdin<W: Write>(writer: &mut W, input: &[u8]) -> Result<()> {
    match writer.write_all(input) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("child closed stdin early");
            Ok(())
        }
        Err(err) => Err(err).context("write stdin"),
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
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

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectSink(Vec<String>);

    impl LineSink for CollectSink {
        fn line(&mut self, line: &str) {
            self.0.push(line.to_string());
        }
    }

    #[test]
    fn streams_lines_in_order_and_reports_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two; exit 3"]);

        let (output, sink) = run_streaming(
            cmd,
            None,
            Duration::from_secs(5),
            10_000,
            CollectSink(Vec::new()),
        )
        .expect("run");

        assert_eq!(sink.0, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin_to_child() {
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let (output, sink) = run_streaming(
            cmd,
            Some(b"hello\nworld\n"),
            Duration::from_secs(5),
            10_000,
            CollectSink(Vec::new()),
        )
        .expect("run");

        assert_eq!(sink.0, vec!["hello".to_string(), "world".to_string()]);
        assert!(output.status.success());
    }

    #[test]
    fn capture_times_out_and_kills() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");

        let output =
            run_capture(cmd, None, Duration::from_millis(100), 10_000).expect("run capture");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn capture_survives_child_ignoring_stdin() {
        // Larger than the pipe buffer, so the write hits a broken pipe once
        // the child exits without reading.
        let input = vec![b'x'; 1 << 20];
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; exit 3"]);

        let output =
            run_capture(cmd, Some(&input), Duration::from_secs(5), 10_000).expect("run capture");
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn capture_respects_output_limit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdefghij'"]);

        let output = run_capture(cmd, None, Duration::from_secs(5), 4).expect("run capture");
        assert_eq!(output.stdout, "abcd");
    }
}

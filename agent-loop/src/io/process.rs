//! Child processes with a timeout and bounded captured output.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Human-readable failure reason, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        if self.timed_out {
            return Some(format!(
                "timed out after {}s",
                self.elapsed.as_secs()
            ));
        }
        if self.status.success() {
            return None;
        }
        Some(match self.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        })
    }
}

/// Build a `Command` from an argv vector, running in `cwd`.
pub fn command_from_argv(argv: &[String], cwd: &Path) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must not be empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    Ok(cmd)
}

/// How long output readers may stay open once the child has exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Longest single wait handed to the OS.
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Run a command with a timeout, capturing stdout/stderr without pipe
/// deadlocks.
///
/// Stdin, stdout and stderr are serviced on their own threads while the
/// child runs. `output_limit_bytes` bounds what is kept of each stream; the
/// rest is drained and counted. On unix the child leads its own process
/// group, and a child that outlives `timeout` is killed together with
/// everything it spawned. Descendants that keep the output pipes open after
/// the child exits get [`OUTPUT_GRACE`] before the group is killed too.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    lead_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || feed_stdin(child_stdin, &input)))
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

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child
        .wait_timeout(timeout.min(MAX_WAIT))
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };
    let elapsed = started.elapsed();

    if !finished_within(&[&stdout_handle, &stderr_handle], OUTPUT_GRACE) {
        warn!("output still open after exit, killing leftover processes");
        if let Err(err) = kill_process_group(&mut child) {
            debug!(err = %err, "process group already gone");
        }
        finished_within(&[&stdout_handle, &stderr_handle], OUTPUT_GRACE);
    }

    if let Some(handle) = stdin_handle.filter(|handle| handle.is_finished()) {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(err = %err, "failed to write child stdin"),
            Err(_) => warn!("stdin writer thread panicked"),
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// Children that exit without reading stdin close the pipe early; that is
/// not an error.
fn feed_stdin(mut child_stdin: ChildStdin, input: &[u8]) -> io::Result<()> {
    match child_stdin.write_all(input) {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

type ReaderHandle = JoinHandle<Result<(Vec<u8>, usize)>>;

/// Poll until every handle has finished or `grace` runs out.
fn finished_within(handles: &[&ReaderHandle], grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if handles.iter().all(|handle| handle.is_finished()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Output of a finished reader. A reader still blocked on a pipe held open
/// by an escaped process is detached and yields nothing.
fn join_output(handle: ReaderHandle) -> Result<(Vec<u8>, usize)> {
    if !handle.is_finished() {
        warn!("output pipe still held open, discarding stream");
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(unix)]
fn lead_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn lead_process_group(_cmd: &mut Command) {}

/// SIGKILL the child's process group, which shares the child's pid.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => {
            warn!(err = %errno, "killpg failed, killing child only");
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> io::Result<()> {
    child.kill()
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let output = run_command_with_timeout(
            sh("cat; echo done >&2"),
            Some(b"hello"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout_text(), "hello");
        assert_eq!(output.stderr_text(), "done\n");
        assert!(output.failure_reason().is_none());
    }

    #[test]
    fn kills_on_timeout() {
        let output =
            run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024)
                .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(output.failure_reason().expect("reason").starts_with("timed out"));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 8; echo late"),
            None,
            Duration::from_millis(300),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "took {:?}",
            started.elapsed()
        );
        assert!(!output.stdout_text().contains("late"));
    }

    #[test]
    fn background_process_does_not_hold_up_a_finished_child() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 8 & echo done"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(output.success());
        assert!(
            started.elapsed() < Duration::from_secs(6),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(output.stdout_text(), "done\n");
    }

    #[test]
    fn bounds_captured_output() {
        let output = run_command_with_timeout(
            sh("printf '%0100d' 0"),
            None,
            Duration::from_secs(10),
            10,
        )
        .expect("run");
        assert_eq!(output.stdout.len(), 10);
        assert_eq!(output.stdout_truncated, 90);
    }

    #[test]
    fn reports_exit_code() {
        let output =
            run_command_with_timeout(sh("exit 3"), None, Duration::from_secs(10), 1024)
                .expect("run");
        assert_eq!(output.failure_reason().as_deref(), Some("exit code 3"));
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let big = vec![b'x'; 1 << 20];
        let output =
            run_command_with_timeout(sh("exit 0"), Some(&big), Duration::from_secs(10), 1024)
                .expect("run");
        assert!(output.success());
    }

    #[test]
    fn empty_argv_is_rejected() {
        let err = command_from_argv(&[], Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }
}

//! Child processes under a wall-clock deadline, with capped stream capture.
//!
//! On unix the child leads its own process group, and a deadline kills the
//! whole group so grandchildren (`sh -c "sleep 8; ..."`) die with it. Output
//! readers get a short grace period after a kill; anything still holding the
//! pipes after that is abandoned with whatever was captured so far.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may keep draining after the child was killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// One captured stream: the kept prefix plus how many bytes were dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    /// Kept bytes followed by a marker line when anything was dropped.
    pub fn with_marker(&self, stream: &str) -> Vec<u8> {
        let mut out = self.bytes.clone();
        if self.dropped > 0 {
            let marker = format!("\n[{stream}: {} bytes dropped]\n", self.dropped);
            out.extend_from_slice(marker.as_bytes());
        }
        out
    }

    fn push(&mut self, chunk: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.bytes.len()).min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..room]);
        self.dropped = self.dropped.saturating_add(chunk.len() - room);
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Spawns `cmd` with stdin closed and both output pipes drained concurrently.
///
/// Each stream keeps at most `cap` bytes. When `deadline` elapses the child's
/// process group is killed and `timed_out` is set. Non-zero exits are not
/// errors here.
#[instrument(skip_all, fields(deadline_ms = deadline.map(millis), cap = cap))]
pub fn run_command(
    mut cmd: Command,
    deadline: Option<Duration>,
    cap: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let out_reader = Reader::spawn(child.stdout.take(), cap)?;
    let err_reader = Reader::spawn(child.stderr.take(), cap)?;
    let (status, timed_out) = wait_for(&mut child, deadline)?;
    let grace = timed_out.then_some(KILL_GRACE);
    let stdout = out_reader.finish(grace).context("collect stdout")?;
    let stderr = err_reader.finish(grace).context("collect stderr")?;

    if stdout.dropped + stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output exceeded capture cap"
        );
    }
    debug!(code = ?status.code(), timed_out, "child exited");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn wait_for(child: &mut Child, deadline: Option<Duration>) -> Result<(ExitStatus, bool)> {
    let Some(deadline) = deadline else {
        return Ok((child.wait().context("wait for child")?, false));
    };
    if let Some(status) = child.wait_timeout(deadline).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(deadline_ms = millis(deadline), "deadline passed, killing child");
    kill_tree(child)?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match i32::try_from(child.id()) {
        Ok(pgid) => {
            if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                debug!(%err, "killpg failed, killing child only");
                child.kill().context("kill child")?;
            }
            Ok(())
        }
        Err(_) => child.kill().context("kill child"),
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill child")
}

/// A pipe drained on its own thread into a shared buffer.
struct Reader {
    captured: Arc<Mutex<Captured>>,
    done: Receiver<std::io::Result<()>>,
}

impl Reader {
    fn spawn<R>(pipe: Option<R>, cap: usize) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let mut pipe = pipe.ok_or_else(|| anyhow!("child pipe missing"))?;
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            let result = loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break Ok(()),
                    Ok(n) => match sink.lock() {
                        Ok(mut captured) => captured.push(&buf[..n], cap),
                        Err(_) => break Ok(()),
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => break Err(err),
                }
            };
            let _ = tx.send(result);
        });
        Ok(Self { captured, done })
    }

    /// Wait for EOF (bounded by `grace` when set) and return the capture.
    fn finish(self, grace: Option<Duration>) -> Result<Captured> {
        let finished = match grace {
            None => self
                .done
                .recv()
                .map_err(|_| anyhow!("reader thread panicked"))?,
            Some(grace) => match self.done.recv_timeout(grace) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("pipe still open after kill, abandoning reader");
                    Ok(())
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("reader thread panicked"));
                }
            },
        };
        finished.context("read child pipe")?;
        let captured = self
            .captured
            .lock()
            .map_err(|_| anyhow!("capture buffer poisoned"))?;
        Ok(captured.clone())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let output = run_command(sh("echo out; echo err >&2; exit 3"), None, 1024).expect("run");
        assert_eq!(output.stdout.bytes, b"out\n");
        assert_eq!(output.stderr.bytes, b"err\n");
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.timed_out);
    }

    #[test]
    fn output_beyond_cap_is_counted() {
        let output = run_command(sh("printf 0123456789"), None, 4).expect("run");
        assert_eq!(output.stdout.bytes, b"0123");
        assert_eq!(output.stdout.dropped, 6);
        assert_eq!(
            output.stdout.with_marker("stdout"),
            b"0123\n[stdout: 6 bytes dropped]\n".to_vec()
        );
    }

    #[test]
    fn deadline_kills_child() {
        let output =
            run_command(sh("exec sleep 5"), Some(Duration::from_millis(200)), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn deadline_kills_grandchildren_holding_pipes() {
        let started = Instant::now();
        let output = run_command(
            sh("echo started; sleep 8; echo done"),
            Some(Duration::from_millis(300)),
            1024,
        )
        .expect("run");
        let elapsed = started.elapsed();
        assert!(output.timed_out);
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
        assert_eq!(output.stdout.bytes, b"started\n");
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}

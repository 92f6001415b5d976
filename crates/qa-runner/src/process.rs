//! Child processes with a hard wall-clock budget.
//!
//! Every child is started as the leader of its own process group so that a
//! timeout can take down the whole tree an installer or worker spawned.

use anyhow::{anyhow, Result};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct ProcessOutcome {
    /// `None` when the child was killed after exceeding its budget.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn exit_code_label(&self) -> String {
        match (self.timed_out, self.status.and_then(|s| s.code())) {
            (true, _) => "timeout".to_string(),
            (false, Some(code)) => code.to_string(),
            (false, None) => "signal".to_string(),
        }
    }
}

fn signal_group(pgid: i32, signal: i32) {
    // SAFETY: killpg only reads its integer arguments.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal, error = %err, "killpg failed");
        }
    }
}

/// Whether `pid` has exited, without reaping it. Until it is reaped the pid,
/// and with it the group id, cannot be handed to another process.
fn has_exited(pid: u32) -> Result<bool> {
    // SAFETY: an all-zero siginfo_t is a valid out-parameter for waitid.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let flags = libc::WEXITED | libc::WNOHANG | libc::WNOWAIT;
    // SAFETY: `info` outlives the call and `pid` is our own child.
    let rc = unsafe { libc::waitid(libc::P_PID, pid, &mut info, flags) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(anyhow!("waitid({}) failed: {}", pid, err));
    }
    // SAFETY: waitid either filled `info` or left it zeroed.
    Ok(unsafe { info.si_pid() } != 0)
}

/// Spawn `cmd` in a fresh process group, optionally feeding `stdin_bytes`, and
/// wait at most `timeout`. Stdout/stderr routing is left to the caller.
pub fn run_with_deadline(
    mut cmd: Command,
    stdin_bytes: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ProcessOutcome> {
    cmd.process_group(0);
    cmd.stdin(if stdin_bytes.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("failed to spawn {:?}: {}", cmd.get_program(), e))?;
    let pgid = i32::try_from(child.id()).map_err(|_| anyhow!("child pid out of range"))?;

    // Written from a thread so a child that never reads stdin cannot stall us.
    let feeder = match (child.stdin.take(), stdin_bytes) {
        (Some(mut stdin), Some(bytes)) => Some(thread::spawn(move || {
            let _ = stdin.write_all(&bytes);
        })),
        _ => None,
    };

    let deadline = started + timeout;
    let mut timed_out = false;
    let status = loop {
        if has_exited(child.id())? {
            // The leader is still unreaped, so the group id cannot have been
            // reused; take down background stragglers holding our output files.
            signal_group(pgid, libc::SIGKILL);
            break Some(child.wait()?);
        }
        if Instant::now() >= deadline {
            timed_out = true;
            debug!(pgid, "budget exceeded, terminating process group");
            signal_group(pgid, libc::SIGTERM);
            let grace = Instant::now() + TERM_GRACE;
            while Instant::now() < grace {
                if has_exited(child.id())? {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
            signal_group(pgid, libc::SIGKILL);
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };
    if let Some(handle) = feeder {
        let _ = handle.join();
    }

    Ok(ProcessOutcome {
        status,
        timed_out,
        elapsed: started.elapsed(),
    })
}

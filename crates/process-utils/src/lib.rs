//! Child-process helpers shared across the workspace.
//!
//! Long-running tools are never awaited unconditionally: callers hand in a
//! cancellation token and [`wait_or_terminate`] races the child against it.
//! On cancellation the child gets a graceful termination signal first and is
//! force-killed once the grace window elapses.
//!
//! On unix every child started through [`tokio_command`] leads its own process
//! group, and signals go to the whole group. A shell wrapping a pipeline or a
//! backgrounded tool therefore takes its descendants down with it.

use std::ffi::OsStr;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio_util::sync::CancellationToken;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Default grace window between the termination signal and a forced kill.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is killed if its handle is dropped, so an abandoned future never
/// leaks a running tool. On unix the child is placed in a new process group
/// whose id equals its pid.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// How a supervised child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child exited on its own.
    Exited(ExitStatus),
    /// Cancellation was requested and the child was stopped.
    ///
    /// `forced` is true when the child ignored the termination signal and had
    /// to be killed after the grace window.
    Cancelled { forced: bool },
}

/// Wait for `child` to exit, terminating it if `cancel` fires first.
pub async fn wait_or_terminate(
    child: &mut Child,
    cancel: &CancellationToken,
    grace: Duration,
) -> io::Result<WaitOutcome> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        status = child.wait() => return Ok(WaitOutcome::Exited(status?)),
    }

    let forced = terminate(child, grace).await?;
    Ok(WaitOutcome::Cancelled { forced })
}

/// Send a graceful termination signal, then kill after `grace`.
///
/// Returns whether a forced kill was needed.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<bool> {
    if child.try_wait()?.is_some() {
        return Ok(false);
    }

    let pid = child.id();
    send_terminate(child, pid)?;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            status?;
            sweep_group(pid)?;
            Ok(false)
        }
        Err(_) => {
            force_kill(child, pid).await?;
            Ok(true)
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) -> io::Result<()> {
    let Some(pid) = pid else {
        // Already reaped.
        return Ok(());
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: plain syscall addressing a process group we created; no memory
    // is shared.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) -> io::Result<()> {
    signal_group(pid, libc::SIGTERM)
}

/// The leader exited; members that ignored `SIGTERM` are killed outright.
#[cfg(unix)]
fn sweep_group(pid: Option<u32>) -> io::Result<()> {
    signal_group(pid, libc::SIGKILL)
}

#[cfg(unix)]
async fn force_kill(child: &mut Child, pid: Option<u32>) -> io::Result<()> {
    signal_group(pid, libc::SIGKILL)?;
    child.wait().await?;
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) -> io::Result<()> {
    child.start_kill()
}

#[cfg(not(unix))]
fn sweep_group(_pid: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
async fn force_kill(child: &mut Child, _pid: Option<u32>) -> io::Result<()> {
    child.kill().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_exits_normally() {
        let mut child = tokio_command("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let cancel = CancellationToken::new();

        let outcome = wait_or_terminate(&mut child, &cancel, DEFAULT_TERMINATE_GRACE)
            .await
            .unwrap();

        match outcome {
            WaitOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let mut child = tokio_command("sleep").arg("30").spawn().unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = wait_or_terminate(&mut child, &cancel, DEFAULT_TERMINATE_GRACE)
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Cancelled { forced: false });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ignored_sigterm_is_force_killed() {
        let mut child = tokio_command("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let forced = terminate(&mut child, Duration::from_millis(300))
            .await
            .unwrap();

        assert!(forced);
        assert!(child.try_wait().unwrap().is_some());
    }

    /// Whether `pid` names a live (non-zombie) process.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_reaches_background_descendants() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = tokio_command("sh")
            .args(["-c", "sleep 30 & echo $!; wait"])
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().parse().unwrap();
        assert!(process_alive(grandchild));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = wait_or_terminate(&mut child, &cancel, DEFAULT_TERMINATE_GRACE)
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Cancelled { forced: false });
        assert!(wait_until_gone(grandchild).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_force_kill_reaches_descendants_ignoring_sigterm() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = tokio_command("sh")
            .args(["-c", "trap '' TERM; sh -c \"trap '' TERM; sleep 30\" & echo $!; wait"])
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().parse().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let forced = terminate(&mut child, Duration::from_millis(300))
            .await
            .unwrap();

        assert!(forced);
        assert!(wait_until_gone(grandchild).await);
    }
}

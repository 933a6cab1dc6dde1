//! Ownership of the engine's child process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// A running engine process.
///
/// The engine is started in its own process group so that termination reaches any workers it
/// forked. Dropping an [EngineProcess] that has not been reaped kills the whole group, so no
/// exit path leaves orphans behind.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    pid: Option<u32>,
    reaped: bool,
}

impl EngineProcess {
    pub fn spawn(mut command: Command) -> std::io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pid = child.id();

        Ok(Self {
            child,
            pid,
            reaped: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the process to exit on its own. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(status)
    }

    /// Ask the process group to terminate, then force it after `grace`.
    ///
    /// Always reaps the process before returning. Returns `true` if the engine exited within the
    /// grace period.
    pub async fn terminate(&mut self, grace: Duration) -> bool {
        if self.reaped {
            return true;
        }

        self.signal_group(GroupSignal::Terminate);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("Engine exited after termination request with {status}");
                self.reaped = true;
                // Workers that ignored the signal must not outlive the engine
                self.signal_group(GroupSignal::Kill);
                return true;
            }
            Ok(Err(e)) => {
                log::warn!("Failed to wait for engine after termination request: {e}");
            }
            Err(_) => {
                log::warn!(
                    "Engine did not exit within {}s of termination request, killing",
                    grace.as_secs_f64()
                );
            }
        }

        self.signal_group(GroupSignal::Kill);
        if let Err(e) = self.child.kill().await {
            log::warn!("Failed to kill engine process: {e}");
        }
        self.reaped = true;
        false
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: GroupSignal) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let signal = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };

        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) => log::trace!("Sent {signal} to engine process group {pid}"),
            // The group is already gone
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => log::warn!("Failed to send {signal} to engine process group {pid}: {e}"),
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: GroupSignal) {
        if let Err(e) = self.child.start_kill() {
            log::warn!("Failed to kill engine process: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if !self.reaped {
            log::warn!("Engine process dropped while still running, killing process group");
            self.signal_group(GroupSignal::Kill);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn wait_reports_exit_status() {
        let mut process = EngineProcess::spawn(shell("exit 3")).unwrap();
        assert!(process.pid().is_some());

        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        // Already reaped, nothing to terminate
        assert!(process.terminate(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn terminate_stops_cooperative_process() {
        let mut process = EngineProcess::spawn(shell("sleep 30")).unwrap();

        let started = Instant::now();
        assert!(process.terminate(Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn terminate_kills_process_ignoring_sigterm() {
        let mut process =
            EngineProcess::spawn(shell("trap '' TERM; while true; do sleep 0.1; done")).unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        assert!(!process.terminate(Duration::from_millis(300)).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}

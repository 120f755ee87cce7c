use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::Error;

const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Time a freshly spawned fuzzer gets to fail before it counts as launched
const STARTUP_CHECK: Duration = Duration::from_millis(100);

/// Owns the external fuzzer process. The fuzzer and everything it spawns run in their
/// own process group which is torn down on `terminate` or, at the latest, on drop.
#[derive(Debug)]
pub struct FuzzerProcess {
    child: Child,
    grace: Duration,
    status: Option<ExitStatus>,
    /// SIGKILL went to the group after the leader was reaped, the pgid may be reused
    group_killed: bool,
}

impl FuzzerProcess {
    pub fn spawn(mut command: Command, grace: Duration) -> Result<Self, Error> {
        command.process_group(0).stdin(Stdio::null());

        let child = command.spawn().map_err(|err| {
            Error::ProcessLaunch(format!("{:?}: {}", command.get_program(), err))
        })?;

        let mut process = Self {
            child,
            grace,
            status: None,
            group_killed: false,
        };
        debug!("Spawned fuzzer {:?} with pid {}", command, process.pid());

        thread::sleep(STARTUP_CHECK);
        if let Some(status) = process.poll_status() {
            if !status.success() {
                return Err(Error::ProcessLaunch(format!(
                    "{:?} exited right after launch: {}",
                    command.get_program(),
                    status
                )));
            }
        }

        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        self.poll_status().is_none()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    fn poll_status(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.status = status,
                Err(err) => warn!("Failed to query fuzzer {}: {}", self.pid(), err),
            }
        }
        self.status
    }

    fn signal_group(&self, signal: Signal) {
        if self.group_killed {
            return;
        }
        match killpg(Pid::from_raw(self.child.id() as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!("Failed to send {} to fuzzer group: {}", signal, err),
        }
    }

    /// Kills what is left of the group once, after the leader has been reaped
    fn kill_group(&mut self) {
        self.signal_group(Signal::SIGKILL);
        self.group_killed = true;
    }

    /// Sends SIGTERM to the process group and escalates to SIGKILL after the grace period
    pub fn terminate(&mut self) -> Result<ExitStatus, Error> {
        if let Some(status) = self.status {
            // the leader is reaped, stray group members may remain
            self.kill_group();
            return Ok(status);
        }

        self.signal_group(Signal::SIGTERM);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if let Some(status) = self.poll_status() {
                self.kill_group();
                return Ok(status);
            }
            thread::sleep(WAIT_SLICE);
        }

        warn!(
            "Fuzzer {} ignored SIGTERM for {:?}, killing it",
            self.pid(),
            self.grace
        );
        self.signal_group(Signal::SIGKILL);
        let status = self.child.wait()?;
        self.status = Some(status);
        self.group_killed = true;
        Ok(status)
    }
}

impl Drop for FuzzerProcess {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            warn!("Failed to terminate fuzzer {}: {}", self.pid(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test_log::test]
    fn test_terminate_running_process() {
        let mut process = FuzzerProcess::spawn(shell("sleep 30"), Duration::from_secs(2)).unwrap();
        assert!(process.is_running());

        let status = process.terminate().unwrap();
        assert!(!status.success());
        assert!(!process.is_running());
    }

    #[test_log::test]
    fn test_group_is_signalled_once() {
        let mut process = FuzzerProcess::spawn(shell("sleep 30"), Duration::from_secs(2)).unwrap();
        assert!(!process.group_killed);

        let status = process.terminate().unwrap();
        assert!(process.group_killed);

        // repeated terminations, as by drop after an explicit one, only report the status
        assert_eq!(process.terminate().unwrap(), status);
        assert!(process.group_killed);
        assert_eq!(process.exit_status(), Some(status));
    }

    #[test_log::test]
    fn test_escalates_to_kill() {
        let mut process = FuzzerProcess::spawn(
            shell("trap '' TERM; while true; do sleep 0.05; done"),
            Duration::from_millis(200),
        )
        .unwrap();

        let start = Instant::now();
        process.terminate().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!process.is_running());
    }

    #[test_log::test]
    fn test_launch_failures() {
        assert!(matches!(
            FuzzerProcess::spawn(
                Command::new("/nonexistent/fuzzer-binary"),
                Duration::from_secs(1)
            ),
            Err(Error::ProcessLaunch(_))
        ));
        assert!(matches!(
            FuzzerProcess::spawn(shell("exit 3"), Duration::from_secs(1)),
            Err(Error::ProcessLaunch(_))
        ));
    }

    #[test_log::test]
    fn test_exited_process_is_not_running() {
        let mut process = FuzzerProcess::spawn(shell("sleep 0.2"), Duration::from_secs(1)).unwrap();
        thread::sleep(Duration::from_millis(600));

        assert!(!process.is_running());
        assert!(process.exit_status().map_or(false, |s| s.success()));
    }
}

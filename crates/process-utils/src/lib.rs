//! Process helpers shared by the crawl launcher.
//!
//! Covers the three things the launcher needs from the OS: building a child
//! command without a console window on Windows, asking a child to stop
//! politely (SIGTERM on unix), and turning an [`ExitStatus`] into something
//! that can be stored and displayed.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::process::ExitStatus;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
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
/// The command is created with `kill_on_drop(true)` so a dropped handle never
/// leaves an orphaned crawl behind.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Ask the process with the given pid to terminate.
///
/// Sends SIGTERM on unix. Other platforms have no cooperative termination
/// signal, so this returns [`io::ErrorKind::Unsupported`] and callers fall back
/// to a hard kill.
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is not supported on this platform",
    ))
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited on its own with a status code.
    Code(i32),
    /// Killed by a signal (unix only).
    Signal(i32),
    /// Neither a code nor a signal was reported.
    Unknown,
}

impl ExitKind {
    /// Classify an [`ExitStatus`].
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Self::Signal(sig);
            }
        }
        Self::Unknown
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    /// The value stored as the job's exit code.
    ///
    /// Signals follow the shell convention of `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            Self::Signal(sig) => Some(128 + sig),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(sig) => write!(f, "terminated by signal {sig}"),
            Self::Unknown => write!(f, "unknown exit status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_for_signal_follows_shell_convention() {
        assert_eq!(ExitKind::Signal(9).exit_code(), Some(137));
        assert_eq!(ExitKind::Code(3).exit_code(), Some(3));
        assert_eq!(ExitKind::Unknown.exit_code(), None);
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(ExitKind::Code(1).to_string(), "exit code 1");
        assert_eq!(ExitKind::Signal(15).to_string(), "terminated by signal 15");
    }

    #[cfg(unix)]
    #[test]
    fn classifies_real_exit_status() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 4"])
            .status()
            .unwrap();
        let kind = ExitKind::from_status(status);
        assert_eq!(kind, ExitKind::Code(4));
        assert!(!kind.is_success());
    }

    #[cfg(unix)]
    #[test]
    fn classifies_signal_exit() {
        let status = std::process::Command::new("sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .unwrap();
        assert_eq!(ExitKind::from_status(status), ExitKind::Signal(9));
    }

    #[cfg(all(unix, feature = "tokio"))]
    #[tokio::test]
    async fn terminate_stops_a_sleeping_child() {
        let mut child = tokio_command("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        terminate(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(ExitKind::from_status(status), ExitKind::Signal(15));
    }
}

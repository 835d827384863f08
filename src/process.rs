use std::ffi::OsStr;
use std::fmt::{Display, Formatter};
use std::io;
use std::process::{Child, Command, ExitStatus};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// A direct child of the supervisor
pub struct Process {
    child: Child,
}

impl Process {
    /// Starts `program` with `args` in a new process group, so that
    /// terminating it also reaches anything it starts itself
    pub fn spawn<P: AsRef<OsStr>, A: AsRef<OsStr>>(program: P, args: &[A]) -> io::Result<Process> {
        let mut command = Command::new(program);
        command.args(args);

        Self::spawn_command(command)
    }

    pub fn spawn_command(mut command: Command) -> io::Result<Process> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        Ok(Process {
            child: command.spawn()?,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Asks the OS to end the process group. Not a cooperative shutdown:
    /// the children get no chance to clean up.
    pub fn terminate(&mut self) -> io::Result<()> {
        kill_group(&mut self.child)
    }

    /// Waits for the process to exit. There is no timeout.
    pub fn join(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }

    /// Reaps the process if it has already exited, without blocking
    pub fn try_join(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        // Group already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            log::warn!(target: "process", "killpg({}) failed: {}", child.id(), err);
            // Still reach the direct child
            child.kill().map_err(|_| io::Error::from(err))
        }
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

impl Display for Process {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.child.id())
    }
}

use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{Configuration, Settings};
use crate::error::{SpawnError, TerminationError};
use crate::eventlog;
use crate::process::Process;
use crate::reexec;

/// Starts the OS process for one command argument vector
pub trait Launcher {
    fn launch(&self, group: &str, argv: &[String]) -> io::Result<Process>;
}

/// Re-executes the service binary in `exec` mode, which then runs the
/// management command with its own logging set up
pub struct HostLauncher {
    exe: PathBuf,
    settings: Settings,
}

impl HostLauncher {
    pub fn new(exe: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            exe: exe.into(),
            settings,
        }
    }

    pub fn for_current_exe(settings: &Settings) -> io::Result<Self> {
        Ok(Self::new(reexec::host_binary()?, settings.clone()))
    }

    fn exec_args(&self, group: &str, argv: &[String]) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--base-path".to_string(),
            self.settings.base_path.to_string_lossy().into_owned(),
            "--config".to_string(),
            self.settings.filename.clone(),
            "--host".to_string(),
            self.settings.host.clone(),
            "--group".to_string(),
            group.to_string(),
            "--".to_string(),
        ];
        args.extend(argv.iter().cloned());
        args
    }
}

impl Launcher for HostLauncher {
    fn launch(&self, group: &str, argv: &[String]) -> io::Result<Process> {
        Process::spawn(&self.exe, self.exec_args(group, argv).as_slice())
    }
}

/// Executes the argument vector as-is, `argv[0]` being the program
pub struct DirectLauncher;

impl Launcher for DirectLauncher {
    fn launch(&self, _group: &str, argv: &[String]) -> io::Result<Process> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

        Process::spawn(program, args)
    }
}

/// One running command group
pub struct ManagedProcess {
    pub group: String,
    pub argv: Vec<String>,
    proc: Process,
    terminated: bool,
}

impl ManagedProcess {
    pub fn pid(&self) -> u32 {
        self.proc.pid()
    }

    pub fn is_running(&mut self) -> bool {
        !self.terminated && self.proc.is_running()
    }

    /// Ends the process and waits until it is gone.
    ///
    /// When the kill fails the process is still reaped if it has exited,
    /// but not waited for: a child that survived the kill would block the
    /// caller forever. The first failure is returned.
    pub fn terminate(&mut self) -> Result<(), TerminationError> {
        let pid = self.pid();
        let err = |source| TerminationError {
            group: self.group.clone(),
            pid,
            source,
        };

        let joined = match self.proc.terminate() {
            Ok(()) => self.proc.join().map(|_| ()),
            Err(kill_err) => {
                if let Ok(Some(status)) = self.proc.try_join() {
                    log::debug!(target: "service", "{} already exited with {}", self, status);
                }
                Err(kill_err)
            }
        };
        self.terminated = true;

        joined.map_err(err)
    }
}

impl Display for ManagedProcess {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (pid={})", self.group, self.proc)
    }
}

/// The live children of one configuration generation, in spawn order
#[derive(Default)]
pub struct ChildSet {
    children: Vec<ManagedProcess>,
}

impl ChildSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedProcess> {
        self.children.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ManagedProcess> {
        self.children.iter_mut()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().map(ManagedProcess::pid).collect()
    }

    pub fn push(&mut self, child: ManagedProcess) {
        self.children.push(child);
    }

    pub fn append(&mut self, other: ChildSet) {
        self.children.extend(other.children);
    }
}

/// Spawn failure after some groups were already started. Those are left
/// running and handed back to the caller.
#[derive(Debug)]
pub struct StartError {
    pub spawned: ChildSet,
    pub error: SpawnError,
}

impl std::fmt::Debug for ChildSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.children.iter().map(|c| c.to_string()))
            .finish()
    }
}

/// Argument vector of a group: dispatcher, command, parameters
pub fn command_argv(
    config: &Configuration,
    group: &str,
    base_path: &Path,
) -> Result<Vec<String>, SpawnError> {
    let group = config.command_group(group)?;
    let entry_point = reexec::entry_point(config, base_path);

    let mut argv = vec![entry_point.to_string_lossy().into_owned(), group.command];
    argv.extend(group.parameters);

    Ok(argv)
}

pub fn spawn(
    config: &Configuration,
    group: &str,
    base_path: &Path,
    launcher: &dyn Launcher,
) -> Result<ManagedProcess, SpawnError> {
    let argv = command_argv(config, group, base_path)?;

    let proc = launcher
        .launch(group, &argv)
        .map_err(|source| SpawnError::Launch {
            group: group.to_string(),
            source,
        })?;

    eventlog::info(
        format!("service/{}", group),
        format!("spawned {} (pid={})", argv.join(" "), proc),
    );

    Ok(ManagedProcess {
        group: group.to_string(),
        argv,
        proc,
        terminated: false,
    })
}

/// Spawns every group of the resolved `run` list, in order. Groups already
/// started when one fails are not rolled back.
pub fn start_commands(
    config: &Configuration,
    settings: &Settings,
    launcher: &dyn Launcher,
) -> Result<ChildSet, StartError> {
    let mut children = ChildSet::new();

    let run = match config.run_list(&settings.host) {
        Ok(run) => run,
        Err(err) => {
            return Err(StartError {
                spawned: children,
                error: err.into(),
            })
        }
    };

    for group in run {
        match spawn(config, &group, &settings.base_path, launcher) {
            Ok(child) => children.push(child),
            Err(error) => {
                return Err(StartError {
                    spawned: children,
                    error,
                })
            }
        }
    }

    Ok(children)
}

/// Terminates and joins every child in set order. A failing child does not
/// stop the others from being terminated; each failure is logged and
/// returned.
pub fn end_commands(children: &mut ChildSet) -> Vec<TerminationError> {
    let mut errors = vec![];

    for mut child in children.children.drain(..) {
        match child.terminate() {
            Ok(()) => eventlog::info(format!("service/{}", child.group), "stopped"),
            Err(err) => {
                eventlog::error(format!("service/{}", child.group), err.to_string());
                errors.push(err);
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_launcher_reexecutes_in_exec_mode() {
        let settings = Settings::new("/srv/app/service", "web01");
        let launcher = HostLauncher::new("/usr/bin/groupd", settings);
        let argv = vec!["manage.py".to_string(), "sync".to_string()];

        assert_eq!(
            launcher.exec_args("worker", &argv),
            [
                "exec",
                "--base-path",
                "/srv/app/service",
                "--config",
                "service.ini",
                "--host",
                "web01",
                "--group",
                "worker",
                "--",
                "manage.py",
                "sync",
            ]
        );
    }

    #[test]
    fn argv_is_entry_point_command_then_parameters() {
        let config: Configuration = "\
[services]
run = worker
entry_point = bin/dispatch

[worker]
command = sync
parameters = --fast  --dry-run
"
        .parse()
        .unwrap();

        assert_eq!(
            command_argv(&config, "worker", Path::new("/srv/app")).unwrap(),
            ["/srv/app/bin/dispatch", "sync", "--fast", "--dry-run"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn terminating_twice_is_harmless() {
        let config: Configuration =
            "[services]\nrun = w\nentry_point = /bin/sleep\n[w]\ncommand = 30\nparameters =\n"
                .parse()
                .unwrap();
        let mut child = spawn(&config, "w", Path::new("/"), &DirectLauncher).unwrap();

        assert!(child.is_running());
        child.terminate().unwrap();
        assert!(!child.is_running());

        // Already reaped: the group is gone and waiting returns at once
        assert!(child.terminate().is_ok());
    }

    #[test]
    fn ending_an_empty_set_is_a_noop() {
        let mut children = ChildSet::new();

        assert!(end_commands(&mut children).is_empty());
        assert!(end_commands(&mut children).is_empty());
        assert!(children.is_empty());
    }
}

#![cfg(unix)]

use std::error::Error;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::TempDir;

use groupd::config::{Configuration, Settings};
use groupd::daemon::{cleanup, Daemon, Flow, State};
use groupd::error::{CleanupError, ConfigError, Error as GroupdError, SpawnError};
use groupd::event::Event;
use groupd::process::Process;
use groupd::service::{end_commands, start_commands, DirectLauncher, Launcher};

type TestResult = Result<(), Box<dyn Error>>;

const HOST: &str = "testhost";

/// Groups that sleep long enough to outlive the test
fn sleepers(run: &str) -> String {
    let mut text = format!("[services]\nrun = {}\nentry_point = /bin/sleep\n", run);
    for group in run.split_whitespace() {
        text.push_str(&format!("\n[{}]\ncommand = 30\nparameters =\n", group));
    }
    text
}

/// Replaces service.ini in one rename, so a watcher never sees the new
/// content with the old mtime
fn write_config(dir: &Path, text: &str, mtime_offset: u64) -> io::Result<()> {
    let staged = dir.join("service.ini.new");
    fs::write(&staged, text)?;

    let file = File::options().write(true).open(&staged)?;
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000 + mtime_offset))?;
    drop(file);

    fs::rename(&staged, dir.join("service.ini"))
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[derive(Clone, Default)]
struct Recording {
    pids: Arc<Mutex<Vec<u32>>>,
}

impl Launcher for Recording {
    fn launch(&self, group: &str, argv: &[String]) -> io::Result<Process> {
        let proc = DirectLauncher.launch(group, argv)?;
        self.pids.lock().unwrap().push(proc.pid());
        Ok(proc)
    }
}

#[test]
fn spawns_one_process_per_group_in_order() -> TestResult {
    let dir = TempDir::new()?;
    let config: Configuration = sleepers("a b c").parse()?;
    let settings = Settings::new(dir.path(), HOST);

    let mut children = start_commands(&config, &settings, &DirectLauncher).unwrap();
    let groups: Vec<_> = children.iter().map(|c| c.group.clone()).collect();
    assert_eq!(groups, ["a", "b", "c"]);

    let pids = children.pids();
    assert!(pids.iter().all(|&pid| is_alive(pid)));

    assert!(end_commands(&mut children).is_empty());
    assert!(children.is_empty());
    assert!(pids.iter().all(|&pid| !is_alive(pid)));

    Ok(())
}

#[test]
fn argv_ends_with_command_and_parameters() -> TestResult {
    let dir = TempDir::new()?;
    let config: Configuration = "\
[services]
run = worker
entry_point = /bin/sleep

[worker]
command = sync
parameters = --fast
"
    .parse()?;
    let settings = Settings::new(dir.path(), HOST);

    let mut children = start_commands(&config, &settings, &DirectLauncher).unwrap();
    assert_eq!(children.len(), 1);

    let argv = &children.iter().next().unwrap().argv;
    assert_eq!(argv, &["/bin/sleep", "sync", "--fast"]);

    end_commands(&mut children);
    Ok(())
}

#[test]
fn unknown_group_keeps_earlier_children_running() -> TestResult {
    let dir = TempDir::new()?;
    let config: Configuration = "\
[services]
run = worker ghost
entry_point = /bin/sleep

[worker]
command = 30
parameters =
"
    .parse()?;
    let settings = Settings::new(dir.path(), HOST);

    let err = start_commands(&config, &settings, &DirectLauncher).unwrap_err();
    assert!(matches!(err.error, SpawnError::UnknownGroup(ref name) if name == "ghost"));

    let mut spawned = err.spawned;
    assert_eq!(spawned.len(), 1);
    assert!(spawned.iter_mut().all(|c| c.is_running()));

    end_commands(&mut spawned);
    Ok(())
}

#[test]
fn host_section_overrides_services() -> TestResult {
    let dir = TempDir::new()?;
    let mut text = sleepers("a b");
    text.push_str(&format!("\n[{}]\nrun = b\n", HOST));
    write_config(dir.path(), &text, 0)?;

    let (mut daemon, _stop) = Daemon::new(Settings::new(dir.path(), HOST), DirectLauncher);
    daemon.start()?;

    let groups: Vec<_> = daemon.children().iter().map(|c| c.group.clone()).collect();
    assert_eq!(groups, ["b"]);

    daemon.shutdown();
    Ok(())
}

#[test]
fn restart_replaces_every_child() -> TestResult {
    let dir = TempDir::new()?;
    write_config(dir.path(), &sleepers("a b"), 0)?;

    let (mut daemon, _stop) = Daemon::new(Settings::new(dir.path(), HOST), DirectLauncher);
    daemon.start()?;
    assert_eq!(daemon.state(), State::Running);

    let before = daemon.children().pids();
    assert_eq!(before.len(), 2);

    write_config(dir.path(), &sleepers("a b c"), 1)?;
    assert_eq!(daemon.handle_event(Event::ConfigDirChanged(None)), Flow::Continue);

    let after = daemon.children().pids();
    assert_eq!(after.len(), 3);
    assert!(after.iter().all(|pid| !before.contains(pid)));
    assert!(before.iter().all(|&pid| !is_alive(pid)));
    assert_eq!(daemon.state(), State::Running);

    daemon.shutdown();
    Ok(())
}

#[test]
fn unchanged_mtime_does_not_restart() -> TestResult {
    let dir = TempDir::new()?;
    write_config(dir.path(), &sleepers("a"), 0)?;

    let (mut daemon, _stop) = Daemon::new(Settings::new(dir.path(), HOST), DirectLauncher);
    daemon.start()?;
    let before = daemon.children().pids();

    fs::write(dir.path().join("unrelated.txt"), "x")?;
    daemon.handle_event(Event::ConfigDirChanged(Some(dir.path().join("unrelated.txt"))));

    assert_eq!(daemon.children().pids(), before);
    assert!(before.iter().all(|&pid| is_alive(pid)));

    daemon.shutdown();
    Ok(())
}

#[test]
fn touching_the_configuration_restarts() -> TestResult {
    let dir = TempDir::new()?;
    write_config(dir.path(), &sleepers("a"), 0)?;

    let (mut daemon, _stop) = Daemon::new(Settings::new(dir.path(), HOST), DirectLauncher);
    daemon.start()?;
    let before = daemon.children().pids();

    // Same content, newer mtime
    write_config(dir.path(), &sleepers("a"), 1)?;
    daemon.handle_event(Event::ConfigDirChanged(None));

    let after = daemon.children().pids();
    assert_eq!(after.len(), 1);
    assert_ne!(after, before);

    daemon.shutdown();
    Ok(())
}

#[test]
fn broken_reload_leaves_no_children_until_fixed() -> TestResult {
    let dir = TempDir::new()?;
    write_config(dir.path(), &sleepers("a"), 0)?;

    let (mut daemon, _stop) = Daemon::new(Settings::new(dir.path(), HOST), DirectLauncher);
    daemon.start()?;

    write_config(dir.path(), "[services\nrun = a\n", 1)?;
    daemon.handle_event(Event::ConfigDirChanged(None));
    assert!(daemon.children().is_empty());
    assert_eq!(daemon.state(), State::Running);

    write_config(dir.path(), &sleepers("a"), 2)?;
    daemon.handle_event(Event::ConfigDirChanged(None));
    assert_eq!(daemon.children().len(), 1);

    daemon.shutdown();
    Ok(())
}

#[test]
fn missing_configuration_is_fatal_at_start() -> TestResult {
    let dir = TempDir::new()?;

    let (mut daemon, _stop) = Daemon::new(Settings::new(dir.path(), HOST), DirectLauncher);
    let err = daemon.start().unwrap_err();

    assert!(matches!(err, GroupdError::Config(ConfigError::NotFound(_))));
    assert_eq!(daemon.state(), State::Stopped);
    assert!(daemon.children().is_empty());

    Ok(())
}

#[test]
fn shutdown_removes_clean_paths() -> TestResult {
    let dir = TempDir::new()?;
    let pid_file = dir.path().join("worker.pid");
    let lock_a = dir.path().join("a.lock");
    let lock_b = dir.path().join("b.lock");
    let missing = dir.path().join("already-gone.pid");
    let kept = dir.path().join("keep.txt");
    for path in [&pid_file, &lock_a, &lock_b, &kept] {
        fs::write(path, "")?;
    }

    let mut text = sleepers("a");
    text = text.replacen(
        "run = a\n",
        &format!(
            "run = a\nclean = {};{};{}\n",
            pid_file.display(),
            missing.display(),
            dir.path().join("*.lock").display()
        ),
        1,
    );
    write_config(dir.path(), &text, 0)?;

    let (mut daemon, _stop) = Daemon::new(Settings::new(dir.path(), HOST), DirectLauncher);
    daemon.start()?;
    daemon.shutdown();

    assert_eq!(daemon.state(), State::Stopped);
    assert!(!pid_file.exists());
    assert!(!lock_a.exists());
    assert!(!lock_b.exists());
    assert!(kept.exists());

    Ok(())
}

#[test]
fn clean_paths_with_brackets_are_removed_literally() -> TestResult {
    let dir = TempDir::new()?;
    let bracketed = dir.path().join("worker[1].pid");
    let lookalike = dir.path().join("worker1.pid");
    fs::write(&bracketed, "")?;
    fs::write(&lookalike, "")?;

    let errors = cleanup(&[bracketed.to_string_lossy().into_owned()]);

    assert!(errors.is_empty());
    assert!(!bracketed.exists());
    assert!(lookalike.exists());

    Ok(())
}

#[test]
fn unreadable_glob_matches_are_reported() -> TestResult {
    use std::os::unix::fs::PermissionsExt;

    // Permission bits do not stop root
    if nix::unistd::geteuid().is_root() {
        return Ok(());
    }

    let dir = TempDir::new()?;
    let locked = dir.path().join("locked");
    fs::create_dir_all(locked.join("sub"))?;
    fs::write(locked.join("sub").join("x.lock"), "")?;
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;

    let pattern = locked.join("*").join("x.lock");
    let errors = cleanup(&[pattern.to_string_lossy().into_owned()]);

    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;

    assert!(matches!(errors.as_slice(), [CleanupError::Unreadable(_)]));

    Ok(())
}

fn wait_for_pids(pids: &Mutex<Vec<u32>>, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while pids.lock().unwrap().len() < count {
        assert!(Instant::now() < deadline, "expected {} spawns", count);
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn watched_change_restarts_the_running_daemon() -> TestResult {
    let dir = TempDir::new()?;
    write_config(dir.path(), &sleepers("a b"), 0)?;

    let launcher = Recording::default();
    let pids = Arc::clone(&launcher.pids);
    let (daemon, stop) = Daemon::new(Settings::new(dir.path(), HOST), launcher);

    let handle = thread::spawn(move || daemon.run());
    wait_for_pids(&pids, 2);
    let first: Vec<u32> = pids.lock().unwrap().clone();

    write_config(dir.path(), &sleepers("a b c"), 1)?;
    wait_for_pids(&pids, 5);

    let second: Vec<u32> = pids.lock().unwrap()[2..].to_vec();
    assert!(first.iter().all(|&pid| !is_alive(pid)));
    assert!(second.iter().all(|&pid| is_alive(pid)));

    stop.stop();
    handle.join().unwrap()?;

    assert_eq!(pids.lock().unwrap().len(), 5);
    assert!(second.iter().all(|&pid| !is_alive(pid)));

    Ok(())
}

#[test]
fn stop_terminates_and_joins_all_children() -> TestResult {
    let dir = TempDir::new()?;
    write_config(dir.path(), &sleepers("a b"), 0)?;

    let launcher = Recording::default();
    let pids = Arc::clone(&launcher.pids);
    let (daemon, stop) = Daemon::new(Settings::new(dir.path(), HOST), launcher);

    let handle = thread::spawn(move || daemon.run());
    wait_for_pids(&pids, 2);

    stop.stop();
    handle.join().unwrap()?;

    let pids = pids.lock().unwrap();
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|&pid| !is_alive(pid)));

    Ok(())
}

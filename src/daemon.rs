use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::SystemTime;

use crate::config::{Configuration, Settings};
use crate::error::{CleanupError, ConfigError, Result};
use crate::event::Event;
use crate::eventlog;
use crate::service::{end_commands, start_commands, ChildSet, Launcher, StartError};
use crate::watch::WatchHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, PartialEq)]
pub enum Flow {
    Stop,
    Continue,
}

/// Sets the stop signal of a running supervisor. Safe to call from any
/// thread; it never blocks.
#[derive(Clone)]
pub struct StopHandler {
    tx: Sender<Event>,
}

impl StopHandler {
    pub fn stop(&self) {
        // The loop is already gone if this fails
        self.tx.send(Event::Stop).ok();
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Loads the configuration and checks that the `run` list resolves
fn load_config(settings: &Settings) -> std::result::Result<Configuration, ConfigError> {
    let config = Configuration::load(settings.config_path())?;
    config.run_list(&settings.host)?;

    Ok(config)
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains(|c: char| matches!(c, '*' | '?' | '['))
}

fn remove_file(path: &Path) -> std::result::Result<bool, CleanupError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(CleanupError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Paths one `clean` entry stands for. An entry naming an existing path is
/// taken literally even when it contains glob characters.
fn expand(entry: &str, errors: &mut Vec<CleanupError>) -> Vec<PathBuf> {
    let literal = PathBuf::from(entry);
    if !has_glob(entry) || fs::symlink_metadata(&literal).is_ok() {
        return vec![literal];
    }

    let paths = match glob::glob(entry) {
        Ok(paths) => paths,
        Err(source) => {
            errors.push(CleanupError::Pattern {
                pattern: entry.to_string(),
                source,
            });
            return vec![];
        }
    };

    paths
        .filter_map(|path| match path {
            Ok(path) => Some(path),
            Err(source) => {
                errors.push(CleanupError::Unreadable(source));
                None
            }
        })
        .collect()
}

/// Removes every `clean` entry. Entries already gone are skipped silently;
/// other failures are logged, collected and do not stop the pass.
pub fn cleanup(entries: &[String]) -> Vec<CleanupError> {
    let mut errors = vec![];

    for entry in entries {
        for path in expand(entry, &mut errors) {
            match remove_file(&path) {
                Ok(true) => log::debug!(target: "daemon", "removed {}", path.display()),
                Ok(false) => {}
                Err(err) => errors.push(err),
            }
        }
    }

    for err in &errors {
        eventlog::error("daemon", err.to_string());
    }

    errors
}

/// Runs the command groups of one configuration file and restarts all of
/// them whenever the file changes.
pub struct Daemon<L: Launcher> {
    settings: Settings,
    launcher: L,
    state: State,
    config: Option<Configuration>,
    mtime: Option<SystemTime>,
    children: ChildSet,
    watch: Option<WatchHandle>,
    // Kept for re-arming the watch; the event loop therefore ends on
    // `Event::Stop` only, never on a closed channel
    watch_tx: Sender<Event>,
    events: Receiver<Event>,
}

impl<L: Launcher> Daemon<L> {
    pub fn new(settings: Settings, launcher: L) -> (Self, StopHandler) {
        let (tx, events) = channel();

        (
            Self {
                settings,
                launcher,
                state: State::Stopped,
                config: None,
                mtime: None,
                children: ChildSet::new(),
                watch: None,
                watch_tx: tx.clone(),
                events,
            },
            StopHandler { tx },
        )
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn children(&self) -> &ChildSet {
        &self.children
    }

    pub fn config(&self) -> Option<&Configuration> {
        self.config.as_ref()
    }

    fn set_state(&mut self, state: State) {
        log::debug!(target: "daemon", "{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Loads the configuration, arms the directory watch and spawns the
    /// commands. Configuration errors are fatal here.
    pub fn start(&mut self) -> Result<()> {
        self.set_state(State::Starting);
        eventlog::info("daemon", "starting");

        // Taken before reading, so a write racing the load still restarts
        let mtime = modified(&self.settings.config_path());

        let config = match load_config(&self.settings) {
            Ok(config) => config,
            Err(err) => {
                eventlog::error("daemon", format!("cannot start: {}", err));
                self.set_state(State::Stopped);
                return Err(err.into());
            }
        };

        if self.watch.is_none() {
            match WatchHandle::new(&self.settings.base_path, self.watch_tx.clone()) {
                Ok(watch) => self.watch = Some(watch),
                Err(err) => {
                    eventlog::error("daemon", format!("cannot start: {}", err));
                    self.set_state(State::Stopped);
                    return Err(err);
                }
            }
        }

        self.mtime = mtime;
        self.config = Some(config);
        self.spawn_children();
        self.set_state(State::Running);

        eventlog::info("daemon", "started, waiting for stop");

        Ok(())
    }

    fn spawn_children(&mut self) {
        let config = match &self.config {
            Some(config) => config,
            None => return,
        };

        match start_commands(config, &self.settings, &self.launcher) {
            Ok(children) => self.children = children,
            Err(StartError { spawned, error }) => {
                eventlog::error(
                    "daemon",
                    format!(
                        "{} ({} command(s) already started are left running)",
                        error,
                        spawned.len()
                    ),
                );
                self.children = spawned;
            }
        }
    }

    /// Re-reads the modification time; true when it differs from the one
    /// recorded, which is then replaced
    fn config_changed(&mut self) -> bool {
        let mtime = modified(&self.settings.config_path());

        if mtime == self.mtime {
            return false;
        }

        self.mtime = mtime;
        true
    }

    /// Stops every child, reloads the configuration and starts the new
    /// `run` list. Both generations never run side by side.
    pub fn restart(&mut self) {
        eventlog::info(
            "daemon",
            "restarting child processes as the configuration has changed",
        );

        end_commands(&mut self.children);

        match load_config(&self.settings) {
            Ok(config) => {
                self.config = Some(config);
                self.spawn_children();
            }
            Err(err) => eventlog::error(
                "daemon",
                format!("reload failed, no command running until fixed: {}", err),
            ),
        }
    }

    pub fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Stop => Flow::Stop,
            Event::ConfigDirChanged(path) => {
                if self.config_changed() {
                    self.restart();
                } else {
                    log::debug!(target: "daemon", "ignoring change of {:?}", path);
                }

                Flow::Continue
            }
        }
    }

    /// Starts, then blocks until the stop signal is set
    pub fn run(mut self) -> Result<()> {
        self.start()?;

        while let Ok(event) = self.events.recv() {
            if self.handle_event(event) == Flow::Stop {
                break;
            }
        }

        self.shutdown();

        Ok(())
    }

    /// Ends all children, removes the `clean` paths and releases the watch
    pub fn shutdown(&mut self) {
        self.set_state(State::Stopping);
        eventlog::info("daemon", "stopping");

        end_commands(&mut self.children);

        if let Some(config) = &self.config {
            match config.clean_list(&self.settings.host) {
                Ok(entries) => {
                    cleanup(&entries);
                }
                Err(err) => eventlog::error("daemon", err.to_string()),
            }
        }

        self.watch = None;
        self.set_state(State::Stopped);

        eventlog::info("daemon", "stopped");
    }
}

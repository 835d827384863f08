use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Duration;

use notify::{watcher, DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::Result;
use crate::event::Event;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Change notification bound to the directory holding the configuration.
///
/// Dropping the handle stops the watch; the forwarding thread then ends on
/// its own.
pub struct WatchHandle {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
}

impl WatchHandle {
    pub fn new(dir: &Path, tx: Sender<Event>) -> Result<Self> {
        let (watcher_tx, watcher_rx) = channel();
        let mut inner = watcher(watcher_tx, DEBOUNCE)?;
        inner.watch(dir, RecursiveMode::NonRecursive)?;

        proxy_watcher_events(watcher_rx, tx);

        log::debug!(target: "watch", "watching {}", dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            _watcher: inner,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn proxy_watcher_events(rx: Receiver<DebouncedEvent>, tx: Sender<Event>) {
    thread::spawn(move || {
        'event_loop: for event in rx {
            let path = match event {
                DebouncedEvent::NoticeWrite(_) | DebouncedEvent::NoticeRemove(_) => continue,
                DebouncedEvent::Create(path)
                | DebouncedEvent::Write(path)
                | DebouncedEvent::Chmod(path)
                | DebouncedEvent::Remove(path)
                | DebouncedEvent::Rename(_, path) => Some(path),
                DebouncedEvent::Rescan => None,
                DebouncedEvent::Error(err, path) => {
                    log::warn!(target: "watch", "watch error on {:?}: {}", path, err);
                    continue;
                }
            };

            if tx.send(Event::ConfigDirChanged(path)).is_err() {
                break 'event_loop;
            }
        }

        log::debug!(target: "watch", "watcher stopped");
    });
}

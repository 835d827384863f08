use std::path::PathBuf;

/// What wakes the supervision loop up
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Something was written in the configuration directory
    ConfigDirChanged(Option<PathBuf>),
    /// The host asked the service to stop
    Stop,
}

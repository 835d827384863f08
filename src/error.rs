use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading or resolving the service configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("section [{0}] already defined")]
    DuplicateSection(String),

    #[error("key found before any section header")]
    KeyOutsideSection,

    #[error("missing section [{0}]")]
    MissingSection(String),

    #[error("missing key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command group '{0}' has no section in the configuration")]
    UnknownGroup(String),

    #[error("command group '{group}' is missing '{key}'")]
    MissingKey { group: String, key: String },

    #[error("failed to launch command group '{group}': {source}")]
    Launch {
        group: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
#[error("failed to terminate '{group}' (pid={pid}): {source}")]
pub struct TerminationError {
    pub group: String,
    pub pid: u32,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to remove {}: {source}", .path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid clean pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("cannot read clean path: {0}")]
    Unreadable(#[from] glob::GlobError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Termination(#[from] TerminationError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("failed to watch configuration directory: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event;
pub mod eventlog;
pub mod logging;
pub mod process;
pub mod reexec;
pub mod service;
pub mod watch;

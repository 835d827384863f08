//! The service's event log.
//!
//! A service has no console once it runs, so every condition an operator
//! must see goes through here. Records use the `eventlog` target so the
//! service manager (or a log filter) can pick them out.

pub const TARGET: &str = "eventlog";

pub fn info(source: impl AsRef<str>, msg: impl AsRef<str>) {
    log::info!(target: TARGET, "[{}] {}", source.as_ref(), msg.as_ref());
}

pub fn error(source: impl AsRef<str>, msg: impl AsRef<str>) {
    log::error!(target: TARGET, "[{}] {}", source.as_ref(), msg.as_ref());
}

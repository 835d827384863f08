//! Child side of a spawned command group: the `exec` mode of the binary.

use std::process::Command;

use crate::config::{Configuration, Settings, SERVICES};
use crate::eventlog;
use crate::logging;
use crate::reexec;

/// Runs one management command and reports its failure to the event log.
/// Returns the exit code for the child; errors never reach the supervisor.
pub fn run_command(settings: &Settings, group: &str, argv: &[String]) -> i32 {
    let source = format!("command/{}", group);
    let config = match Configuration::load(settings.config_path()) {
        Ok(config) => config,
        Err(err) => {
            logging::init_supervisor();
            eventlog::error(&source, err.to_string());
            return 1;
        }
    };

    if let Err(err) = logging::init_command(&config.log_settings(), group) {
        logging::init_supervisor();
        eventlog::error(&source, format!("cannot open log file: {}", err));
    }

    eventlog::info(&source, format!("starting command: {}", argv.join(" ")));

    let host = reexec::host_binary().ok();
    let dispatch = reexec::dispatch(
        argv,
        config.get(SERVICES, "interpreter"),
        host.as_deref(),
    );

    let mut command = Command::new(&dispatch.program);
    command.args(&dispatch.args);
    if let Some(module) = config.get(SERVICES, "settings_module") {
        command.env("DJANGO_SETTINGS_MODULE", module);
    }

    match command.status() {
        Ok(status) if status.success() => 0,
        Ok(status) => {
            eventlog::error(&source, format!("command exited with {}", status));
            status.code().unwrap_or(1)
        }
        Err(err) => {
            eventlog::error(
                &source,
                format!("failed to run {}: {}", dispatch.program.display(), err),
            );
            1
        }
    }
}

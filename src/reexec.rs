//! Resolving what a spawned child actually executes.
//!
//! The supervisor never runs a management command itself: it re-executes
//! its own binary in `exec` mode, and that child runs the dispatcher named
//! by `argv[0]`. A dispatcher script needs an interpreter. The interpreter
//! must never resolve to the service host binary, otherwise the child
//! would re-enter the host instead of the dispatcher.

use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{Configuration, SERVICES};

pub const DEFAULT_INTERPRETER: &str = "python";
pub const DEFAULT_ENTRY_POINT: &str = "manage.py";

const SCRIPT_EXTENSIONS: &[&str] = &["py", "pyw"];

/// Program and arguments for one command dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

/// The binary children are re-executed from
pub fn host_binary() -> io::Result<PathBuf> {
    env::current_exe()
}

/// The dispatcher that becomes `argv[0]` of every command: `entry_point` of
/// `[services]`, or `manage.py` in the base path itself.
pub fn entry_point(config: &Configuration, base_path: &Path) -> PathBuf {
    match config.get(SERVICES, "entry_point") {
        Some(path) if !path.is_empty() => base_path.join(path),
        _ => base_path.join(DEFAULT_ENTRY_POINT),
    }
}

fn is_script(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SCRIPT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_host(program: &Path, host: Option<&Path>) -> bool {
    let host = match host {
        Some(host) => host,
        None => return false,
    };

    if program == host {
        return true;
    }

    match (program.canonicalize(), host.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Turns a command argument vector into the program to run.
///
/// Script entry points run through `interpreter` (or `python`); when the
/// interpreter is the host binary it is rewritten to `python`. Anything
/// else is executed directly.
pub fn dispatch(argv: &[String], interpreter: Option<&str>, host: Option<&Path>) -> Dispatch {
    let entry = argv.first().map(PathBuf::from).unwrap_or_default();
    let rest = argv.iter().skip(1).map(OsString::from);

    let interpreter = match interpreter.filter(|i| !i.is_empty()) {
        Some(program) => Some(PathBuf::from(program)),
        None if is_script(&entry) => Some(PathBuf::from(DEFAULT_INTERPRETER)),
        None => None,
    };

    match interpreter {
        Some(program) => {
            let program = if is_host(&program, host) {
                log::warn!(
                    target: "reexec",
                    "interpreter {} is the service host, using {}",
                    program.display(),
                    DEFAULT_INTERPRETER
                );
                PathBuf::from(DEFAULT_INTERPRETER)
            } else {
                program
            };

            Dispatch {
                program,
                args: std::iter::once(entry.into_os_string()).chain(rest).collect(),
            }
        }
        None => Dispatch {
            program: entry,
            args: rest.collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn scripts_run_through_python_by_default() {
        let d = dispatch(&argv(&["/srv/app/manage.py", "sync", "--fast"]), None, None);

        assert_eq!(d.program, PathBuf::from("python"));
        assert_eq!(d.args, ["/srv/app/manage.py", "sync", "--fast"]);
    }

    #[test]
    fn configured_interpreter_is_used() {
        let d = dispatch(
            &argv(&["/srv/app/manage.py", "sync"]),
            Some("/venv/bin/python3"),
            None,
        );

        assert_eq!(d.program, PathBuf::from("/venv/bin/python3"));
        assert_eq!(d.args, ["/srv/app/manage.py", "sync"]);
    }

    #[test]
    fn native_entry_points_run_directly() {
        let d = dispatch(&argv(&["/usr/bin/worker", "sync", "--fast"]), None, None);

        assert_eq!(d.program, PathBuf::from("/usr/bin/worker"));
        assert_eq!(d.args, ["sync", "--fast"]);
    }

    #[test]
    fn host_binary_is_never_the_interpreter() {
        let host = PathBuf::from("/opt/groupd/bin/groupd");
        let d = dispatch(
            &argv(&["manage.py", "sync"]),
            Some("/opt/groupd/bin/groupd"),
            Some(&host),
        );

        assert_eq!(d.program, PathBuf::from(DEFAULT_INTERPRETER));
        assert_eq!(d.args, ["manage.py", "sync"]);
    }

    #[test]
    fn entry_point_defaults_to_manage_py_in_the_base_path() {
        let config: Configuration = "[services]\nrun = a\n".parse().unwrap();

        assert_eq!(
            entry_point(&config, Path::new("/srv/myproject")),
            PathBuf::from("/srv/myproject/manage.py")
        );

        let config: Configuration = "[services]\nrun = a\nentry_point = /usr/bin/worker\n"
            .parse()
            .unwrap();

        assert_eq!(
            entry_point(&config, Path::new("/srv/app/service")),
            PathBuf::from("/usr/bin/worker")
        );
    }
}

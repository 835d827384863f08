use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};

use env_logger::{Builder, Target};
use log::{LevelFilter, Record};

use crate::config::LogSettings;

pub const ENV_VAR: &str = "GROUPD_LOG";

/// Logger of the supervisor itself, filtered through `GROUPD_LOG`
pub fn init_supervisor() {
    let filters = env::var(ENV_VAR).unwrap_or_else(|_| "info".to_string());

    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .try_init()
        .ok();
}

/// Logger of a spawned command, configured from the `[log]` section.
/// Without a `filename` records go to stderr.
pub fn init_command(settings: &LogSettings, process_name: &str) -> io::Result<()> {
    let level = parse_level(&settings.level);

    let mut builder = match &settings.filename {
        Some(filename) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            let format = settings.format.clone();
            let process_name = process_name.to_string();

            let mut builder = Builder::new();
            builder
                .target(Target::Pipe(Box::new(file)))
                .format(move |buf, record| {
                    writeln!(buf, "{}", render(&format, record, &process_name))
                });
            builder
        }
        None => pretty_env_logger::formatted_builder(),
    };

    builder.filter_level(level).try_init().ok();

    Ok(())
}

pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "WARNING" | "WARN" => LevelFilter::Warn,
        "ERROR" | "CRITICAL" => LevelFilter::Error,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn level_name(record: &Record) -> &'static str {
    match record.level() {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARNING",
        log::Level::Info => "INFO",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

/// Expands `%(name)s`-style placeholders of a `[log] format` string
pub fn render(format: &str, record: &Record, process_name: &str) -> String {
    let mut out = String::with_capacity(format.len() + 64);
    let mut rest = format;

    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];

        let close = match tail.find(')') {
            Some(close) => close,
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        };
        let name = &tail[..close];
        // Skip the conversion character (`s`, `d`, ...)
        let after = tail[close + 1..]
            .char_indices()
            .nth(1)
            .map(|(i, _)| close + 1 + i)
            .unwrap_or(tail.len());

        match name {
            "levelname" => out.push_str(level_name(record)),
            "processName" => out.push_str(process_name),
            "process" => out.push_str(&std::process::id().to_string()),
            "name" => out.push_str(record.target()),
            "asctime" => out.push_str(
                &chrono::Local::now()
                    .format("%Y-%m-%d %H:%M:%S,%3f")
                    .to_string(),
            ),
            "message" => out.push_str(&record.args().to_string()),
            _ => out.push_str(&rest[start..start + 2 + after]),
        }

        rest = &tail[after..];
    }

    out.push_str(rest);
    out
}

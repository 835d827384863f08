use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ini::{Ini, ParseOption};

use crate::error::{ConfigError, SpawnError};

/// Section holding the global `run`/`clean` defaults
pub const SERVICES: &str = "services";

/// Section configuring the logger of every spawned command
pub const LOG: &str = "log";

pub const DEFAULT_FILENAME: &str = "service.ini";
pub const DEFAULT_LOG_FORMAT: &str = "[%(levelname)s/%(processName)s] %(message)s";

/// Where the configuration lives and which host it is resolved for
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_path: PathBuf,
    pub filename: String,
    pub host: String,
}

impl Settings {
    pub fn new(base_path: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            filename: DEFAULT_FILENAME.to_string(),
            host: host.into(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_path.join(&self.filename)
    }
}

/// The network name of this machine, used to pick the per-host section
pub fn local_host() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }
}

/// A named section describing one management command to run
#[derive(Debug, Clone, PartialEq)]
pub struct CommandGroup {
    pub name: String,
    pub command: String,
    pub parameters: Vec<String>,
}

/// Values of the `[log]` section, with the defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub filename: Option<PathBuf>,
    pub format: String,
    pub level: String,
}

/// Ordered INI sections, keys kept in their original case
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    sections: Vec<Section>,
}

impl Configuration {
    /// Reads and parses the file at `path`. Nothing is cached: every call
    /// re-reads the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };

        text.parse()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    /// The section holding `run`/`clean` for `host`: the host's own section
    /// when present, `[services]` otherwise.
    fn host_section(&self, host: &str) -> Result<&Section, ConfigError> {
        self.section(host)
            .or_else(|| self.section(SERVICES))
            .ok_or_else(|| ConfigError::MissingSection(SERVICES.to_string()))
    }

    /// Command group names to run on `host`, in configured order
    pub fn run_list(&self, host: &str) -> Result<Vec<String>, ConfigError> {
        let section = self.host_section(host)?;
        let run = section.get("run").ok_or_else(|| ConfigError::MissingKey {
            section: section.name.clone(),
            key: "run".to_string(),
        })?;

        Ok(run.split_whitespace().map(str::to_string).collect())
    }

    /// Paths (or glob patterns) removed when the service stops on `host`
    pub fn clean_list(&self, host: &str) -> Result<Vec<String>, ConfigError> {
        let section = self.host_section(host)?;

        Ok(section
            .get("clean")
            .map(|clean| {
                clean
                    .split(';')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn command_group(&self, name: &str) -> Result<CommandGroup, SpawnError> {
        let section = self
            .section(name)
            .ok_or_else(|| SpawnError::UnknownGroup(name.to_string()))?;
        let required = |key: &str| {
            section.get(key).ok_or_else(|| SpawnError::MissingKey {
                group: name.to_string(),
                key: key.to_string(),
            })
        };

        Ok(CommandGroup {
            name: name.to_string(),
            command: required("command")?.to_string(),
            parameters: required("parameters")?
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
    }

    pub fn log_settings(&self) -> LogSettings {
        let get = |key| self.get(LOG, key).filter(|v| !v.is_empty());

        LogSettings {
            filename: get("filename").map(PathBuf::from),
            format: get("format").unwrap_or(DEFAULT_LOG_FORMAT).to_string(),
            level: get("level").unwrap_or("INFO").to_string(),
        }
    }
}

impl FromStr for Configuration {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        // Values are taken verbatim: Windows paths keep their backslashes
        let options = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(text, options).map_err(|err| ConfigError::Syntax {
            line: err.line,
            message: err.msg.to_string(),
        })?;

        if ini.general_section().iter().next().is_some() {
            return Err(ConfigError::KeyOutsideSection);
        }

        let mut sections: Vec<Section> = vec![];

        for (name, properties) in ini.iter() {
            let name = match name {
                Some(name) => name,
                None => continue,
            };

            if sections.iter().any(|s| s.name == name) {
                return Err(ConfigError::DuplicateSection(name.to_string()));
            }

            let mut section = Section {
                name: name.to_string(),
                entries: vec![],
            };
            for (key, value) in properties.iter() {
                section.set(key.to_string(), value.to_string());
            }

            sections.push(section);
        }

        Ok(Configuration { sections })
    }
}

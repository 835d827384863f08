use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task;

use groupd::command;
use groupd::config::{self, Configuration, Settings};
use groupd::daemon::Daemon;
use groupd::logging;
use groupd::service::{end_commands, start_commands, HostLauncher};

#[derive(Debug, Parser)]
#[clap(about = "Runs management command groups as a supervised service")]
struct Args {
    /// Directory holding the configuration file
    #[clap(long, global = true)]
    base_path: Option<PathBuf>,

    /// Configuration file name, relative to the base path
    #[clap(long, global = true, default_value = config::DEFAULT_FILENAME)]
    config: String,

    /// Host name used to pick the per-host section
    #[clap(long, global = true)]
    host: Option<String>,

    #[clap(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the supervisor until SIGTERM/SIGINT (default)
    Run,
    /// Start every configured command, wait, then stop them
    Test {
        #[clap(long, default_value = "10")]
        timeout: u64,
    },
    /// Child side of a spawned command group
    #[clap(hide = true)]
    Exec {
        #[clap(long = "group")]
        group: String,
        #[clap(raw = true)]
        argv: Vec<String>,
    },
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        let base_path = match &self.base_path {
            Some(path) => path.clone(),
            None => env::current_dir()?,
        };
        let mut settings = Settings::new(
            base_path,
            self.host.clone().unwrap_or_else(config::local_host),
        );
        settings.filename = self.config.clone();

        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = args.settings()?;

    match args.command {
        None | Some(Cmd::Run) => {
            logging::init_supervisor();
            run(settings).await
        }
        Some(Cmd::Test { timeout }) => {
            logging::init_supervisor();
            test(settings, Duration::from_secs(timeout)).await
        }
        Some(Cmd::Exec { group, argv }) => {
            let code = command::run_command(&settings, &group, &argv);
            process::exit(code);
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let launcher = HostLauncher::for_current_exe(&settings)?;
    let (daemon, stop) = Daemon::new(settings, launcher);

    #[cfg(unix)]
    let signals = proxy_signals(stop)?;

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let result = task::spawn_blocking(move || daemon.run()).await;

    #[cfg(unix)]
    signals.close();

    Ok(result??)
}

#[cfg(unix)]
fn proxy_signals(stop: groupd::daemon::StopHandler) -> Result<signal_hook::iterator::Handle> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new(&[SIGTERM, SIGINT]).with_context(|| "failed to register signals")?;
    let handle = signals.handle();

    std::thread::spawn(move || {
        for signal in signals.forever() {
            log::debug!(target: "signals", "received signal {}", signal);
            stop.stop();
        }
    });

    Ok(handle)
}

async fn test(settings: Settings, timeout: Duration) -> Result<()> {
    let config = Configuration::load(settings.config_path())?;
    let launcher = HostLauncher::for_current_exe(&settings)?;

    let mut children = match start_commands(&config, &settings, &launcher) {
        Ok(children) => children,
        Err(err) => {
            let mut spawned = err.spawned;
            end_commands(&mut spawned);
            return Err(err.error.into());
        }
    };

    log::info!("{} command(s) started, stopping in {:?}", children.len(), timeout);
    tokio::time::sleep(timeout).await;

    let errors = end_commands(&mut children);
    if !errors.is_empty() {
        return Err(anyhow!("{} command(s) failed to stop", errors.len()));
    }

    Ok(())
}

mod authorization;
mod listener;
mod logger;
mod runtime;

use std::path::PathBuf;

use anyhow::{Context, bail};
use proxy::config::Config;
use proxy::environment;

use self::runtime::Registry;

const USAGE: &str = "\
Usage: tether [OPTIONS]

Options:
  -c, --config <PATH>  Configuration file
  -d, --debug          Log debug messages
  -v, --verbose        Log every protocol line
  -V, --version        Print version
  -h, --help           Print help";

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    level: Option<log::LevelFilter>,
    version: bool,
    help: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Args::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "-d" | "--debug" => parsed.level = Some(log::LevelFilter::Debug),
                "-v" | "--verbose" => parsed.level = Some(log::LevelFilter::Trace),
                "-V" | "--version" => parsed.version = true,
                "-h" | "--help" => parsed.help = true,
                other => bail!("unexpected argument {other:?}\n\n{USAGE}"),
            }
        }

        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;

    if args.help {
        println!("{USAGE}");
        return Ok(());
    }

    if args.version {
        println!("{}", environment::formatted_version());
        return Ok(());
    }

    logger::setup(args.level.unwrap_or(log::LevelFilter::Info)).context("setting up logging")?;
    log::info!("{} has started", environment::formatted_version());

    let path = args.config.unwrap_or_else(Config::path);
    let config =
        Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    log::info!(
        "loaded {} account(s) from {}",
        config.accounts.len(),
        path.display()
    );

    let address = config.listen.address.clone();
    let registry = Registry::new(config);
    registry.start();

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(registry.clone(), path));

    listener::run(registry, &address)
        .await
        .with_context(|| format!("listening on {address}"))
}

/// Reloads the configuration on `SIGHUP`.
#[cfg(unix)]
async fn reload_on_hangup(registry: std::sync::Arc<Registry>, path: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            log::error!("failed to listen for SIGHUP: {error}");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match Config::load(&path) {
            Ok(config) => {
                log::info!("reloading {}", path.display());
                registry.reload(config);
            }
            Err(error) => log::error!("keeping previous configuration: {error}"),
        }
    }
}

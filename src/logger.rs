use std::fs::{self, OpenOptions};

use proxy::environment;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("logger error: {0}")]
    LogError(#[from] log::SetLoggerError),
}

pub fn setup(level: log::LevelFilter) -> Result<(), Error> {
    let data_dir = environment::data_dir();
    fs::create_dir_all(&data_dir)?;

    let log_file = OpenOptions::new()
        .write(true)
        .create(true)
        .append(true)
        .open(data_dir.join(environment::LOG_FILE_NAME))?;

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {} -- {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ));
        })
        .level(log::LevelFilter::Off)
        .level_for("panic", log::LevelFilter::Error)
        .level_for("rustls", log::LevelFilter::Warn)
        .level_for("irc", level)
        .level_for("proxy", level)
        .level_for("tether", level)
        .chain(std::io::stdout())
        .chain(log_file)
        .apply()?;

    Ok(())
}

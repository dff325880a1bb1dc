use std::env;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOG_FILE_NAME: &str = "tether.log";
pub const APPLICATION_NAME: &str = "tether";

pub fn formatted_version() -> String {
    format!("{APPLICATION_NAME} {VERSION}")
}

pub fn config_dir() -> PathBuf {
    portable_dir().unwrap_or_else(|| {
        dirs_next::config_dir()
            .unwrap_or_else(env::temp_dir)
            .join(APPLICATION_NAME)
    })
}

pub fn data_dir() -> PathBuf {
    portable_dir().unwrap_or_else(|| {
        dirs_next::data_dir()
            .unwrap_or_else(env::temp_dir)
            .join(APPLICATION_NAME)
    })
}

/// Checks if a config file exists in the same directory as the executable.
/// If so, it'll use that directory for both config & data dirs.
fn portable_dir() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let dir = exe.parent()?;

    dir.join(CONFIG_FILE_NAME)
        .is_file()
        .then(|| dir.to_path_buf())
}

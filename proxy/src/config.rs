use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::environment;

const PASSWORD_HASH_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub listen: Listen,
    /// Keyed by normalized username
    pub accounts: BTreeMap<String, Arc<Account>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listen {
    #[serde(default = "default_listen_address")]
    pub address: String,
    /// Server name used as the source of synthesized lines
    #[serde(default = "default_listen_name")]
    pub name: String,
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            name: default_listen_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub password: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub suspended: Option<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    pub nickname: String,
    #[serde(default)]
    pub alt_nickname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default = "default_bool_true")]
    pub reconnect: bool,
    /// Close attached clients when the upstream connection drops
    #[serde(default)]
    pub user_disconnect: bool,
    #[serde(default = "default_bool_true")]
    pub keep_nick: bool,
    /// Forward parser errors to attached clients
    #[serde(default)]
    pub report_errors: bool,
    #[serde(default)]
    pub dangerously_accept_invalid_certs: bool,
    /// PEM roots trusted in addition to the platform's
    #[serde(default)]
    pub root_cert_path: Option<PathBuf>,
    /// PEM certificate presented to the server, may also hold the key
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_backbuffer")]
    pub backbuffer: usize,
    #[serde(default = "default_private_backbuffer")]
    pub private_backbuffer: usize,
    #[serde(default)]
    pub backbuffer_timeout: u64,
    #[serde(default)]
    pub perform: Perform,
    #[serde(default)]
    pub subclients: BTreeMap<String, Subclient>,
}

impl Account {
    pub fn check_password(&self, password: &str) -> bool {
        match self.password.strip_prefix(PASSWORD_HASH_PREFIX) {
            Some(hash) => hash.eq_ignore_ascii_case(&hash_password(password)),
            None => self.password == password,
        }
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nickname)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nickname)
    }

    /// Settings for a named subclient, or the defaults when the client
    /// did not name one or names one that isn't configured.
    pub fn subclient(&self, name: Option<&str>) -> Subclient {
        name.and_then(|name| self.subclients.get(&name.to_lowercase()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn backbuffer_timeout(&self) -> Option<Duration> {
        (self.backbuffer_timeout > 0).then(|| Duration::from_secs(self.backbuffer_timeout))
    }
}

/// Raw protocol lines sent at lifecycle points.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Perform {
    #[serde(default)]
    pub connect: Vec<String>,
    #[serde(default)]
    pub attach: Vec<String>,
    #[serde(default)]
    pub detach: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subclient {
    #[serde(default = "default_bool_true")]
    pub autoburst: bool,
    /// Channels this subclient may see. Empty allows every channel.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
}

impl Default for Subclient {
    fn default() -> Self {
        Self {
            autoburst: true,
            channels: vec![],
            highlights: vec![],
        }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        environment::config_dir().join(environment::CONFIG_FILE_NAME)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        #[derive(Deserialize)]
        struct Configuration {
            #[serde(default)]
            listen: Listen,
            #[serde(default)]
            accounts: BTreeMap<String, Account>,
        }

        let Configuration { listen, accounts } = toml::from_str(content)?;

        let mut normalized = BTreeMap::new();

        for (name, mut account) in accounts {
            if account.nickname.trim().is_empty() {
                return Err(Error::MissingNickname(name));
            }

            account.subclients = account
                .subclients
                .into_iter()
                .map(|(name, subclient)| (name.to_lowercase(), subclient))
                .collect();

            if normalized
                .insert(normalize_username(&name), Arc::new(account))
                .is_some()
            {
                return Err(Error::DuplicateAccount(name));
            }
        }

        Ok(Config {
            listen,
            accounts: normalized,
        })
    }

    pub fn account(&self, username: &str) -> Option<&Arc<Account>> {
        self.accounts.get(&normalize_username(username))
    }
}

/// Usernames are case insensitive and treat `.` as `_`.
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase().replace('.', "_")
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn default_bool_true() -> bool {
    true
}

fn default_backbuffer() -> usize {
    100
}

fn default_private_backbuffer() -> usize {
    200
}

fn default_listen_address() -> String {
    "0.0.0.0:6667".to_string()
}

fn default_listen_name() -> String {
    "tether.irc".to_string()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config could not be read from {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error("account {0} has no nickname")]
    MissingNickname(String),
    #[error("account {0} is configured more than once")]
    DuplicateAccount(String),
}

use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 6667;
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// An upstream server parsed from `host[:[+]port] [password]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub password: Option<String>,
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (address, password) = match s.split_once(char::is_whitespace) {
            Some((address, password)) => (address, Some(password.trim().to_string())),
            None => (s, None),
        };

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            // [ipv6]:port
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| Error::Unparseable(s.to_string()))?;
            (host, rest.strip_prefix(':'))
        } else {
            match address.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            }
        };

        if host.is_empty() {
            return Err(Error::Unparseable(s.to_string()));
        }

        let (tls, port) = match port {
            Some(port) => match port.strip_prefix('+') {
                Some(port) => (true, port),
                None => (false, port),
            },
            None => (false, ""),
        };

        let port = if port.is_empty() {
            if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT }
        } else {
            port.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| Error::InvalidPort(port.to_string()))?
        };

        Ok(Target {
            host: host.to_string(),
            port,
            tls,
            password: password.filter(|password| !password.is_empty()),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tls = if self.tls { "+" } else { "" };

        if self.host.contains(':') {
            write!(f, "[{}]:{tls}{}", self.host, self.port)
        } else {
            write!(f, "{}:{tls}{}", self.host, self.port)
        }
    }
}

/// Picks the server for a connection attempt, rotating through the list.
pub fn select(servers: &[String], index: usize) -> Result<Target, Error> {
    if servers.is_empty() {
        return Err(Error::NoServers);
    }

    servers[index % servers.len()].parse()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no servers configured")]
    NoServers,
    #[error("unable to parse server: {0}")]
    Unparseable(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

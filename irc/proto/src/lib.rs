use std::fmt;

pub use self::command::{Command, Numeric};

pub mod command;
pub mod format;
pub mod parse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tags: Vec<Tag>,
    pub source: Option<Source>,
    pub command: Command,
}

impl Message {
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        let key = key.into();
        self.tags.retain(|tag| tag.key != key);
        self.tags.push(Tag { key, value });
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .and_then(|tag| tag.value.as_deref())
    }

    pub fn user(&self) -> Option<&User> {
        match self.source.as_ref()? {
            Source::User(user) => Some(user),
            Source::Server(_) => None,
        }
    }

    pub fn source_nickname(&self) -> Option<&str> {
        self.user().map(|user| user.nickname.as_str())
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self {
            tags: vec![],
            source: None,
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Server(String),
    User(User),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Server(server) => write!(f, "{server}"),
            Source::User(user) => write!(f, "{user}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub nickname: String,
    pub username: Option<String>,
    pub hostname: Option<String>,
}

impl User {
    pub fn new(
        nickname: impl Into<String>,
        username: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            username: Some(username.into()),
            hostname: Some(hostname.into()),
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nickname)?;

        if let Some(username) = &self.username {
            write!(f, "!{username}")?;
        }

        if let Some(hostname) = &self.hostname {
            write!(f, "@{hostname}")?;
        }

        Ok(())
    }
}

pub fn command(command: &str, parameters: Vec<String>) -> Message {
    Message {
        tags: vec![],
        source: None,
        command: Command::new(command, parameters),
    }
}

pub const CHANNEL_PREFIXES: [char; 4] = ['#', '&', '+', '!'];

pub fn is_channel(target: &str) -> bool {
    target.starts_with(CHANNEL_PREFIXES)
}

pub const CHANNEL_MEMBERSHIP_PREFIXES: [char; 5] = ['~', '&', '@', '%', '+'];

#[macro_export]
macro_rules! command {
    ($c:expr) => (
        $crate::command($c, vec![])
    );
    ($c:expr, $($p:expr),+ $(,)?) => (
        $crate::command($c, vec![$($p.into(),)*])
    );
}

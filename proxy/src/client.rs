use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use irc::proto::{self, command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Capabilities the bouncer offers to its own clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Batch,
    ServerTime,
    ServerTimeIso,
    ExtendedJoin,
    MultiPrefix,
    UserhostInNames,
    MessageTags,
    NoPlayback,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Batch,
        Capability::ServerTime,
        Capability::ServerTimeIso,
        Capability::ExtendedJoin,
        Capability::MultiPrefix,
        Capability::UserhostInNames,
        Capability::MessageTags,
        Capability::NoPlayback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Batch => "batch",
            Capability::ServerTime => "server-time",
            Capability::ServerTimeIso => "znc.in/server-time-iso",
            Capability::ExtendedJoin => "extended-join",
            Capability::MultiPrefix => "multi-prefix",
            Capability::UserhostInNames => "userhost-in-names",
            Capability::MessageTags => "message-tags",
            Capability::NoPlayback => "tether.irc/no-playback",
        }
    }
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|capability| capability.as_str().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the socket layer is asked to do with a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Message(proto::Message),
    Close(String),
}

/// A downstream connection attached to an account.
///
/// The socket itself belongs to the listener task, the core only holds the
/// sending half of its output channel.
#[derive(Debug)]
pub struct Client {
    id: Id,
    nickname: String,
    subclient: Option<String>,
    autoburst: bool,
    capabilities: HashSet<Capability>,
    welcomed: bool,
    force_requeue: bool,
    sender: mpsc::UnboundedSender<Output>,
}

impl Client {
    pub fn new(
        id: Id,
        nickname: String,
        subclient: Option<String>,
        autoburst: bool,
        capabilities: HashSet<Capability>,
        sender: mpsc::UnboundedSender<Output>,
    ) -> Self {
        Self {
            id,
            nickname,
            subclient,
            autoburst,
            capabilities,
            welcomed: false,
            force_requeue: false,
            sender,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = nickname.into();
    }

    pub fn subclient(&self) -> Option<&str> {
        self.subclient.as_deref()
    }

    pub fn is_autoburst(&self) -> bool {
        self.autoburst
    }

    pub fn set_autoburst(&mut self, autoburst: bool) {
        self.autoburst = autoburst;
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports_server_time(&self) -> bool {
        self.has_capability(Capability::ServerTime) || self.has_capability(Capability::ServerTimeIso)
    }

    pub fn is_welcomed(&self) -> bool {
        self.welcomed
    }

    pub fn set_welcomed(&mut self, welcomed: bool) {
        self.welcomed = welcomed;
    }

    /// Commands from this client are queued instead of processed.
    pub fn is_force_requeue(&self) -> bool {
        self.force_requeue
    }

    pub fn set_force_requeue(&mut self, force_requeue: bool) {
        self.force_requeue = force_requeue;
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Best effort, a closed client is ignored.
    pub fn send(&self, message: proto::Message) {
        let message = self.render(message, Utc::now());

        if self.sender.unbounded_send(Output::Message(message)).is_err() {
            log::trace!("[{}] dropped line for closed client", self.id);
        }
    }

    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();

        let _ = self
            .sender
            .unbounded_send(Output::Message(command!("ERROR", reason.clone())));
        let _ = self.sender.unbounded_send(Output::Close(reason));
    }

    /// Tags are only kept for clients that negotiated them.
    fn render(&self, mut message: proto::Message, now: DateTime<Utc>) -> proto::Message {
        let server_time = self.supports_server_time();

        if !self.has_capability(Capability::MessageTags) {
            let batch = self.has_capability(Capability::Batch);

            message.tags.retain(|tag| match tag.key.as_str() {
                "time" => server_time,
                "batch" => batch,
                _ => false,
            });
        } else if !server_time {
            message.tags.retain(|tag| tag.key != "time");
        }

        if server_time && message.tag("time").is_none() {
            message = message.with_tag("time", Some(format_time(now)));
        }

        message
    }
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

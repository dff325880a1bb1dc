//! The protocol proxy.
//!
//! One handler follows one upstream connection attempt. It decides for every
//! client command whether to answer it from cached state or forward it, and
//! for every upstream line whether and to which clients it is relayed.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::channel::mpsc;
use irc::proto::{self, Command, Message, command};
use itertools::Itertools;

use crate::account::Session;
use crate::channel::{Channel, List};
use crate::client::{self, Capability, Client};
use crate::event::Event;
use crate::gate::{self, Gate, Scope};
use crate::parser::{self, Parser};
use crate::requeue::{self, MAX_RETRIES};
use crate::{active, backbuffer, environment, reply, server};

pub const KEEP_NICK_INTERVAL: Duration = Duration::from_secs(60);

/// Commands accepting `-f` before their channel argument.
const FORCEABLE: [&str; 6] = ["JOIN", "PART", "TOPIC", "NAMES", "MODE", "LISTMODE"];

/// Commands whose first argument may be a channel.
const CHANNEL_COMMANDS: [&str; 9] = [
    "JOIN", "PART", "TOPIC", "NAMES", "MODE", "LISTMODE", "PRIVMSG", "NOTICE", "KICK",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The connection is gone. Returned once per handler.
    Closed(String),
}

#[derive(Debug, Clone, Copy)]
enum Route<'a> {
    All,
    Channel(&'a str),
    Channels(&'a [String]),
}

#[derive(Debug)]
pub struct Handler {
    id: Id,
    index: usize,
    target: server::Target,
    parser: Parser,
    parser_ready: bool,
    has_motd_end: bool,
    /// `001` to `005` as received, replayed to attaching clients
    welcome: Vec<Message>,
    gate: Gate,
    requeue: requeue::Queue,
    active: active::Tracker,
    has_socket_closed: bool,
    nick_change_pending: bool,
    keep_nick_at: Option<Instant>,
    last_error: Option<String>,
}

impl Handler {
    /// Creates a handler and queues the registration burst. The receiver
    /// yields every line to be written upstream.
    pub fn new(
        id: Id,
        index: usize,
        session: &Session,
        target: server::Target,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded();

        let mut parser = Parser::new(
            session.name.clone(),
            session.config.clone(),
            target.clone(),
            sender,
        );
        parser.register();

        let mut gate = Gate::default();
        gate.allow_standing(Scope::Global, gate::RPL_UMODEIS);

        let handler = Self {
            id,
            index,
            target,
            parser,
            parser_ready: false,
            has_motd_end: false,
            welcome: vec![],
            gate,
            requeue: requeue::Queue::default(),
            active: active::Tracker::default(),
            has_socket_closed: false,
            nick_change_pending: false,
            keep_nick_at: None,
            last_error: None,
        };

        (handler, receiver)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn target(&self) -> &server::Target {
        &self.target
    }

    /// The upstream welcome burst has completed.
    pub fn is_ready(&self) -> bool {
        self.parser_ready
    }

    pub fn is_closed(&self) -> bool {
        self.has_socket_closed
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// Lines waiting to be reprocessed.
    pub fn pending(&self) -> usize {
        self.requeue.len()
    }

    pub fn send(&self, message: Message) {
        self.parser.send(message);
    }

    pub fn quit(&self, reason: &str) {
        self.send(command!("QUIT", reason));
    }

    pub fn dispatch(&mut self, session: &mut Session, event: Event) -> Flow {
        if self.has_socket_closed {
            return Flow::Continue;
        }

        match event {
            Event::DataIn(message) => {
                log::trace!("[{}] <- {}", session.name, encode(&message));

                let events = self.parser.handle(&message);
                self.relay(session, &message);

                for event in events {
                    if let Flow::Closed(reason) = self.dispatch(session, event) {
                        return Flow::Closed(reason);
                    }
                }
            }
            Event::DataOut(message) => {
                log::trace!("[{}] -> {}", session.name, encode(&message));
            }
            Event::NickChange {
                new,
                ours,
                channels,
                message,
                ..
            } => {
                if ours {
                    self.nick_change_pending = false;

                    for client in session.clients.iter_mut().filter(|client| client.is_welcomed()) {
                        client.send(message.clone());
                        client.set_nickname(new.clone());
                    }
                } else {
                    self.route(session, Route::Channels(&channels), &message);
                }
            }
            Event::Quit {
                channels, message, ..
            } => {
                self.route(session, Route::Channels(&channels), &message);
            }
            Event::ChannelSelfJoin(name) => self.on_self_join(session, &name),
            Event::ChannelJoin {
                channel,
                user,
                account,
                realname,
            } => {
                for client in &session.clients {
                    if !self.is_visible(session, client, &channel) {
                        continue;
                    }

                    let join = if client.has_capability(Capability::ExtendedJoin) {
                        Command::JOIN(
                            channel.clone(),
                            Some(account.clone().unwrap_or_else(|| "*".to_string())),
                            Some(realname.clone().unwrap_or_default()),
                        )
                    } else {
                        Command::JOIN(channel.clone(), None, None)
                    };

                    client.send(Message::from(join).with_source(proto::Source::User(user.clone())));
                }
            }
            Event::ChannelSelfLeave(name) => {
                log::info!("[{}] left {name}", session.name);

                self.active.deactivate(None, &name);
                self.gate.clear(&Scope::channel(&name));
                session.channels.remove(&name.to_lowercase());
            }
            Event::Numeric(code, message) => self.on_numeric(session, code, message),
            Event::ErrorInfo { error, line, fatal } => {
                if fatal {
                    log::error!("[{}] {error} ({})", session.name, line.as_deref().unwrap_or("-"));
                } else {
                    log::warn!("[{}] {error} ({})", session.name, line.as_deref().unwrap_or("-"));
                }

                if session.config.report_errors {
                    session.announce(&format!("Server error: {error}"));
                }

                self.last_error = Some(error);
            }
            Event::SocketClosed(reason) => {
                let reason = reason
                    .or_else(|| self.last_error.clone())
                    .unwrap_or_else(|| "Connection closed".to_string());

                return self.close(&reason);
            }
            Event::ConnectError(error) => return self.close(&error),
        }

        Flow::Continue
    }

    /// Latched, only the first call reports the closure.
    fn close(&mut self, reason: &str) -> Flow {
        if self.has_socket_closed {
            return Flow::Continue;
        }

        self.has_socket_closed = true;
        self.keep_nick_at = None;
        self.requeue.drain();

        Flow::Closed(reason.to_string())
    }

    /// Non-numeric upstream lines.
    fn relay(&self, session: &mut Session, message: &Message) {
        match &message.command {
            // Handled by the parser or re-synthesized from its events
            Command::PING(_)
            | Command::PONG(..)
            | Command::CAP(..)
            | Command::JOIN(..)
            | Command::NICK(_)
            | Command::QUIT(_)
            | Command::ERROR(_)
            | Command::ACCOUNT(_)
            | Command::CHGHOST(..)
            | Command::BATCH(..) => {}
            command if command.numeric().is_some() => {}
            Command::PRIVMSG(target, text) | Command::NOTICE(target, text) => {
                let from_user = message.user().is_some();

                if self.parser.is_channel(target) {
                    if from_user {
                        if let Some(state) = session.channels.get_mut(&target.to_lowercase()) {
                            state.backbuffer.push(Utc::now(), message.clone());
                        }
                    }

                    self.route(session, Route::Channel(target), message);

                    if matches!(message.command, Command::PRIVMSG(..)) {
                        self.highlight(session, target, text, message);
                    }
                } else {
                    if from_user {
                        session.private.push(Utc::now(), message.clone());
                    }

                    self.route(session, Route::All, message);
                }
            }
            Command::PART(channel, _) | Command::KICK(channel, ..) | Command::TOPIC(channel, _) => {
                self.route(session, Route::Channel(channel), message);
            }
            Command::MODE(target, ..) if self.parser.is_channel(target) => {
                self.route(session, Route::Channel(target), message);
            }
            _ => self.route(session, Route::All, message),
        }
    }

    fn highlight(&self, session: &Session, channel: &str, text: &str, message: &Message) {
        let sender = message.source_nickname().unwrap_or_default();

        for client in session.clients.iter().filter(|client| client.is_welcomed()) {
            if session.authorization.is_channel_whitelisted(client, channel)
                && session.authorization.is_highlight_match(client, text)
            {
                client.send(reply::cc(
                    &session.server_name,
                    client.nickname(),
                    channel,
                    sender,
                    text,
                ));
            }
        }
    }

    fn on_numeric(&mut self, session: &mut Session, code: u16, message: Message) {
        match code {
            1 => {
                self.welcome = vec![message];
                self.has_motd_end = false;
            }
            2..=5 => {
                if !self.has_motd_end {
                    self.welcome.push(message);
                }
            }
            375 | 372 | 376 | 422 => {
                if self.has_motd_end {
                    self.route(session, Route::All, &message);
                } else if matches!(code, 376 | 422) {
                    self.has_motd_end = true;
                    self.on_ready(session);
                }
            }
            _ if gate::is_gated(code, self.parser.lists()) => {
                let channel = self.numeric_channel(&message);

                let companions = gate::companions(code, self.parser.lists());

                if self.gate.admit(channel.as_deref(), code, &companions) {
                    if code == gate::ERR_NICKNAMEINUSE {
                        self.nick_change_pending = false;
                    }

                    let route = channel.as_deref().map_or(Route::All, Route::Channel);
                    self.route(session, route, &message);
                } else {
                    log::trace!("[{}] suppressed {code:03}", session.name);
                }
            }
            _ => {
                self.gate.interrupt();

                if matches!(code, 431 | 432 | 436 | 437) {
                    self.nick_change_pending = false;
                }

                let channel = self.numeric_channel(&message);
                let route = channel.as_deref().map_or(Route::All, Route::Channel);
                self.route(session, route, &message);
            }
        }
    }

    fn on_ready(&mut self, session: &mut Session) {
        if self.parser_ready {
            return;
        }
        self.parser_ready = true;
        self.keep_nick_at = Some(Instant::now() + KEEP_NICK_INTERVAL);

        log::info!(
            "[{}] connected to {} (server {})",
            session.name,
            self.target,
            self.index + 1
        );

        for line in &session.config.perform.connect {
            if let Some(message) = parser::raw_line(line) {
                self.send(message);
            }
        }

        let rejoin = session
            .config
            .channels
            .iter()
            .chain(session.channels.values().map(|state| &state.name))
            .unique_by(|name| name.to_lowercase())
            .cloned()
            .collect::<Vec<_>>();

        for channel in rejoin {
            self.send(command!("JOIN", channel));
        }

        let nick = self.parser.nickname().to_string();
        let ids = session.clients.iter().map(Client::id).collect::<Vec<_>>();

        for id in ids {
            let Some(client) = session.client_mut(id) else {
                continue;
            };

            if client.is_welcomed() {
                if client.nickname() != nick {
                    client.send(
                        command!("NICK", nick.clone())
                            .with_source(proto::Source::User(proto::User {
                                nickname: client.nickname().to_string(),
                                username: None,
                                hostname: None,
                            })),
                    );
                    client.set_nickname(nick.clone());
                }
            } else {
                self.user_connected(session, id);
            }
        }
    }

    fn on_self_join(&mut self, session: &mut Session, name: &str) {
        log::info!("[{}] joined {name}", session.name);

        session.channel_state(name);

        // Fill the caches
        self.send(command!("MODE", name));
        for list in self.parser.list_modes() {
            self.send(command!("MODE", name, list.mode.to_string()));
        }

        let ids = session
            .clients
            .iter()
            .filter(|client| self.is_visible(session, client, name))
            .map(Client::id)
            .collect::<Vec<_>>();

        for id in ids {
            self.burst(session, id, name);
        }
    }

    /// Channel a numeric reply refers to.
    fn numeric_channel(&self, message: &Message) -> Option<String> {
        message
            .command
            .clone()
            .parameters()
            .into_iter()
            .skip(1)
            .take(2)
            .find(|param| self.parser.is_channel(param))
    }

    /// Whether a client sees traffic of a channel.
    fn is_visible(&self, session: &Session, client: &Client, channel: &str) -> bool {
        client.is_welcomed()
            && session.authorization.is_channel_whitelisted(client, channel)
            && (client.is_autoburst() || self.active.is_active(client.id(), channel))
    }

    fn route(&self, session: &Session, route: Route<'_>, message: &Message) {
        for client in &session.clients {
            let visible = match route {
                Route::All => client.is_welcomed(),
                Route::Channel(channel) => self.is_visible(session, client, channel),
                Route::Channels(channels) => channels
                    .iter()
                    .any(|channel| self.is_visible(session, client, channel)),
            };

            if visible {
                client.send(message.clone());
            }
        }
    }

    fn server_name(&self, session: &Session) -> String {
        self.parser
            .server_name()
            .unwrap_or(&session.server_name)
            .to_string()
    }

    /// Handles a command from an attached client.
    pub fn process_client_command(
        &mut self,
        session: &mut Session,
        id: client::Id,
        message: Message,
        retries: i32,
    ) {
        let Some(client) = session.client(id) else {
            return;
        };

        if client.is_force_requeue() {
            self.requeue.push(id, message, retries - 1);
            return;
        }

        let verb = message.command.command();
        let mut params = message.command.clone().parameters();

        let forced = FORCEABLE.contains(&verb.as_str())
            && params.first().is_some_and(|param| param == "-f");
        let index = usize::from(forced);

        if matches!(verb.as_str(), "JOIN" | "PART")
            && params.get(index).is_some_and(|targets| targets.contains(','))
        {
            self.split_targets(session, id, &verb, &params, index, retries);
            return;
        }

        let channel = params
            .get(index)
            .filter(|target| {
                CHANNEL_COMMANDS.contains(&verb.as_str()) && self.parser.is_channel(target)
            })
            .cloned();

        let server = self.server_name(session);
        let nick = self.parser.nickname().to_string();

        if let Some(channel) = &channel {
            if !session.authorization.is_channel_whitelisted(client, channel) {
                client.send(reply::numeric(
                    &server,
                    403,
                    vec![
                        nick,
                        channel.clone(),
                        "Channel is not whitelisted for this client".into(),
                    ],
                ));
                return;
            }

            if !client.is_autoburst() {
                let active = self.active.is_active(id, channel);

                match verb.as_str() {
                    "JOIN" => {
                        let known = self.parser.channel(channel).is_some_and(Channel::is_joined);

                        if !active {
                            self.activate_channel(session, id, channel);
                        }

                        if known && !forced {
                            return;
                        }
                    }
                    "PART" if active && !forced => {
                        self.active.deactivate(Some(id), channel);

                        client.send(
                            command!("PART", channel.clone())
                                .with_source(proto::Source::User(self.parser.user())),
                        );
                        return;
                    }
                    "PART" if forced => self.active.deactivate(Some(id), channel),
                    _ if !active => {
                        client.send(reply::numeric(
                            &server,
                            442,
                            vec![
                                nick,
                                channel.clone(),
                                format!("You must JOIN {channel} to activate it"),
                            ],
                        ));
                        return;
                    }
                    _ => {}
                }
            }
        }

        if forced {
            params.remove(0);
        }

        match verb.as_str() {
            "TOPIC" | "NAMES" | "MODE" | "LISTMODE" => {
                if let Some(message) =
                    self.can_answer_locally(session, id, &verb, &params, forced, retries)
                {
                    self.send(message);
                }
                return;
            }
            // Only closes the client's own connection
            "QUIT" => return,
            "PASS" | "USER" => {
                if let Some(client) = session.client(id) {
                    client.send(reply::numeric(
                        &server,
                        462,
                        vec![nick, "You may not reregister".into()],
                    ));
                }
                return;
            }
            "NICK" => {
                self.gate.allow(Scope::Global, gate::ERR_NICKNAMEINUSE);
                self.nick_change_pending = true;
            }
            "PRIVMSG" | "NOTICE" => self.echo(session, id, &message),
            _ => {}
        }

        self.send(proto::command(&verb, params));
    }

    /// `JOIN #a,#b` is processed as one command per channel.
    fn split_targets(
        &mut self,
        session: &mut Session,
        id: client::Id,
        verb: &str,
        params: &[String],
        index: usize,
        retries: i32,
    ) {
        let targets = params[index].clone();
        let rest = params.get(index + 1).cloned();

        for (position, target) in targets.split(',').filter(|target| !target.is_empty()).enumerate() {
            let mut split = params[..index].to_vec();
            split.push(target.to_string());

            match verb {
                "JOIN" => split.extend(
                    rest.as_deref()
                        .and_then(|keys| keys.split(',').nth(position))
                        .map(String::from),
                ),
                _ => split.extend(rest.clone()),
            }

            self.process_client_command(session, id, proto::command(verb, split), retries);
        }
    }

    /// Copies a client's message to the other clients and the backbuffer.
    fn echo(&self, session: &mut Session, id: client::Id, message: &Message) {
        let (Command::PRIVMSG(target, _) | Command::NOTICE(target, _)) = &message.command else {
            return;
        };

        let echo = Message {
            tags: vec![],
            source: Some(proto::Source::User(self.parser.user())),
            command: message.command.clone(),
        };

        let is_channel = self.parser.is_channel(target);

        for client in session.clients.iter().filter(|client| client.id() != id) {
            let visible = if is_channel {
                self.is_visible(session, client, target)
            } else {
                client.is_welcomed()
            };

            if visible {
                client.send(echo.clone());
            }
        }

        if is_channel {
            if let Some(state) = session.channels.get_mut(&target.to_lowercase()) {
                state.backbuffer.push(Utc::now(), echo);
            }
        } else {
            session.private.push(Utc::now(), echo);
        }
    }

    /// Answers `TOPIC`, `NAMES`, `MODE` and `LISTMODE` from cached state
    /// where possible. Returns the line to forward upstream, if any.
    ///
    /// `params` no longer contains the `-f` flag.
    fn can_answer_locally(
        &mut self,
        session: &Session,
        id: client::Id,
        verb: &str,
        params: &[String],
        forced: bool,
        retries: i32,
    ) -> Option<Message> {
        let client = session.client(id)?;
        let server = self.server_name(session);
        let nick = self.parser.nickname().to_string();

        let Some(target) = params.first() else {
            client.send(reply::numeric(
                &server,
                461,
                vec![nick, verb.to_string(), "Not enough parameters".into()],
            ));
            return None;
        };

        let modes = params.get(1).filter(|_| matches!(verb, "MODE" | "LISTMODE"));

        // Changes and user modes are never answered locally
        match verb {
            "MODE" if !self.parser.is_channel(target) => {
                return Some(proto::command(verb, params.to_vec()));
            }
            "MODE" if modes.is_some_and(|modes| modes.contains(['+', '-'])) => {
                return Some(proto::command(verb, params.to_vec()));
            }
            "TOPIC" if params.len() > 1 => return Some(proto::command(verb, params.to_vec())),
            _ => {}
        }

        let list_chars = match (verb, modes) {
            (_, Some(modes)) => Some(modes.clone()),
            ("LISTMODE", None) => Some(
                self.parser
                    .list_modes()
                    .iter()
                    .map(|list| list.mode)
                    .collect::<String>(),
            ),
            _ => None,
        };

        let targets = target
            .split(',')
            .filter(|target| !target.is_empty())
            .collect::<Vec<_>>();

        if forced || targets.len() > 1 {
            for target in &targets {
                let scope = Scope::channel(target);

                let numerics = match (verb, &list_chars) {
                    ("TOPIC", _) => gate::TOPIC_REPLIES.to_vec(),
                    ("NAMES", _) => gate::NAMES_REPLIES.to_vec(),
                    (_, None) => gate::MODE_REPLIES.to_vec(),
                    (_, Some(chars)) => chars
                        .chars()
                        .filter_map(|c| self.parser.list_mode(c))
                        .flat_map(|list| gate::list_replies(&list))
                        .collect(),
                };

                for numeric in numerics {
                    self.gate.allow(scope.clone(), numeric);
                }
            }

            let forwarded = match (verb, list_chars) {
                ("TOPIC" | "NAMES", _) => vec![target.clone()],
                (_, None) => vec![target.clone()],
                (_, Some(chars)) => vec![target.clone(), chars],
            };

            let verb = if verb == "LISTMODE" { "MODE" } else { verb };

            return Some(proto::command(verb, forwarded));
        }

        let channel = self.parser.channel(target).filter(|channel| channel.is_joined());

        let Some(list_chars) = list_chars else {
            let replies = match verb {
                "TOPIC" => reply::topic(&server, &nick, target, channel),
                "NAMES" => reply::names(
                    &server,
                    &nick,
                    target,
                    channel,
                    self.parser.isupport(),
                    client.has_capability(Capability::MultiPrefix),
                    client.has_capability(Capability::UserhostInNames),
                ),
                _ => match channel {
                    Some(channel) => reply::modes(&server, &nick, channel),
                    None => vec![not_on_channel(&server, &nick, target)],
                },
            };

            for reply in replies {
                client.send(reply);
            }
            return None;
        };

        let Some(channel) = channel else {
            client.send(not_on_channel(&server, &nick, target));
            return None;
        };

        let mut answered = HashSet::new();
        let mut forward = String::new();

        for c in list_chars.chars() {
            let Some(list) = self.parser.list_mode(c) else {
                if !forward.contains(c) {
                    forward.push(c);
                }
                continue;
            };

            // Aliased modes share one list
            if !answered.insert(list.list) {
                continue;
            }

            if channel.list(list.list).is_some_and(List::is_received) {
                for reply in reply::list(&server, &nick, channel, &list) {
                    client.send(reply);
                }
            } else if retries < MAX_RETRIES {
                self.requeue
                    .push(id, command!("MODE", target.clone(), c.to_string()), retries);
            } else {
                log::debug!(
                    "[{}] giving up on {} list of {target} after {retries} retries",
                    session.name,
                    list.name
                );
            }
        }

        (!forward.is_empty()).then(|| command!("MODE", target.clone(), forward))
    }

    /// Opts a non-autoburst client into a channel, bursting it when we are
    /// already in the channel.
    pub fn activate_channel(&mut self, session: &Session, id: client::Id, channel: &str) {
        if !self.active.activate(id, channel) {
            return;
        }

        if self.parser.channel(channel).is_some_and(Channel::is_joined) {
            self.burst(session, id, channel);
        }
    }

    /// JOIN, topic, names and backbuffer of a channel.
    fn burst(&self, session: &Session, id: client::Id, name: &str) {
        let (Some(client), Some(channel)) = (
            session.client(id),
            self.parser.channel(name).filter(|channel| channel.is_joined()),
        ) else {
            return;
        };

        let server = self.server_name(session);
        let nick = self.parser.nickname();

        let join = if client.has_capability(Capability::ExtendedJoin) {
            Command::JOIN(
                channel.name().to_string(),
                Some("*".to_string()),
                Some(session.config.realname().to_string()),
            )
        } else {
            Command::JOIN(channel.name().to_string(), None, None)
        };
        client.send(Message::from(join).with_source(proto::Source::User(self.parser.user())));

        for reply in reply::burst_topic(&server, nick, channel) {
            client.send(reply);
        }

        for reply in reply::names(
            &server,
            nick,
            channel.name(),
            Some(channel),
            self.parser.isupport(),
            client.has_capability(Capability::MultiPrefix),
            client.has_capability(Capability::UserhostInNames),
        ) {
            client.send(reply);
        }

        if let Some(state) = session.channels.get(&name.to_lowercase()) {
            replay(session, &server, client, channel.name(), &state.backbuffer);
        }
    }

    /// Welcomes an attached client once the upstream is ready.
    pub fn user_connected(&mut self, session: &mut Session, id: client::Id) {
        if !self.parser_ready {
            return;
        }

        let nick = self.parser.nickname().to_string();
        let server = self.server_name(session);

        let Some(client) = session.client_mut(id) else {
            return;
        };
        client.set_nickname(nick.clone());
        client.set_force_requeue(false);
        client.set_welcomed(true);

        log::debug!("[{}] welcoming {id}", session.name);

        let Some(client) = session.client(id) else {
            return;
        };

        for message in &self.welcome {
            client.send(retarget(message, &nick));
        }

        let network = self
            .parser
            .isupport()
            .network
            .clone()
            .unwrap_or_else(|| self.target.host.clone());

        for (code, text) in [
            (375, format!("- {server} Message of the Day -")),
            (
                372,
                format!("- {} attached to {network}", environment::formatted_version()),
            ),
            (376, "End of /MOTD command.".to_string()),
        ] {
            client.send(reply::numeric(&server, code, vec![nick.clone(), text]));
        }

        if !self.parser.user_modes().is_empty() {
            client.send(reply::numeric(
                &server,
                gate::RPL_UMODEIS,
                vec![nick.clone(), format!("+{}", self.parser.user_modes())],
            ));
        }

        let channels = self
            .parser
            .channels()
            .filter(|channel| channel.is_joined() && self.is_visible(session, client, channel.name()))
            .map(|channel| channel.name().to_string())
            .collect::<Vec<_>>();

        for channel in channels {
            self.burst(session, id, &channel);
        }

        replay(session, &server, client, &nick, &session.private);
    }

    pub fn user_disconnected(&mut self, id: client::Id) {
        self.active.remove_client(id);
        self.requeue.remove_client(id);
    }

    /// Makes a client drop its channels without closing its connection.
    pub fn cleanup_user(&self, session: &Session, id: client::Id) {
        let Some(client) = session.client(id) else {
            return;
        };

        let server = self.server_name(session);

        for channel in self.parser.channels() {
            if channel.is_joined() && self.is_visible(session, client, channel.name()) {
                client.send(reply::from_server(
                    &server,
                    command!(
                        "KICK",
                        channel.name(),
                        client.nickname(),
                        "Upstream connection lost"
                    ),
                ));
            }
        }
    }

    /// Reprocesses queued lines and keeps our configured nickname.
    pub fn tick(&mut self, session: &mut Session, now: Instant) {
        for line in self.requeue.drain() {
            if session.client(line.client).is_some_and(Client::is_open) {
                self.process_client_command(session, line.client, line.message, line.retries + 1);
            } else {
                log::trace!("[{}] dropped queued line of {}", session.name, line.client);
            }
        }

        let wanted = &session.config.nickname;

        if self.parser_ready
            && session.config.keep_nick
            && !self.nick_change_pending
            && !self.parser.is_ours(wanted)
            && self.keep_nick_at.is_none_or(|at| now >= at)
        {
            log::debug!("[{}] trying to regain {wanted}", session.name);

            self.send(command!("NICK", wanted.clone()));
            self.keep_nick_at = Some(now + KEEP_NICK_INTERVAL);
        }
    }
}

/// Replays a backbuffer to a client.
fn replay(
    session: &Session,
    server: &str,
    client: &Client,
    target: &str,
    backbuffer: &backbuffer::Backbuffer,
) {
    if client.has_capability(Capability::NoPlayback) {
        return;
    }

    let cutoff = session
        .config
        .backbuffer_timeout()
        .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
        .map(|timeout| Utc::now() - timeout);

    let entries = backbuffer.since(cutoff).collect::<Vec<_>>();

    if entries.is_empty() {
        return;
    }

    let batch = client
        .has_capability(Capability::Batch)
        .then(|| format!("{:08x}", rand::random::<u32>()));

    if let Some(reference) = &batch {
        client.send(reply::from_server(
            server,
            command!("BATCH", format!("+{reference}"), "chathistory", target),
        ));
    }

    for entry in entries {
        let mut message = entry
            .message
            .clone()
            .with_tag("time", Some(client::format_time(entry.timestamp)));

        if let Some(reference) = &batch {
            message = message.with_tag("batch", Some(reference.clone()));
        }

        if !client.supports_server_time() {
            message = prefix_timestamp(message, &entry.timestamp.format("%H:%M:%S").to_string());
        }

        client.send(message);
    }

    if let Some(reference) = &batch {
        client.send(reply::from_server(
            server,
            command!("BATCH", format!("-{reference}")),
        ));
    }
}

/// `[HH:MM:SS] ` in front of the text, inside CTCP ACTIONs.
fn prefix_timestamp(message: Message, time: &str) -> Message {
    let prefix = |text: &str| match text.strip_prefix("\u{1}ACTION ") {
        Some(action) => format!("\u{1}ACTION [{time}] {action}"),
        None => format!("[{time}] {text}"),
    };

    let command = match message.command {
        Command::PRIVMSG(target, text) => Command::PRIVMSG(target, prefix(&text)),
        Command::NOTICE(target, text) => Command::NOTICE(target, prefix(&text)),
        command => command,
    };

    Message { command, ..message }
}

/// The same numeric addressed to `nick`.
fn retarget(message: &Message, nick: &str) -> Message {
    let mut params = message.command.clone().parameters();

    if let Some(first) = params.first_mut() {
        *first = nick.to_string();
    }

    Message {
        tags: vec![],
        source: message.source.clone(),
        command: Command::new(&message.command.command(), params),
    }
}

fn not_on_channel(server: &str, nick: &str, channel: &str) -> Message {
    reply::numeric(
        server,
        442,
        vec![nick.into(), channel.into(), "You're not on that channel".into()],
    )
}

fn encode(message: &Message) -> String {
    proto::format::message(message.clone()).trim_end().to_string()
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::auth::{Authorization, Unrestricted};
    use crate::client::Output;
    use crate::client::test::{client, sent};
    use crate::config;
    use crate::parser::test::{account, drain, encode, line};

    struct Fixture {
        session: Session,
        handler: Handler,
        upstream: mpsc::UnboundedReceiver<Message>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_authorization(Arc::new(Unrestricted))
        }

        fn with_authorization(authorization: Arc<dyn Authorization>) -> Self {
            let session = Session::new("alice", account(), "tether.test", authorization);
            let target = server::select(&session.config.servers, 0).unwrap();
            let (handler, upstream) = Handler::new(Id::from(1), 0, &session, target);

            Self {
                session,
                handler,
                upstream,
            }
        }

        fn upstream(&mut self, lines: &[&str]) {
            for raw in lines {
                let flow = self.handler.dispatch(&mut self.session, Event::DataIn(line(raw)));
                assert_eq!(flow, Flow::Continue);
            }
        }

        fn ready(&mut self) {
            self.upstream(&[
                ":irc.test 001 alice :Welcome to the test network alice!al@host",
                ":irc.test 002 alice :Your host is irc.test",
                ":irc.test 003 alice :This server was created today",
                ":irc.test 004 alice irc.test solanum-1.0 iw bq",
                ":irc.test 005 alice CHANMODES=eIbq,k,flj,CFLMPQScgimnprstuz NETWORK=Test :are supported",
                ":irc.test 376 alice :End of /MOTD command.",
            ]);
        }

        fn join(&mut self, channel: &str) {
            self.upstream(&[
                &format!(":alice!al@host JOIN {channel}"),
                &format!(":irc.test 332 alice {channel} :Welcome to {channel}"),
                &format!(":irc.test 353 alice = {channel} :@alice bob"),
                &format!(":irc.test 366 alice {channel} :End of /NAMES list."),
            ]);
        }

        fn attach(
            &mut self,
            id: u64,
            autoburst: bool,
            capabilities: &[Capability],
        ) -> mpsc::UnboundedReceiver<Output> {
            let (client, receiver) = client(id, autoburst, capabilities);
            self.session.clients.push(client);
            self.handler
                .user_connected(&mut self.session, client::Id::from(id));

            receiver
        }

        fn command(&mut self, id: u64, raw: &str) {
            self.handler.process_client_command(
                &mut self.session,
                client::Id::from(id),
                line(raw),
                0,
            );
        }

        fn sent_upstream(&mut self) -> Vec<String> {
            drain(&mut self.upstream)
        }
    }

    fn lines(receiver: &mut mpsc::UnboundedReceiver<Output>) -> Vec<String> {
        sent(receiver).into_iter().map(encode).collect()
    }

    fn commands(receiver: &mut mpsc::UnboundedReceiver<Output>) -> Vec<String> {
        sent(receiver)
            .into_iter()
            .map(|message| message.command.command())
            .collect()
    }

    #[test]
    fn welcome_waits_for_ready_upstream() {
        let mut fixture = Fixture::new();

        let mut early = fixture.attach(1, true, &[]);
        assert!(sent(&mut early).is_empty());

        fixture.ready();

        let welcomed = commands(&mut early);
        assert_eq!(welcomed.iter().filter(|command| *command == "001").count(), 1);
        assert_eq!(
            &welcomed[..5],
            &["001", "002", "003", "004", "005"].map(String::from)
        );

        let mut late = fixture.attach(2, true, &[]);
        let welcomed = lines(&mut late);
        assert_eq!(
            welcomed[0],
            ":irc.test 001 alice :Welcome to the test network alice!al@host"
        );
        assert_eq!(
            welcomed
                .iter()
                .filter(|line| line.starts_with(":irc.test 001 "))
                .count(),
            1
        );

        // nothing more for the early client
        assert!(sent(&mut early).is_empty());
    }

    #[test]
    fn ready_joins_channels() {
        let mut fixture = Fixture::new();
        fixture.session.config = Arc::new(config::Account {
            channels: vec!["#rust".into()],
            ..(*account()).clone()
        });
        fixture.session.channel_state("#previous");
        fixture.sent_upstream();

        fixture.ready();

        assert_eq!(
            fixture.sent_upstream(),
            vec!["JOIN #rust", "JOIN #previous"]
        );
    }

    #[test]
    fn cached_ban_list_is_answered_locally() {
        let mut fixture = Fixture::new();
        fixture.ready();

        let mut receiver = fixture.attach(1, true, &[]);

        fixture.join("#chan");
        fixture.upstream(&[
            ":irc.test 367 alice #chan *!*@spam op 100",
            ":irc.test 368 alice #chan :End of Channel Ban List",
        ]);

        // the cache fill itself is never relayed
        assert!(
            !commands(&mut receiver)
                .iter()
                .any(|command| command == "367" || command == "368")
        );
        fixture.sent_upstream();

        fixture.command(1, "MODE #chan b");

        assert_eq!(
            lines(&mut receiver),
            vec![
                ":irc.test 367 alice #chan *!*@spam op 100",
                ":irc.test 368 alice #chan :End of Channel Ban List",
            ]
        );
        assert!(fixture.sent_upstream().is_empty());
    }

    #[test]
    fn forced_query_bypasses_cache() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");
        fixture.upstream(&[":irc.test 368 alice #chan :End of Channel Ban List"]);

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);
        fixture.sent_upstream();

        fixture.command(1, "MODE -f #chan b");

        assert_eq!(fixture.sent_upstream(), vec!["MODE #chan b"]);
        assert_eq!(
            fixture.handler.gate.tokens(&Scope::channel("#chan")),
            BTreeSet::from([367, 368])
        );
        assert!(sent(&mut receiver).is_empty());

        fixture.upstream(&[
            ":irc.test 367 alice #chan *!*@new op 200",
            ":irc.test 368 alice #chan :End of Channel Ban List",
        ]);

        assert_eq!(commands(&mut receiver), vec!["367", "368"]);
        assert!(fixture.handler.gate.tokens(&Scope::channel("#chan")).is_empty());
    }

    #[test]
    fn forced_mode_without_creation_time() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);
        fixture.sent_upstream();

        fixture.command(1, "MODE -f #chan");
        assert_eq!(fixture.sent_upstream(), vec!["MODE #chan"]);

        fixture.upstream(&[
            ":irc.test 324 alice #chan +nt",
            ":irc.test 482 alice #chan :You're not channel operator",
            ":irc.test 329 alice #chan 1700000000",
        ]);

        assert_eq!(commands(&mut receiver), vec!["324", "482"]);
        assert!(fixture.handler.gate.tokens(&Scope::channel("#chan")).is_empty());

        fixture.command(1, "MODE -f #chan");
        fixture.upstream(&[
            ":irc.test 324 alice #chan +nt",
            ":irc.test 329 alice #chan 1700000000",
        ]);

        assert_eq!(commands(&mut receiver), vec!["324", "329"]);
    }

    #[test]
    fn uncached_list_stops_after_max_retries() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);
        fixture.sent_upstream();

        fixture.command(1, "MODE #chan b");
        assert_eq!(fixture.handler.pending(), 1);

        let now = Instant::now();

        for retry in 1..=MAX_RETRIES {
            fixture.handler.tick(&mut fixture.session, now);

            let expected = usize::from(retry < MAX_RETRIES);
            assert_eq!(fixture.handler.pending(), expected, "retry {retry}");
        }

        for _ in 0..3 {
            fixture.handler.tick(&mut fixture.session, now);
        }

        assert!(sent(&mut receiver).is_empty());
        assert!(fixture.sent_upstream().is_empty());
    }

    #[test]
    fn requeued_list_is_answered_once_received() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);

        fixture.command(1, "MODE #chan qb");
        assert_eq!(fixture.handler.pending(), 2);

        fixture.upstream(&[
            ":irc.test 728 alice #chan q *!*@quiet op 100",
            ":irc.test 729 alice #chan q :End of Channel Quiet List",
        ]);
        fixture.handler.tick(&mut fixture.session, Instant::now());

        assert_eq!(commands(&mut receiver), vec!["728", "729"]);
        assert_eq!(fixture.handler.pending(), 1);
    }

    #[test]
    fn unknown_modes_are_forwarded_together() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");
        fixture.upstream(&[":irc.test 368 alice #chan :End of Channel Ban List"]);

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);
        fixture.sent_upstream();

        fixture.command(1, "MODE #chan bZbY");

        assert_eq!(commands(&mut receiver), vec!["368"]);
        assert_eq!(fixture.sent_upstream(), vec!["MODE #chan ZY"]);
    }

    #[test]
    fn topic_of_unknown_channel() {
        let mut fixture = Fixture::new();
        fixture.ready();

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);
        fixture.sent_upstream();

        fixture.command(1, "TOPIC #chan");

        assert_eq!(
            lines(&mut receiver),
            vec![":irc.test 331 alice #chan :No topic is set."]
        );
        assert!(fixture.sent_upstream().is_empty());
    }

    #[test]
    fn topic_and_names_from_cache() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut receiver = fixture.attach(1, true, &[Capability::MultiPrefix]);
        sent(&mut receiver);
        fixture.sent_upstream();

        fixture.command(1, "TOPIC #chan");
        fixture.command(1, "NAMES #chan");
        fixture.command(1, "MODE #chan");
        fixture.command(1, "NAMES");

        assert_eq!(
            lines(&mut receiver),
            vec![
                ":irc.test 332 alice #chan :Welcome to #chan",
                ":irc.test 353 alice = #chan :@alice bob",
                ":irc.test 366 alice #chan :End of /NAMES list.",
                ":irc.test 324 alice #chan +",
                ":irc.test 461 alice NAMES :Not enough parameters",
            ]
        );
        assert!(fixture.sent_upstream().is_empty());

        fixture.command(1, "TOPIC #chan :new topic");
        fixture.command(1, "MODE #chan +m");
        assert_eq!(
            fixture.sent_upstream(),
            vec!["TOPIC #chan :new topic", "MODE #chan +m"]
        );
    }

    #[test]
    fn lazy_client_must_activate() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut receiver = fixture.attach(1, false, &[]);
        assert!(!commands(&mut receiver).contains(&"JOIN".to_string()));

        fixture.upstream(&[":carol!c@host PRIVMSG #chan :hello"]);
        assert!(sent(&mut receiver).is_empty());

        fixture.command(1, "PRIVMSG #chan :hi");
        assert_eq!(
            lines(&mut receiver),
            vec![":irc.test 442 alice #chan :You must JOIN #chan to activate it"]
        );

        fixture.sent_upstream();
        fixture
            .handler
            .activate_channel(&fixture.session, client::Id::from(1), "#chan");

        let burst = sent(&mut receiver);
        assert_eq!(
            burst
                .iter()
                .map(|message| message.command.command())
                .collect::<Vec<_>>(),
            vec!["JOIN", "332", "353", "366", "PRIVMSG"]
        );
        let Command::PRIVMSG(_, text) = &burst[4].command else {
            panic!("expected replayed message");
        };
        assert!(text.ends_with("] hello"));

        fixture.upstream(&[":carol!c@host PRIVMSG #chan :again"]);
        assert_eq!(
            lines(&mut receiver),
            vec![":carol!c@host PRIVMSG #chan again"]
        );
        assert!(fixture.sent_upstream().is_empty());
    }

    #[test]
    fn lazy_join_and_part_stay_local() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut receiver = fixture.attach(1, false, &[]);
        sent(&mut receiver);
        fixture.sent_upstream();

        fixture.command(1, "JOIN #chan");
        assert_eq!(commands(&mut receiver)[0], "JOIN");

        fixture.command(1, "PART #chan");
        assert_eq!(
            lines(&mut receiver),
            vec![":alice!al@host PART #chan"]
        );
        assert!(fixture.sent_upstream().is_empty());

        // unknown channels are joined upstream
        fixture.command(1, "JOIN #new,#chan");
        assert_eq!(fixture.sent_upstream(), vec!["JOIN #new"]);
        assert!(fixture.handler.active.is_active(client::Id::from(1), "#new"));

        fixture.join("#new");
        assert!(commands(&mut receiver).contains(&"JOIN".to_string()));
    }

    #[test]
    fn whitelist_is_enforced() {
        #[derive(Debug)]
        struct OnlyRust;

        impl Authorization for OnlyRust {
            fn is_channel_whitelisted(&self, _client: &Client, channel: &str) -> bool {
                channel.eq_ignore_ascii_case("#rust")
            }

            fn is_highlight_match(&self, _client: &Client, text: &str) -> bool {
                text.contains("alice")
            }
        }

        let mut fixture = Fixture::with_authorization(Arc::new(OnlyRust));
        fixture.ready();
        fixture.join("#rust");
        fixture.join("#secret");

        let mut receiver = fixture.attach(1, true, &[]);
        let welcome = commands(&mut receiver);
        assert_eq!(welcome.iter().filter(|command| *command == "JOIN").count(), 1);
        fixture.sent_upstream();

        fixture.command(1, "TOPIC #secret");
        assert_eq!(
            lines(&mut receiver),
            vec![":irc.test 403 alice #secret :Channel is not whitelisted for this client"]
        );

        fixture.upstream(&[":carol!c@host PRIVMSG #secret :hey alice"]);
        assert!(sent(&mut receiver).is_empty());

        fixture.upstream(&[":carol!c@host PRIVMSG #rust :hey alice"]);
        assert_eq!(
            lines(&mut receiver),
            vec![
                ":carol!c@host PRIVMSG #rust :hey alice",
                ":*cc!tether@tether.test PRIVMSG alice :#rust <carol> hey alice",
            ]
        );
        assert!(fixture.sent_upstream().is_empty());
    }

    #[test]
    fn nick_in_use_only_after_client_nick() {
        let mut fixture = Fixture::new();
        fixture.ready();

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);

        fixture.upstream(&[":irc.test 433 alice alice_ :Nickname is already in use"]);
        assert!(sent(&mut receiver).is_empty());

        fixture.command(1, "NICK alice_");
        fixture.upstream(&[
            ":irc.test 433 alice alice_ :Nickname is already in use",
            ":irc.test 433 alice alice_ :Nickname is already in use",
        ]);
        assert_eq!(commands(&mut receiver), vec!["433"]);
    }

    #[test]
    fn keep_nick() {
        let mut fixture = Fixture::new();
        fixture.upstream(&[
            ":irc.test 433 * alice :Nickname is already in use",
            ":irc.test 001 alice_away :Welcome alice_away!al@host",
            ":irc.test 422 alice_away :MOTD File is missing",
        ]);
        assert!(fixture.handler.is_ready());
        fixture.sent_upstream();

        let later = Instant::now() + KEEP_NICK_INTERVAL * 2;

        fixture.handler.tick(&mut fixture.session, later);
        assert_eq!(fixture.sent_upstream(), vec!["NICK alice"]);

        fixture.handler.tick(&mut fixture.session, later);
        assert!(fixture.sent_upstream().is_empty());
    }

    #[test]
    fn client_messages_are_echoed_and_archived() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut first = fixture.attach(1, true, &[]);
        let mut second = fixture.attach(2, true, &[]);
        sent(&mut first);
        sent(&mut second);
        fixture.sent_upstream();

        fixture.command(1, "PRIVMSG #chan :hello all");

        assert_eq!(fixture.sent_upstream(), vec!["PRIVMSG #chan :hello all"]);
        assert!(sent(&mut first).is_empty());
        assert_eq!(
            lines(&mut second),
            vec![":alice!al@host PRIVMSG #chan :hello all"]
        );
        assert_eq!(fixture.session.channels["#chan"].backbuffer.len(), 1);
    }

    #[test]
    fn replay_uses_batches() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");
        fixture.upstream(&[":carol!c@host PRIVMSG #chan :hello"]);

        let mut receiver =
            fixture.attach(1, true, &[Capability::Batch, Capability::ServerTime]);

        let messages = sent(&mut receiver);
        let position = messages
            .iter()
            .position(|message| message.command.command() == "BATCH")
            .unwrap();

        let start = &messages[position];
        let replayed = &messages[position + 1];
        let end = &messages[position + 2];

        let Command::BATCH(reference, parameters) = &start.command else {
            panic!("expected batch start");
        };
        assert_eq!(parameters, &["chathistory".to_string(), "#chan".to_string()]);
        assert_eq!(replayed.tag("batch"), reference.strip_prefix('+'));
        assert!(replayed.tag("time").is_some());
        assert_eq!(
            replayed.command,
            Command::PRIVMSG("#chan".into(), "hello".into())
        );
        assert!(matches!(&end.command, Command::BATCH(reference, _) if reference.starts_with('-')));
    }

    #[test]
    fn no_playback() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");
        fixture.upstream(&[":carol!c@host PRIVMSG #chan :hello"]);

        let mut receiver = fixture.attach(1, true, &[Capability::NoPlayback]);

        assert!(!commands(&mut receiver).contains(&"PRIVMSG".to_string()));
    }

    #[test]
    fn cleanup_kicks_visible_channels() {
        let mut fixture = Fixture::new();
        fixture.ready();
        fixture.join("#chan");

        let mut receiver = fixture.attach(1, true, &[]);
        sent(&mut receiver);

        fixture
            .handler
            .cleanup_user(&fixture.session, client::Id::from(1));

        assert_eq!(
            lines(&mut receiver),
            vec![":irc.test KICK #chan alice :Upstream connection lost"]
        );
    }

    #[test]
    fn close_is_latched() {
        let mut fixture = Fixture::new();

        fixture.upstream(&["ERROR :Closing Link: banned"]);

        let first = fixture
            .handler
            .dispatch(&mut fixture.session, Event::SocketClosed(None));
        let second = fixture
            .handler
            .dispatch(&mut fixture.session, Event::SocketClosed(None));
        let third = fixture
            .handler
            .dispatch(&mut fixture.session, Event::ConnectError("late".into()));

        assert_eq!(first, Flow::Closed("Closing Link: banned".into()));
        assert_eq!(second, Flow::Continue);
        assert_eq!(third, Flow::Continue);
        assert!(fixture.handler.is_closed());
    }

    #[test]
    fn forced_requeue_holds_lines() {
        let mut fixture = Fixture::new();

        let (mut client, mut receiver) = client(1, true, &[]);
        client.set_force_requeue(true);
        fixture.session.clients.push(client);
        fixture.sent_upstream();

        fixture.command(1, "JOIN #later");
        fixture.handler.tick(&mut fixture.session, Instant::now());
        assert_eq!(fixture.handler.pending(), 1);
        assert!(fixture.sent_upstream().is_empty());

        fixture.ready();
        fixture.sent_upstream();
        sent(&mut receiver);

        fixture.handler.tick(&mut fixture.session, Instant::now());
        assert_eq!(fixture.handler.pending(), 0);
        assert_eq!(fixture.sent_upstream(), vec!["JOIN #later"]);
    }
}

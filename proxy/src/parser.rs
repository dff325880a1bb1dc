//! Upstream protocol state.
//!
//! The parser follows one upstream IRC session: registration, our own
//! identity, server support information and the channels we are in. Every
//! incoming line updates that state and is turned into typed [`Event`]s for
//! the handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::channel::mpsc;
use irc::proto::{self, Command, Message, Source, User, command};

use crate::channel::{self, Channel, ListEntry, Member};
use crate::event::Event;
use crate::isupport::Isupport;
use crate::listmode::{self, Family, ListMode};
use crate::{config, mode, server};

/// Capabilities requested from the server when offered.
const REQUESTED_CAPABILITIES: [&str; 5] = [
    "multi-prefix",
    "extended-join",
    "userhost-in-names",
    "server-time",
    "account-notify",
];

#[derive(Debug)]
pub struct Parser {
    account: String,
    config: Arc<config::Account>,
    target: server::Target,
    sender: mpsc::UnboundedSender<Message>,
    nickname: String,
    user: Option<User>,
    server_name: Option<String>,
    lists: listmode::Table,
    isupport: Isupport,
    user_modes: String,
    registered: bool,
    offered: Vec<String>,
    capabilities: Vec<String>,
    nick_attempts: usize,
    channels: BTreeMap<String, Channel>,
}

impl Parser {
    pub fn new(
        account: impl Into<String>,
        config: Arc<config::Account>,
        target: server::Target,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            account: account.into(),
            nickname: config.nickname.clone(),
            config,
            target,
            sender,
            user: None,
            server_name: None,
            lists: listmode::Table::default(),
            isupport: Isupport::default(),
            user_modes: String::new(),
            registered: false,
            offered: vec![],
            capabilities: vec![],
            nick_attempts: 0,
            channels: BTreeMap::new(),
        }
    }

    /// Queues the registration burst.
    pub fn register(&mut self) {
        self.send(command!("CAP", "LS", "302"));

        if let Some(password) = self.target.password.clone() {
            self.send(command!("PASS", password));
        }

        self.send(command!("NICK", self.nickname.clone()));
        self.send(
            Command::USER(
                self.config.username().to_string(),
                self.config.realname().to_string(),
            )
            .into(),
        );
    }

    /// Best effort, lines for a closed connection are dropped.
    pub fn send(&self, message: Message) {
        if self.sender.unbounded_send(message).is_err() {
            log::trace!("[{}] upstream closed, dropping line", self.account);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Our own user as last seen by the server.
    pub fn user(&self) -> User {
        match &self.user {
            Some(user) => User {
                nickname: self.nickname.clone(),
                ..user.clone()
            },
            None => User {
                nickname: self.nickname.clone(),
                username: Some(self.config.username().to_string()),
                hostname: None,
            },
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn isupport(&self) -> &Isupport {
        &self.isupport
    }

    pub fn user_modes(&self) -> &str {
        &self.user_modes
    }

    pub fn is_channel(&self, target: &str) -> bool {
        self.isupport.is_channel(target)
    }

    pub fn is_ours(&self, nickname: &str) -> bool {
        nickname.eq_ignore_ascii_case(&self.nickname)
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&name.to_lowercase())
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// List modes this server supports, see [`listmode::Table`].
    pub fn list_mode(&self, mode: char) -> Option<ListMode> {
        self.lists
            .get(mode)
            .filter(|list| self.isupport.chanmodes.list.contains(list.mode))
            .copied()
    }

    /// Supported list modes owning their entries.
    pub fn list_modes(&self) -> Vec<ListMode> {
        self.lists
            .lists()
            .filter(|list| self.isupport.chanmodes.list.contains(list.mode))
            .copied()
            .collect()
    }

    pub fn lists(&self) -> &listmode::Table {
        &self.lists
    }

    pub fn handle(&mut self, message: &Message) -> Vec<Event> {
        let source = message.source_nickname().map(str::to_string);

        match &message.command {
            Command::CAP(_, subcommand, a, b) => {
                self.on_cap(subcommand, a.as_deref(), b.as_deref());
                vec![]
            }
            Command::PING(token) => {
                self.send(command!("PONG", token.clone()));
                vec![]
            }
            Command::ERROR(error) => vec![Event::ErrorInfo {
                error: error.clone(),
                line: None,
                fatal: true,
            }],
            Command::NICK(new) => {
                let Some(old) = source else {
                    return vec![];
                };
                self.on_nick(&old, new, message)
            }
            Command::JOIN(channel, account, realname) => {
                let Some(user) = message.user() else {
                    return vec![];
                };

                if self.is_ours(&user.nickname) {
                    self.user = Some(user.clone());
                    self.channels
                        .entry(channel.to_lowercase())
                        .or_insert_with(|| Channel::new(channel.clone()));
                    vec![]
                } else {
                    let account = account.clone().filter(|account| account != "*");

                    if let Some(state) = self.channels.get_mut(&channel.to_lowercase()) {
                        state.add_member(Member {
                            user: user.clone(),
                            modes: vec![],
                            account: account.clone(),
                        });
                    }

                    vec![Event::ChannelJoin {
                        channel: channel.clone(),
                        user: user.clone(),
                        account,
                        realname: realname.clone(),
                    }]
                }
            }
            Command::PART(channel, _) => {
                let Some(nick) = source else {
                    return vec![];
                };
                self.on_leave(channel, &nick)
            }
            Command::KICK(channel, victim, _) => self.on_leave(channel, victim),
            Command::QUIT(_) => {
                let Some(user) = message.user() else {
                    return vec![];
                };

                let channels = self
                    .channels
                    .values_mut()
                    .filter_map(|channel| {
                        channel
                            .remove_member(&user.nickname)
                            .map(|_| channel.name().to_string())
                    })
                    .collect();

                vec![Event::Quit {
                    user: user.clone(),
                    channels,
                    message: message.clone(),
                }]
            }
            Command::TOPIC(channel, Some(topic)) => {
                if let Some(state) = self.channels.get_mut(&channel.to_lowercase()) {
                    state.topic = channel::Topic {
                        content: (!topic.is_empty()).then(|| topic.clone()),
                        who: message.source.as_ref().map(ToString::to_string),
                        time: Some(Utc::now().timestamp().to_string()),
                    };
                }
                vec![]
            }
            Command::MODE(target, Some(modes), args) => {
                let args = args.clone().unwrap_or_default();

                if self.is_channel(target) {
                    let setter = message
                        .source
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    let isupport = &self.isupport;
                    let parsed = mode::parse(modes, &args, |c| isupport.mode_kind(c));

                    if let Some(state) = self.channels.get_mut(&target.to_lowercase()) {
                        state.apply_modes(
                            &parsed,
                            &setter,
                            &Utc::now().timestamp().to_string(),
                            isupport,
                        );
                    }
                } else if self.is_ours(target) {
                    for mode in mode::parse(modes, &[], |_| mode::Kind::Never) {
                        match mode {
                            mode::Mode::Add(c, _) if !self.user_modes.contains(c) => {
                                self.user_modes.push(c);
                            }
                            mode::Mode::Remove(c, _) => self.user_modes.retain(|m| m != c),
                            _ => {}
                        }
                    }
                }
                vec![]
            }
            Command::ACCOUNT(account) => {
                if let Some(nick) = source {
                    let account = (account != "*").then(|| account.clone());

                    for channel in self.channels.values_mut() {
                        if let Some(member) = channel.member_mut(&nick) {
                            member.account = account.clone();
                        }
                    }
                }
                vec![]
            }
            Command::CHGHOST(username, hostname) => {
                if let Some(nick) = source {
                    if self.is_ours(&nick) {
                        self.user = Some(User::new(nick.clone(), username, hostname));
                    }

                    for channel in self.channels.values_mut() {
                        if let Some(member) = channel.member_mut(&nick) {
                            member.user.username = Some(username.clone());
                            member.user.hostname = Some(hostname.clone());
                        }
                    }
                }
                vec![]
            }
            command => match command.numeric() {
                Some(code) => self.on_numeric(code, message),
                None => vec![],
            },
        }
    }

    fn on_cap(&mut self, subcommand: &str, a: Option<&str>, b: Option<&str>) {
        match subcommand {
            "LS" => {
                // Multiline replies carry `*` before the list
                let (more, list) = match (a, b) {
                    (Some("*"), Some(list)) => (true, list),
                    (Some(list), _) => (false, list),
                    (None, _) => (false, ""),
                };

                self.offered.extend(
                    list.split_whitespace()
                        .map(|cap| cap.split_once('=').map_or(cap, |(name, _)| name))
                        .map(String::from),
                );

                if more || self.registered {
                    return;
                }

                let requested = REQUESTED_CAPABILITIES
                    .into_iter()
                    .filter(|cap| self.offered.iter().any(|offered| offered == cap))
                    .collect::<Vec<_>>();

                if requested.is_empty() {
                    self.send(command!("CAP", "END"));
                } else {
                    self.send(command!("CAP", "REQ", requested.join(" ")));
                }
            }
            "ACK" => {
                self.capabilities
                    .extend(a.unwrap_or_default().split_whitespace().map(String::from));
                log::debug!("[{}] capabilities: {:?}", self.account, self.capabilities);

                if !self.registered {
                    self.send(command!("CAP", "END"));
                }
            }
            "NAK" if !self.registered => self.send(command!("CAP", "END")),
            _ => {}
        }
    }

    fn on_nick(&mut self, old: &str, new: &str, message: &Message) -> Vec<Event> {
        let ours = self.is_ours(old);

        if ours {
            self.nickname = new.to_string();
        }

        let channels = self
            .channels
            .values_mut()
            .filter_map(|channel| {
                channel
                    .rename_member(old, new)
                    .then(|| channel.name().to_string())
            })
            .collect();

        vec![Event::NickChange {
            old: old.to_string(),
            new: new.to_string(),
            ours,
            channels,
            message: message.clone(),
        }]
    }

    fn on_leave(&mut self, channel: &str, nick: &str) -> Vec<Event> {
        if self.is_ours(nick) {
            match self.channels.remove(&channel.to_lowercase()) {
                Some(state) => vec![Event::ChannelSelfLeave(state.name().to_string())],
                None => vec![],
            }
        } else {
            if let Some(state) = self.channels.get_mut(&channel.to_lowercase()) {
                state.remove_member(nick);
            }
            vec![]
        }
    }

    fn on_numeric(&mut self, code: u16, message: &Message) -> Vec<Event> {
        let params = message.command.clone().parameters();
        let param = |index: usize| params.get(index).map(String::as_str);

        let mut events = vec![];

        match code {
            1 => {
                self.registered = true;

                if let Some(nick) = param(0) {
                    self.nickname = nick.to_string();
                }

                if let Some(Source::Server(server)) = &message.source {
                    self.server_name = Some(server.clone());
                }

                // Most servers end the welcome text with our full mask
                if let Some(mask) = params
                    .last()
                    .and_then(|text| text.split_whitespace().last())
                    .filter(|mask| mask.contains('!') && mask.contains('@'))
                {
                    self.user = Some(channel::parse_user(mask));
                }

                log::info!("[{}] registered as {}", self.account, self.nickname);
            }
            4 => {
                if let Some(version) = param(2) {
                    let family = Family::detect(version);
                    log::debug!("[{}] server {version} ({family:?})", self.account);
                    self.lists = listmode::Table::for_family(family);
                }
            }
            5 => {
                let tokens = params
                    .iter()
                    .skip(1)
                    .take(params.len().saturating_sub(2));

                for token in tokens {
                    match token.parse() {
                        Ok(operation) => self.isupport.apply(operation),
                        Err(error) => {
                            log::debug!("[{}] ignoring ISUPPORT {token}: {error}", self.account);
                        }
                    }
                }
            }
            221 => {
                if let Some(modes) = param(1) {
                    self.user_modes = modes.trim_start_matches('+').to_string();
                }
            }
            324 => {
                if let (Some(name), Some(modes)) = (param(1), param(2)) {
                    let isupport = &self.isupport;

                    if let Some(channel) = self.channels.get_mut(&name.to_lowercase()) {
                        channel.set_modes(modes, params.get(3..).unwrap_or_default(), isupport);
                    }
                }
            }
            329 => {
                if let (Some(channel), Some(created)) =
                    (param(1).and_then(|name| self.channel_mut(name)), param(2))
                {
                    channel.created = Some(created.to_string());
                }
            }
            331 => {
                if let Some(channel) = param(1).and_then(|name| self.channel_mut(name)) {
                    channel.topic = channel::Topic::default();
                }
            }
            332 => {
                if let (Some(channel), Some(topic)) =
                    (param(1).and_then(|name| self.channel_mut(name)), param(2))
                {
                    channel.topic.content = Some(topic.to_string());
                }
            }
            333 => {
                if let Some(channel) = param(1).and_then(|name| self.channel_mut(name)) {
                    channel.topic.who = params.get(2).cloned();
                    channel.topic.time = params.get(3).cloned();
                }
            }
            353 => {
                if let (Some(name), Some(names)) = (param(2), param(3)) {
                    let isupport = &self.isupport;

                    if let Some(channel) = self.channels.get_mut(&name.to_lowercase()) {
                        channel.names(names, isupport);
                    }
                }
            }
            366 => {
                if let Some(channel) = param(1).and_then(|name| self.channel_mut(name)) {
                    if channel.end_of_names() {
                        events.push(Event::ChannelSelfJoin(channel.name().to_string()));
                    }
                }
            }
            432 | 433 if !self.registered => {
                self.nick_attempts += 1;

                let nickname = match &self.config.alt_nickname {
                    Some(alt) if self.nick_attempts == 1 => alt.clone(),
                    _ => format!("{}_", self.nickname),
                };
                log::info!(
                    "[{}] nickname {} unavailable, trying {nickname}",
                    self.account,
                    self.nickname
                );

                self.nickname = nickname.clone();
                self.send(command!("NICK", nickname));

                return vec![];
            }
            _ => {
                if let Some(list) = self.lists.by_item(code).copied() {
                    let offset = usize::from(list.has_mode_parameter());

                    if let (Some(channel), Some(mask)) = (
                        param(1).and_then(|name| self.channel_mut(name)),
                        param(2 + offset),
                    ) {
                        channel.list_mut(list.list).item(ListEntry {
                            mask: mask.to_string(),
                            setter: params.get(3 + offset).cloned(),
                            time: params.get(4 + offset).cloned(),
                        });
                    }
                } else if let Some(list) = self.lists.by_end(code).copied() {
                    if let Some(channel) = param(1).and_then(|name| self.channel_mut(name)) {
                        channel.list_mut(list.list).end();
                    }
                }
            }
        }

        events.push(Event::Numeric(code, message.clone()));

        events
    }

    fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(&name.to_lowercase())
    }
}

/// Parses a configured raw line such as a perform entry.
pub fn raw_line(line: &str) -> Option<Message> {
    match proto::parse::message(line) {
        Ok(message) => Some(message),
        Err(error) => {
            log::warn!("ignoring invalid line {line:?}: {error}");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use irc::proto::format;

    use super::*;

    pub fn line(line: &str) -> Message {
        proto::parse::message(line).unwrap()
    }

    pub fn encode(message: Message) -> String {
        format::message(message).trim_end().to_string()
    }

    pub fn drain(receiver: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut lines = vec![];

        while let Ok(Some(message)) = receiver.try_next() {
            lines.push(encode(message));
        }

        lines
    }

    pub fn account() -> Arc<config::Account> {
        let config = config::Config::parse(
            r#"
            [accounts.alice]
            password = "hunter2"
            nickname = "alice"
            alt_nickname = "alice_away"
            realname = "Alice Liddell"
            servers = ["irc.test:6667 secret"]
            "#,
        )
        .unwrap();

        config.account("alice").unwrap().clone()
    }

    fn parser() -> (Parser, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded();
        let config = account();
        let target = server::select(&config.servers, 0).unwrap();

        (Parser::new("alice", config, target, sender), receiver)
    }

    fn feed(parser: &mut Parser, lines: &[&str]) -> Vec<Event> {
        lines
            .iter()
            .flat_map(|raw| parser.handle(&line(raw)))
            .collect()
    }

    #[test]
    fn registration() {
        let (mut parser, mut upstream) = parser();

        parser.register();
        assert_eq!(
            drain(&mut upstream),
            vec![
                "CAP LS 302",
                "PASS secret",
                "NICK alice",
                "USER alice 0 * :Alice Liddell"
            ]
        );

        feed(
            &mut parser,
            &[
                ":irc.test CAP * LS * :sasl multi-prefix",
                ":irc.test CAP * LS :server-time=foo chghost",
            ],
        );
        assert_eq!(
            drain(&mut upstream),
            vec!["CAP REQ :multi-prefix server-time"]
        );

        feed(&mut parser, &[":irc.test CAP * ACK :multi-prefix server-time"]);
        assert_eq!(drain(&mut upstream), vec!["CAP END"]);
        assert_eq!(parser.capabilities, vec!["multi-prefix", "server-time"]);

        let events = feed(
            &mut parser,
            &[
                ":irc.test 433 * alice :Nickname is already in use",
                ":irc.test 433 * alice_away :Nickname is already in use",
                ":irc.test 001 alice_away_ :Welcome to IRC alice_away_!al@host",
            ],
        );
        assert_eq!(
            drain(&mut upstream),
            vec!["NICK alice_away", "NICK alice_away_"]
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Numeric(1, _)));
        assert!(parser.is_registered());
        assert_eq!(parser.server_name(), Some("irc.test"));
        assert_eq!(parser.user().to_string(), "alice_away_!al@host");
    }

    #[test]
    fn ping() {
        let (mut parser, mut upstream) = parser();

        assert!(feed(&mut parser, &["PING :irc.test"]).is_empty());
        assert_eq!(drain(&mut upstream), vec!["PONG irc.test"]);
    }

    #[test]
    fn self_join() {
        let (mut parser, _upstream) = parser();

        let events = feed(
            &mut parser,
            &[
                ":irc.test 001 alice :Welcome",
                ":alice!al@host JOIN #Rust",
                ":irc.test 332 alice #rust :Rust talk",
                ":irc.test 333 alice #rust op!o@host 1700000000",
                ":irc.test 353 alice = #rust :@alice +bob",
                ":irc.test 366 alice #rust :End of /NAMES list.",
                ":carol!c@host JOIN #rust carol_acct :Carol",
            ],
        );

        let derived = events
            .iter()
            .filter(|event| !matches!(event, Event::Numeric(..)))
            .collect::<Vec<_>>();

        assert_eq!(derived.len(), 2);
        assert_eq!(derived[0], &Event::ChannelSelfJoin("#Rust".into()));
        assert!(matches!(
            derived[1],
            Event::ChannelJoin { account: Some(account), .. } if account == "carol_acct"
        ));

        let channel = parser.channel("#RUST").unwrap();
        assert_eq!(channel.topic.content.as_deref(), Some("Rust talk"));
        assert_eq!(channel.topic.who.as_deref(), Some("op!o@host"));
        assert_eq!(channel.members().count(), 3);
        assert_eq!(channel.member("bob").unwrap().modes, vec!['v']);
    }

    #[test]
    fn leave_and_quit() {
        let (mut parser, _upstream) = parser();

        feed(
            &mut parser,
            &[
                ":irc.test 001 alice :Welcome",
                ":alice!al@host JOIN #a",
                ":alice!al@host JOIN #b",
                ":irc.test 353 alice = #a :alice bob",
                ":irc.test 353 alice = #b :alice bob",
            ],
        );

        let events = feed(&mut parser, &[":bob!b@host QUIT :bye"]);
        assert!(matches!(
            &events[0],
            Event::Quit { channels, .. } if channels == &["#a".to_string(), "#b".to_string()]
        ));

        let events = feed(&mut parser, &[":op!o@host KICK #a alice :out"]);
        assert_eq!(events, vec![Event::ChannelSelfLeave("#a".into())]);
        assert!(parser.channel("#a").is_none());
    }

    #[test]
    fn nick_change() {
        let (mut parser, _upstream) = parser();

        feed(
            &mut parser,
            &[
                ":irc.test 001 alice :Welcome",
                ":alice!al@host JOIN #a",
                ":irc.test 353 alice = #a :alice",
            ],
        );

        let events = feed(&mut parser, &[":alice!al@host NICK alicia"]);

        assert!(matches!(
            &events[0],
            Event::NickChange { ours: true, new, channels, .. } if new == "alicia" && channels.len() == 1
        ));
        assert_eq!(parser.nickname(), "alicia");
        assert!(parser.channel("#a").unwrap().member("alicia").is_some());
    }

    #[test]
    fn list_modes() {
        let (mut parser, _upstream) = parser();

        feed(
            &mut parser,
            &[
                ":irc.test 001 alice :Welcome",
                ":irc.test 004 alice irc.test solanum-1.0 iw bq",
                ":irc.test 005 alice CHANMODES=eIbq,k,flj,CFLMPQScgimnprstuz PREFIX=(ov)@+ :are supported",
                ":alice!al@host JOIN #a",
                ":irc.test 728 alice #a q *!*@quiet op 100",
                ":irc.test 729 alice #a q :End of Channel Quiet List",
                ":irc.test 368 alice #a :End of Channel Ban List",
                ":op!o@host MODE #a +b *!*@spam",
            ],
        );

        let channel = parser.channel("#a").unwrap();
        let quiet = channel.list('q').unwrap();
        assert!(quiet.is_received());
        assert_eq!(quiet.entries()[0].mask, "*!*@quiet");

        let bans = channel.list('b').unwrap();
        assert!(bans.is_received());
        assert_eq!(bans.entries()[0].setter.as_deref(), Some("op!o@host"));

        assert!(parser.list_mode('q').is_some());
        assert_eq!(
            parser
                .list_modes()
                .iter()
                .map(|list| list.mode)
                .collect::<String>(),
            "beIq"
        );
    }

    #[test]
    fn unsupported_list_modes() {
        let (mut parser, _upstream) = parser();

        feed(
            &mut parser,
            &[
                ":irc.test 004 alice irc.test solanum-1.0 iw bq",
                ":irc.test 005 alice CHANMODES=b,k,l,imnpst :are supported",
            ],
        );

        assert!(parser.list_mode('q').is_none());
        assert!(parser.list_mode('e').is_none());
        assert!(parser.list_mode('b').is_some());
    }
}

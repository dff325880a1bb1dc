//! Lines the proxy synthesizes for its clients.

use irc::proto::{self, Message, Source, User, command};

use crate::channel::Channel;
use crate::isupport::Isupport;
use crate::listmode::ListMode;

/// Names per `353` line are packed up to this many bytes.
const NAMES_LINE_LENGTH: usize = 400;

pub fn from_server(server: &str, message: Message) -> Message {
    message.with_source(Source::Server(server.to_string()))
}

pub fn numeric(server: &str, code: u16, parameters: Vec<String>) -> Message {
    from_server(server, proto::command(&format!("{code:03}"), parameters))
}

/// A notice from the bouncer itself.
pub fn announce(name: &str, target: &str, text: impl Into<String>) -> Message {
    command!("NOTICE", target, text.into())
        .with_source(Source::User(User::new("*tether", "tether", name)))
}

/// Private copy of a highlighted channel message.
pub fn cc(name: &str, target: &str, channel: &str, sender: &str, text: &str) -> Message {
    command!("PRIVMSG", target, format!("{channel} <{sender}> {text}"))
        .with_source(Source::User(User::new("*cc", "tether", name)))
}

/// Reply to a `TOPIC #chan` query.
pub fn topic(server: &str, nick: &str, name: &str, channel: Option<&Channel>) -> Vec<Message> {
    let Some((channel, content)) =
        channel.and_then(|channel| channel.topic.content.as_ref().map(|content| (channel, content)))
    else {
        return vec![numeric(
            server,
            331,
            vec![nick.into(), name.into(), "No topic is set.".into()],
        )];
    };

    let mut replies = vec![numeric(
        server,
        332,
        vec![nick.into(), channel.name().into(), content.clone()],
    )];

    if let (Some(who), Some(time)) = (&channel.topic.who, &channel.topic.time) {
        replies.push(numeric(
            server,
            333,
            vec![nick.into(), channel.name().into(), who.clone(), time.clone()],
        ));
    }

    replies
}

/// Topic lines of a channel burst, nothing when no topic is set.
pub fn burst_topic(server: &str, nick: &str, channel: &Channel) -> Vec<Message> {
    if channel.topic.content.is_some() {
        topic(server, nick, channel.name(), Some(channel))
    } else {
        vec![]
    }
}

/// `353` lines followed by `366`. Unknown channels only get the end.
pub fn names(
    server: &str,
    nick: &str,
    name: &str,
    channel: Option<&Channel>,
    isupport: &Isupport,
    multi_prefix: bool,
    userhost: bool,
) -> Vec<Message> {
    let mut replies = vec![];

    if let Some(channel) = channel {
        let mut entries = channel
            .members()
            .map(|member| member.names_entry(isupport, multi_prefix, userhost))
            .collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.to_lowercase());

        let mut line = String::new();

        for entry in entries {
            if !line.is_empty() && line.len() + entry.len() + 1 > NAMES_LINE_LENGTH {
                replies.push(names_line(server, nick, channel, std::mem::take(&mut line)));
            }

            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&entry);
        }

        if !line.is_empty() {
            replies.push(names_line(server, nick, channel, line));
        }
    }

    let name = channel.map_or(name, Channel::name);

    replies.push(numeric(
        server,
        366,
        vec![nick.into(), name.into(), "End of /NAMES list.".into()],
    ));

    replies
}

fn names_line(server: &str, nick: &str, channel: &Channel, names: String) -> Message {
    numeric(
        server,
        353,
        vec![
            nick.into(),
            channel.symbol().into(),
            channel.name().into(),
            names,
        ],
    )
}

/// `324` and, when known, `329`.
pub fn modes(server: &str, nick: &str, channel: &Channel) -> Vec<Message> {
    let mut replies = vec![numeric(
        server,
        324,
        [nick.to_string(), channel.name().to_string()]
            .into_iter()
            .chain(channel.mode_string())
            .collect(),
    )];

    if let Some(created) = &channel.created {
        replies.push(numeric(
            server,
            329,
            vec![nick.into(), channel.name().into(), created.clone()],
        ));
    }

    replies
}

/// Cached entries of a list mode followed by its end numeric.
pub fn list(server: &str, nick: &str, channel: &Channel, list: &ListMode) -> Vec<Message> {
    let entries = channel
        .list(list.list)
        .map(|cached| cached.entries())
        .unwrap_or_default();

    let with_mode = list.has_mode_parameter();

    entries
        .iter()
        .map(|entry| {
            let mut parameters = vec![nick.to_string(), channel.name().to_string()];
            if with_mode {
                parameters.push(list.mode.to_string());
            }
            parameters.push(entry.mask.clone());
            parameters.extend(entry.setter.clone());
            parameters.extend(entry.time.clone());

            numeric(server, list.item, parameters)
        })
        .chain(std::iter::once({
            let mut parameters = vec![nick.to_string(), channel.name().to_string()];
            if with_mode {
                parameters.push(list.mode.to_string());
            }
            parameters.push(list.end_text());

            numeric(server, list.end, parameters)
        }))
        .collect()
}

use std::fmt::Write;

use itertools::Itertools;

use crate::{Command, Message, Tag};

/// Most IRC servers limit messages to 512 bytes in length, including the trailing CR-LF characters.
pub const BYTE_LIMIT: usize = 512;

pub fn message(message: Message) -> String {
    let mut output = String::with_capacity(BYTE_LIMIT);

    let tags = tags(message.tags);

    if !tags.is_empty() {
        let _ = write!(&mut output, "@{tags} ");
    }

    if let Some(source) = &message.source {
        let _ = write!(&mut output, ":{source} ");
    }

    if let Command::Raw(raw) = &message.command {
        let _ = write!(&mut output, "{raw}");
    } else {
        let command = message.command.command();
        let params = parameters(message.command.parameters());

        if params.is_empty() {
            let _ = write!(&mut output, "{command}");
        } else {
            let _ = write!(&mut output, "{command} {params}");
        }
    }

    let _ = write!(&mut output, "\r\n");

    output
}

fn tags(tags: Vec<Tag>) -> String {
    tags.into_iter().map(tag).join(";")
}

fn tag(Tag { key, value }: Tag) -> String {
    let Some(value) = value.filter(|value| !value.is_empty()) else {
        return key;
    };

    let mappings = [
        ('\\', r"\\"),
        (';', r"\:"),
        (' ', r"\s"),
        ('\r', r"\r"),
        ('\n', r"\n"),
    ];

    let escaped = mappings
        .into_iter()
        .fold(value, |value, (from, to)| value.replace(from, to));

    format!("{key}={escaped}")
}

fn parameters(parameters: Vec<String>) -> String {
    let params_len = parameters.len();
    parameters
        .into_iter()
        .enumerate()
        .map(|(index, param)| {
            if index == params_len - 1 {
                trailing(param)
            } else {
                param
            }
        })
        .join(" ")
}

fn trailing(parameter: String) -> String {
    if parameter.contains(' ') || parameter.is_empty() || parameter.starts_with(':') {
        format!(":{parameter}")
    } else {
        parameter
    }
}

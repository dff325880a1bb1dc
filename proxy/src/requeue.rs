//! Client commands waiting for data the upstream has not delivered yet.

use std::collections::VecDeque;

use irc::proto;

use crate::client;

/// Attempts after which an unanswerable command is dropped.
pub const MAX_RETRIES: i32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub client: client::Id,
    pub message: proto::Message,
    pub retries: i32,
}

#[derive(Debug, Default)]
pub struct Queue {
    lines: VecDeque<Line>,
}

impl Queue {
    pub fn push(&mut self, client: client::Id, message: proto::Message, retries: i32) {
        log::trace!("requeue [{client}] {} (retries: {retries})", message.command.command());

        self.lines.push_back(Line {
            client,
            message,
            retries,
        });
    }

    /// Takes every queued line. Lines pushed while processing the drained
    /// batch wait for the next drain.
    pub fn drain(&mut self) -> Vec<Line> {
        self.lines.drain(..).collect()
    }

    pub fn remove_client(&mut self, client: client::Id) {
        self.lines.retain(|line| line.client != client);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

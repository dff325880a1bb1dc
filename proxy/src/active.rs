//! Channels each lazy client has opted into.

use std::collections::{HashMap, HashSet};

use crate::client;

#[derive(Debug, Default)]
pub struct Tracker {
    channels: HashMap<client::Id, HashSet<String>>,
}

impl Tracker {
    /// Returns `false` if the channel was already active.
    pub fn activate(&mut self, client: client::Id, channel: &str) -> bool {
        self.channels
            .entry(client)
            .or_default()
            .insert(channel.to_lowercase())
    }

    /// Removes the channel from one client, or from every client.
    pub fn deactivate(&mut self, client: Option<client::Id>, channel: &str) {
        let channel = channel.to_lowercase();

        match client {
            Some(client) => {
                if let Some(channels) = self.channels.get_mut(&client) {
                    channels.remove(&channel);
                }
            }
            None => {
                for channels in self.channels.values_mut() {
                    channels.remove(&channel);
                }
            }
        }
    }

    pub fn is_active(&self, client: client::Id, channel: &str) -> bool {
        self.channels
            .get(&client)
            .is_some_and(|channels| channels.contains(&channel.to_lowercase()))
    }

    pub fn remove_client(&mut self, client: client::Id) {
        self.channels.remove(&client);
    }

    pub fn channels(&self, client: client::Id) -> impl Iterator<Item = &str> {
        self.channels
            .get(&client)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

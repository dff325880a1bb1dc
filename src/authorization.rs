use std::collections::BTreeMap;

use fancy_regex::Regex;
use proxy::client::Client;
use proxy::{Authorization, config};

/// Channel whitelists and highlight patterns of an account's subclients.
#[derive(Debug)]
pub struct Whitelist {
    default: Rules,
    subclients: BTreeMap<String, Rules>,
}

#[derive(Debug)]
struct Rules {
    /// Lowercased, empty allows every channel
    channels: Vec<String>,
    highlights: Vec<Regex>,
}

impl Rules {
    fn new(subclient: &config::Subclient) -> Self {
        let highlights = subclient
            .highlights
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    log::warn!("ignoring highlight {pattern:?}: {error}");
                    None
                }
            })
            .collect();

        Self {
            channels: subclient
                .channels
                .iter()
                .map(|channel| channel.to_lowercase())
                .collect(),
            highlights,
        }
    }
}

impl Whitelist {
    pub fn new(config: &config::Account) -> Self {
        Self {
            default: Rules::new(&config.subclient(None)),
            subclients: config
                .subclients
                .iter()
                .map(|(name, subclient)| (name.clone(), Rules::new(subclient)))
                .collect(),
        }
    }

    fn rules(&self, client: &Client) -> &Rules {
        client
            .subclient()
            .and_then(|name| self.subclients.get(name))
            .unwrap_or(&self.default)
    }
}

impl Authorization for Whitelist {
    fn is_channel_whitelisted(&self, client: &Client, channel: &str) -> bool {
        let rules = self.rules(client);

        rules.channels.is_empty() || rules.channels.contains(&channel.to_lowercase())
    }

    fn is_highlight_match(&self, client: &Client, text: &str) -> bool {
        self.rules(client)
            .highlights
            .iter()
            .any(|regex| regex.is_match(text).unwrap_or(false))
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use futures::channel::mpsc;
    use proxy::client;

    use super::*;

    fn client(subclient: Option<&str>) -> Client {
        let (sender, _receiver) = mpsc::unbounded();

        Client::new(
            client::Id::from(1),
            "alice".into(),
            subclient.map(String::from),
            true,
            HashSet::new(),
            sender,
        )
    }

    fn whitelist() -> Whitelist {
        let config = config::Config::parse(
            r##"
            [accounts.alice]
            password = "hunter2"
            nickname = "alice"

            [accounts.alice.subclients.Phone]
            autoburst = false
            channels = ["#Rust"]
            highlights = ["alice", "(?i)rust(acean)?", "(unbalanced"]
            "##,
        )
        .unwrap();

        Whitelist::new(config.account("alice").unwrap())
    }

    #[test]
    fn channels() {
        let whitelist = whitelist();

        let phone = client(Some("phone"));
        assert!(whitelist.is_channel_whitelisted(&phone, "#rust"));
        assert!(!whitelist.is_channel_whitelisted(&phone, "#random"));

        let desktop = client(None);
        assert!(whitelist.is_channel_whitelisted(&desktop, "#random"));

        let unknown = client(Some("tablet"));
        assert!(whitelist.is_channel_whitelisted(&unknown, "#random"));
    }

    #[test]
    fn highlights() {
        let whitelist = whitelist();

        let phone = client(Some("phone"));
        assert!(whitelist.is_highlight_match(&phone, "hey alice"));
        assert!(whitelist.is_highlight_match(&phone, "any RUSTACEANS here?"));
        assert!(!whitelist.is_highlight_match(&phone, "nothing to see"));

        assert!(!whitelist.is_highlight_match(&client(None), "hey alice"));
    }
}

use std::collections::{BTreeMap, HashMap};

use irc::proto::User;

use crate::isupport::Isupport;
use crate::mode::{self, Mode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub content: Option<String>,
    pub who: Option<String>,
    pub time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user: User,
    /// Prefix mode chars, highest rank first
    pub modes: Vec<char>,
    pub account: Option<String>,
}

impl Member {
    pub fn new(user: User) -> Self {
        Self {
            user,
            modes: vec![],
            account: None,
        }
    }

    /// Entry of a NAMES reply, `multi_prefix` keeps every prefix and
    /// `userhost` writes the full mask when it is known.
    pub fn names_entry(&self, isupport: &Isupport, multi_prefix: bool, userhost: bool) -> String {
        let prefixes = self
            .modes
            .iter()
            .filter_map(|mode| isupport.prefix_for_mode(*mode))
            .take(if multi_prefix { usize::MAX } else { 1 })
            .collect::<String>();

        if userhost {
            format!("{prefixes}{}", self.user)
        } else {
            format!("{prefixes}{}", self.user.nickname)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub mask: String,
    pub setter: Option<String>,
    pub time: Option<String>,
}

/// Cached entries of one list mode.
#[derive(Debug, Clone, Default)]
pub struct List {
    entries: Vec<ListEntry>,
    received: bool,
    receiving: bool,
}

impl List {
    /// Whether the full list has been received from the server at least once.
    pub fn is_received(&self) -> bool {
        self.received
    }

    pub fn entries(&self) -> &[ListEntry] {
        &self.entries
    }

    /// A list item arrived. The first item of a reply replaces the cache.
    pub fn item(&mut self, entry: ListEntry) {
        if !self.receiving {
            self.entries.clear();
            self.receiving = true;
        }

        self.entries.push(entry);
    }

    pub fn end(&mut self) {
        if !self.receiving {
            self.entries.clear();
        }

        self.receiving = false;
        self.received = true;
    }

    pub fn add(&mut self, entry: ListEntry) {
        if !self
            .entries
            .iter()
            .any(|existing| existing.mask.eq_ignore_ascii_case(&entry.mask))
        {
            self.entries.push(entry);
        }
    }

    pub fn remove(&mut self, mask: &str) {
        self.entries
            .retain(|entry| !entry.mask.eq_ignore_ascii_case(mask));
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    pub topic: Topic,
    members: BTreeMap<String, Member>,
    modes: BTreeMap<char, Option<String>>,
    pub created: Option<String>,
    lists: HashMap<char, List>,
    joined: bool,
    names_complete: bool,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: Topic::default(),
            members: BTreeMap::new(),
            modes: BTreeMap::new(),
            created: None,
            lists: HashMap::new(),
            joined: false,
            names_complete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The initial NAMES reply after our own JOIN has completed.
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, nickname: &str) -> Option<&Member> {
        self.members.get(&nickname.to_lowercase())
    }

    pub fn member_mut(&mut self, nickname: &str) -> Option<&mut Member> {
        self.members.get_mut(&nickname.to_lowercase())
    }

    pub fn add_member(&mut self, member: Member) {
        self.members
            .insert(member.user.nickname.to_lowercase(), member);
    }

    pub fn remove_member(&mut self, nickname: &str) -> Option<Member> {
        self.members.remove(&nickname.to_lowercase())
    }

    pub fn rename_member(&mut self, old: &str, new: &str) -> bool {
        match self.members.remove(&old.to_lowercase()) {
            Some(mut member) => {
                member.user.nickname = new.to_string();
                self.add_member(member);
                true
            }
            None => false,
        }
    }

    /// Adds the entries of a `353` line. A reply arriving after a completed
    /// one rebuilds the member list.
    pub fn names(&mut self, entries: &str, isupport: &Isupport) {
        if self.names_complete {
            self.members.clear();
            self.names_complete = false;
        }

        for entry in entries.split_whitespace() {
            let nick = entry.trim_start_matches(|c: char| isupport.mode_for_prefix(c).is_some());
            let mut modes = entry[..entry.len() - nick.len()]
                .chars()
                .filter_map(|c| isupport.mode_for_prefix(c))
                .collect::<Vec<_>>();
            modes.sort_by_key(|mode| isupport.rank(*mode));

            let user = parse_user(nick);

            self.add_member(Member {
                user,
                modes,
                account: None,
            });
        }
    }

    /// `366` arrived. Returns true the first time after joining.
    pub fn end_of_names(&mut self) -> bool {
        self.names_complete = true;

        if self.joined {
            false
        } else {
            self.joined = true;
            true
        }
    }

    pub fn list(&self, mode: char) -> Option<&List> {
        self.lists.get(&mode)
    }

    pub fn list_mut(&mut self, mode: char) -> &mut List {
        self.lists.entry(mode).or_default()
    }

    /// Mode string with arguments, as sent in `324`.
    pub fn mode_string(&self) -> Vec<String> {
        let chars = self.modes.keys().collect::<String>();
        let args = self.modes.values().flatten().cloned();

        std::iter::once(format!("+{chars}")).chain(args).collect()
    }

    /// Replaces the simple modes from a `324` reply.
    pub fn set_modes(&mut self, modes: &str, args: &[String], isupport: &Isupport) {
        self.modes.clear();

        let modes = if modes.starts_with(['+', '-']) {
            modes.to_string()
        } else {
            format!("+{modes}")
        };

        for mode in mode::parse(&modes, args, |c| isupport.mode_kind(c)) {
            if let Mode::Add(c, arg) = mode {
                self.modes.insert(c, arg);
            }
        }
    }

    /// Applies a live MODE change.
    pub fn apply_modes(&mut self, modes: &[Mode], setter: &str, time: &str, isupport: &Isupport) {
        for mode in modes {
            let c = mode.value();

            if isupport.is_prefix_mode(c) {
                let Some(member) = mode.arg().and_then(|nick| self.member_mut(nick)) else {
                    continue;
                };

                match mode {
                    Mode::Add(..) => {
                        if !member.modes.contains(&c) {
                            member.modes.push(c);
                            member.modes.sort_by_key(|mode| isupport.rank(*mode));
                        }
                    }
                    Mode::Remove(..) => member.modes.retain(|mode| *mode != c),
                    Mode::NoPrefix(_) => {}
                }
            } else if isupport.mode_kind(c) == mode::Kind::List {
                let Some(mask) = mode.arg() else {
                    continue;
                };

                match mode {
                    Mode::Add(..) => self.list_mut(c).add(ListEntry {
                        mask: mask.to_string(),
                        setter: Some(setter.to_string()),
                        time: Some(time.to_string()),
                    }),
                    Mode::Remove(..) => self.list_mut(c).remove(mask),
                    Mode::NoPrefix(_) => {}
                }
            } else {
                match mode {
                    Mode::Add(c, arg) => {
                        self.modes.insert(*c, arg.clone());
                    }
                    Mode::Remove(c, _) => {
                        self.modes.remove(c);
                    }
                    Mode::NoPrefix(_) => {}
                }
            }
        }
    }

    /// `=` public, `@` secret, `*` private.
    pub fn symbol(&self) -> &'static str {
        if self.modes.contains_key(&'s') {
            "@"
        } else if self.modes.contains_key(&'p') {
            "*"
        } else {
            "="
        }
    }
}

/// `nick`, or `nick!user@host` as sent with userhost-in-names.
pub fn parse_user(entry: &str) -> User {
    let (nickname, rest) = entry.split_once('!').unwrap_or((entry, ""));
    let (username, hostname) = rest.split_once('@').unwrap_or((rest, ""));

    User {
        nickname: nickname.to_string(),
        username: (!username.is_empty()).then(|| username.to_string()),
        hostname: (!hostname.is_empty()).then(|| hostname.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn isupport() -> Isupport {
        let mut isupport = Isupport::default();
        isupport.apply("PREFIX=(qov)~@+".parse().unwrap());
        isupport
    }

    #[test]
    fn names() {
        let isupport = isupport();
        let mut channel = Channel::new("#rust");

        channel.names("@+alice bob!b@host ~carol", &isupport);
        assert!(channel.end_of_names());
        assert!(!channel.end_of_names());

        let alice = channel.member("ALICE").unwrap();
        assert_eq!(alice.modes, vec!['o', 'v']);
        assert_eq!(alice.names_entry(&isupport, false, false), "@alice");
        assert_eq!(alice.names_entry(&isupport, true, false), "@+alice");

        let bob = channel.member("bob").unwrap();
        assert_eq!(bob.names_entry(&isupport, true, true), "bob!b@host");

        // a later reply rebuilds the list
        channel.names("dave", &isupport);
        assert_eq!(channel.members().count(), 1);
    }

    #[test]
    fn live_modes() {
        let isupport = isupport();
        let mut channel = Channel::new("#rust");
        channel.names("alice", &isupport);

        let modes = mode::parse(
            "+ob-t+kl",
            &["alice".into(), "*!*@spam".into(), "key".into(), "5".into()],
            |c| isupport.mode_kind(c),
        );
        channel.set_modes("+nt", &[], &isupport);
        channel.apply_modes(&modes, "op!o@host", "1700000000", &isupport);

        assert_eq!(channel.member("alice").unwrap().modes, vec!['o']);
        assert_eq!(channel.list('b').unwrap().entries()[0].mask, "*!*@spam");
        assert!(!channel.list('b').unwrap().is_received());
        assert_eq!(channel.mode_string(), vec!["+kln", "key", "5"]);
    }

    #[test]
    fn list_replies_replace_cache() {
        let mut list = List::default();

        list.add(ListEntry {
            mask: "stale".into(),
            setter: None,
            time: None,
        });
        list.item(ListEntry {
            mask: "a".into(),
            setter: None,
            time: None,
        });
        list.item(ListEntry {
            mask: "b".into(),
            setter: None,
            time: None,
        });
        list.end();

        assert!(list.is_received());
        assert_eq!(list.entries().len(), 2);

        // an empty reply clears it
        list.end();
        assert!(list.entries().is_empty());
    }
}

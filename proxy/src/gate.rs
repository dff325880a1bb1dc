//! One-shot allowances for upstream replies.
//!
//! Replies the proxy can answer from its own state are suppressed unless a
//! client explicitly asked upstream for them. An allowance lets the next
//! matching numeric through for its scope and is consumed by the numeric
//! that ends the reply.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::listmode;

pub const RPL_UMODEIS: u16 = 221;
pub const RPL_CHANNELMODEIS: u16 = 324;
pub const RPL_CREATIONTIME: u16 = 329;
pub const RPL_NOTOPIC: u16 = 331;
pub const RPL_TOPIC: u16 = 332;
pub const RPL_TOPICWHOTIME: u16 = 333;
pub const RPL_NAMREPLY: u16 = 353;
pub const RPL_ENDOFNAMES: u16 = 366;
pub const ERR_NICKNAMEINUSE: u16 = 433;

pub const TOPIC_REPLIES: [u16; 3] = [RPL_NOTOPIC, RPL_TOPIC, RPL_TOPICWHOTIME];
pub const NAMES_REPLIES: [u16; 2] = [RPL_NAMREPLY, RPL_ENDOFNAMES];
pub const MODE_REPLIES: [u16; 2] = [RPL_CHANNELMODEIS, RPL_CREATIONTIME];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Channel(String),
}

impl Scope {
    pub fn channel(name: &str) -> Self {
        Scope::Channel(name.to_lowercase())
    }
}

#[derive(Debug, Default)]
pub struct Gate {
    tokens: HashMap<Scope, HashSet<u16>>,
    standing: HashSet<(Scope, u16)>,
    /// Reply allowed only as the very next numeric after an admitted one.
    trailing: Option<(Scope, u16)>,
}

impl Gate {
    pub fn allow(&mut self, scope: Scope, numeric: u16) {
        self.tokens.entry(scope).or_default().insert(numeric);
    }

    /// Allowance that is never consumed.
    pub fn allow_standing(&mut self, scope: Scope, numeric: u16) {
        self.standing.insert((scope, numeric));
    }

    pub fn is_allowed(&self, scope: &Scope, numeric: u16) -> bool {
        self.standing.contains(&(scope.clone(), numeric))
            || self
                .tokens
                .get(scope)
                .is_some_and(|tokens| tokens.contains(&numeric))
    }

    /// Checks the channel scope, then the global scope. On a match the
    /// `disarms` tokens of the matching scope are consumed.
    pub fn admit(&mut self, channel: Option<&str>, numeric: u16, disarms: &[u16]) -> bool {
        let trailing = self.trailing.take();
        let scopes = channel
            .map(Scope::channel)
            .into_iter()
            .chain(Some(Scope::Global))
            .collect::<Vec<_>>();

        if trailing.is_some_and(|(scope, expected)| expected == numeric && scopes.contains(&scope)) {
            return true;
        }

        for scope in scopes {
            if self.is_allowed(&scope, numeric) {
                self.disarm(&scope, disarms);
                self.trailing = follow_up(numeric).map(|next| (scope, next));
                return true;
            }
        }

        false
    }

    /// Called for numerics that never reach [`Gate::admit`], so a trailing
    /// allowance cannot outlive the reply it belongs to.
    pub fn interrupt(&mut self) {
        self.trailing = None;
    }

    pub fn disarm(&mut self, scope: &Scope, numerics: &[u16]) {
        if let Some(tokens) = self.tokens.get_mut(scope) {
            for numeric in numerics {
                tokens.remove(numeric);
            }

            if tokens.is_empty() {
                self.tokens.remove(scope);
            }
        }
    }

    /// Drops every one-shot allowance of a scope.
    pub fn clear(&mut self, scope: &Scope) {
        self.tokens.remove(scope);
    }

    pub fn tokens(&self, scope: &Scope) -> BTreeSet<u16> {
        self.tokens
            .get(scope)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Whether replies with this numeric are subject to the gate at all.
pub fn is_gated(numeric: u16, lists: &listmode::Table) -> bool {
    matches!(
        numeric,
        RPL_UMODEIS
            | RPL_CHANNELMODEIS
            | RPL_CREATIONTIME
            | RPL_NOTOPIC
            | RPL_TOPIC
            | RPL_TOPICWHOTIME
            | RPL_NAMREPLY
            | RPL_ENDOFNAMES
            | ERR_NICKNAMEINUSE
    ) || lists.by_item(numeric).is_some()
        || lists.by_end(numeric).is_some()
}

/// Allowances consumed when `numeric` is let through.
pub fn companions(numeric: u16, lists: &listmode::Table) -> Vec<u16> {
    match numeric {
        RPL_NOTOPIC => TOPIC_REPLIES.to_vec(),
        RPL_TOPIC => vec![RPL_NOTOPIC, RPL_TOPIC],
        RPL_TOPICWHOTIME => TOPIC_REPLIES.to_vec(),
        RPL_ENDOFNAMES => NAMES_REPLIES.to_vec(),
        // More lines may follow
        RPL_NAMREPLY => vec![],
        // 329 is optional, so 324 consumes both and leaves a trailing slot
        RPL_CHANNELMODEIS | RPL_CREATIONTIME => MODE_REPLIES.to_vec(),
        RPL_UMODEIS | ERR_NICKNAMEINUSE => vec![numeric],
        _ => match lists.by_end(numeric) {
            Some(list) => vec![list.end, list.item],
            None => vec![],
        },
    }
}

/// Reply that may directly follow an admitted `numeric`.
fn follow_up(numeric: u16) -> Option<u16> {
    (numeric == RPL_CHANNELMODEIS).then_some(RPL_CREATIONTIME)
}

/// Allowances a forced list query needs, one pair per list.
pub fn list_replies(list: &listmode::ListMode) -> [u16; 2] {
    [list.item, list.end]
}

//! Which numerics carry the entries of each list mode.
//!
//! Servers disagree on the numbers, and on some families one mode is served
//! by another mode's list, so the mapping is selected by the server family
//! detected from the `004` version string.

/// Server software family, detected from `RPL_MYINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Generic,
    /// hyperion (dancer)
    Hyperion,
    /// ircd-seven, charybdis, solanum
    Seven,
    Inspircd,
    Unreal,
    Ircnet,
}

impl Family {
    pub fn detect(version: &str) -> Self {
        let version = version.to_lowercase();

        if version.contains("hyperion") {
            Family::Hyperion
        } else if ["ircd-seven", "charybdis", "solanum"]
            .iter()
            .any(|name| version.contains(name))
        {
            Family::Seven
        } else if version.contains("inspircd") {
            Family::Inspircd
        } else if version.contains("unreal") {
            Family::Unreal
        } else if version.starts_with("2.11") {
            Family::Ircnet
        } else {
            Family::Generic
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListMode {
    pub mode: char,
    /// Mode char whose list actually holds the entries
    pub list: char,
    pub item: u16,
    pub end: u16,
    pub name: &'static str,
}

impl ListMode {
    const fn new(mode: char, item: u16, end: u16, name: &'static str) -> Self {
        Self {
            mode,
            list: mode,
            item,
            end,
            name,
        }
    }

    const fn alias(mode: char, of: ListMode) -> Self {
        Self {
            mode,
            list: of.list,
            item: of.item,
            end: of.end,
            name: of.name,
        }
    }

    /// The end numeric comes before the item numeric on these lists.
    pub fn is_backwards(&self) -> bool {
        self.end < self.item
    }

    pub fn is_alias(&self) -> bool {
        self.mode != self.list
    }

    /// Quiet list replies repeat the mode char before the mask.
    pub fn has_mode_parameter(&self) -> bool {
        self.item == QUIET.item
    }

    pub fn end_text(&self) -> String {
        format!("End of Channel {} List", self.name)
    }
}

const BAN: ListMode = ListMode::new('b', 367, 368, "Ban");
const EXCEPTION: ListMode = ListMode::new('e', 348, 349, "Exception");
const INVITE: ListMode = ListMode::new('I', 346, 347, "Invite");
const OWNER: ListMode = ListMode::new('q', 386, 387, "Owner");
const PROTECTED: ListMode = ListMode::new('a', 388, 389, "Protected");
const REOP: ListMode = ListMode::new('R', 344, 345, "Reop");
const QUIET: ListMode = ListMode::new('q', 728, 729, "Quiet");
const ACCESS: ListMode = ListMode::new('w', 910, 911, "Access");
const EXEMPT: ListMode = ListMode::new('X', 954, 953, "Exempt");
const SPAMFILTER: ListMode = ListMode::new('g', 941, 940, "Spamfilter");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    modes: Vec<ListMode>,
}

impl Default for Table {
    fn default() -> Self {
        Self::for_family(Family::Generic)
    }
}

impl Table {
    pub fn for_family(family: Family) -> Self {
        let mut modes = vec![BAN, EXCEPTION, INVITE];

        match family {
            Family::Generic => {}
            Family::Hyperion => modes.push(ListMode::alias('q', BAN)),
            Family::Seven => modes.push(QUIET),
            Family::Inspircd => modes.extend([ACCESS, EXEMPT, SPAMFILTER]),
            Family::Unreal => modes.extend([OWNER, PROTECTED]),
            Family::Ircnet => modes.push(REOP),
        }

        Self { modes }
    }

    pub fn get(&self, mode: char) -> Option<&ListMode> {
        self.modes.iter().find(|list| list.mode == mode)
    }

    /// The list whose entries arrive on this item numeric.
    pub fn by_item(&self, numeric: u16) -> Option<&ListMode> {
        self.modes
            .iter()
            .find(|list| list.item == numeric && !list.is_alias())
    }

    /// The list terminated by this end numeric.
    pub fn by_end(&self, numeric: u16) -> Option<&ListMode> {
        self.modes
            .iter()
            .find(|list| list.end == numeric && !list.is_alias())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListMode> {
        self.modes.iter()
    }

    /// Lists that own their entries, skipping aliases.
    pub fn lists(&self) -> impl Iterator<Item = &ListMode> {
        self.modes.iter().filter(|list| !list.is_alias())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detect() {
        let tests = [
            ("hyperion-1.0.2b", Family::Hyperion),
            ("ircd-seven-1.1.9", Family::Seven),
            ("solanum-1.0-dev", Family::Seven),
            ("InspIRCd-3", Family::Inspircd),
            ("UnrealIRCd-6.1.0", Family::Unreal),
            ("2.11.2p3", Family::Ircnet),
            ("ergo-v2.11.0", Family::Generic),
        ];

        for (version, expected) in tests {
            assert_eq!(Family::detect(version), expected, "{version}");
        }
    }

    #[test]
    fn families() {
        let generic = Table::for_family(Family::Generic);
        assert_eq!(generic.get('b').map(|list| (list.item, list.end)), Some((367, 368)));
        assert_eq!(generic.get('q'), None);

        let seven = Table::for_family(Family::Seven);
        assert_eq!(seven.get('q').map(|list| (list.item, list.end)), Some((728, 729)));

        let unreal = Table::for_family(Family::Unreal);
        assert_eq!(unreal.get('q').map(|list| list.name), Some("Owner"));
        assert_eq!(unreal.get('a').map(|list| list.item), Some(388));

        let ircnet = Table::for_family(Family::Ircnet);
        assert_eq!(ircnet.get('R').map(|list| list.end), Some(345));
    }

    #[test]
    fn hyperion_quiet_is_ban() {
        let table = Table::for_family(Family::Hyperion);
        let quiet = table.get('q').unwrap();

        assert!(quiet.is_alias());
        assert_eq!(quiet.list, 'b');
        assert_eq!(table.by_item(367).map(|list| list.mode), Some('b'));
        assert_eq!(table.lists().count(), 3);
    }

    #[test]
    fn backwards() {
        let table = Table::for_family(Family::Inspircd);

        let spamfilter = table.by_end(940).unwrap();
        assert_eq!(spamfilter.mode, 'g');
        assert!(spamfilter.is_backwards());

        let exempt = table.by_item(954).unwrap();
        assert_eq!(exempt.mode, 'X');
        assert!(exempt.is_backwards());

        assert!(!table.get('w').unwrap().is_backwards());
    }
}

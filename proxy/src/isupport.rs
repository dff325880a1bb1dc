use std::str::FromStr;

use crate::mode;

// Utilized ISUPPORT parameters have a Parameter variant, the rest are kept
// as Unknown so the raw 005 lines can still be replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Add(Parameter),
    Remove(String),
}

impl FromStr for Operation {
    type Err = &'static str;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        if token.is_empty() {
            return Err("empty ISUPPORT token not allowed");
        }

        if let Some(parameter) = token.strip_prefix('-') {
            return Ok(Operation::Remove(parameter.to_string()));
        }

        let (parameter, value) = token.split_once('=').unwrap_or((token, ""));

        match parameter {
            "CHANMODES" => {
                let mut groups = value.split(',').map(String::from);

                let chanmodes = mode::ChanModes {
                    list: groups.next().unwrap_or_default(),
                    always: groups.next().unwrap_or_default(),
                    on_set: groups.next().unwrap_or_default(),
                    never: groups.next().unwrap_or_default(),
                };

                if chanmodes.is_empty() {
                    Err("no valid channel modes")
                } else {
                    Ok(Operation::Add(Parameter::CHANMODES(chanmodes)))
                }
            }
            "CHANTYPES" => Ok(Operation::Add(Parameter::CHANTYPES(value.to_string()))),
            "NETWORK" if !value.is_empty() => {
                Ok(Operation::Add(Parameter::NETWORK(value.to_string())))
            }
            "NETWORK" => Err("value required"),
            "PREFIX" => {
                if value.is_empty() {
                    return Ok(Operation::Add(Parameter::PREFIX(vec![])));
                }

                let (modes, prefixes) = value
                    .strip_prefix('(')
                    .and_then(|value| value.split_once(')'))
                    .ok_or("invalid PREFIX format")?;

                if modes.chars().count() != prefixes.chars().count() {
                    return Err("PREFIX modes and prefixes differ in length");
                }

                Ok(Operation::Add(Parameter::PREFIX(
                    modes
                        .chars()
                        .zip(prefixes.chars())
                        .map(|(mode, prefix)| PrefixMap { mode, prefix })
                        .collect(),
                )))
            }
            _ => Ok(Operation::Add(Parameter::Unknown(token.to_string()))),
        }
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    CHANMODES(mode::ChanModes),
    CHANTYPES(String),
    NETWORK(String),
    PREFIX(Vec<PrefixMap>),
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMap {
    pub mode: char,
    pub prefix: char,
}

/// The subset of server support information the proxy relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isupport {
    pub chanmodes: mode::ChanModes,
    pub chantypes: String,
    pub network: Option<String>,
    /// Highest rank first
    pub prefix: Vec<PrefixMap>,
}

impl Default for Isupport {
    fn default() -> Self {
        Self {
            chanmodes: mode::ChanModes::default(),
            chantypes: "#&".to_string(),
            network: None,
            prefix: vec![
                PrefixMap {
                    mode: 'o',
                    prefix: '@',
                },
                PrefixMap {
                    mode: 'v',
                    prefix: '+',
                },
            ],
        }
    }
}

impl Isupport {
    pub fn apply(&mut self, operation: Operation) {
        match operation {
            Operation::Add(Parameter::CHANMODES(chanmodes)) => self.chanmodes = chanmodes,
            Operation::Add(Parameter::CHANTYPES(chantypes)) => self.chantypes = chantypes,
            Operation::Add(Parameter::NETWORK(network)) => self.network = Some(network),
            Operation::Add(Parameter::PREFIX(prefix)) => self.prefix = prefix,
            Operation::Add(Parameter::Unknown(_)) => {}
            Operation::Remove(parameter) => match parameter.as_str() {
                "CHANMODES" => self.chanmodes = mode::ChanModes::default(),
                "CHANTYPES" => self.chantypes = Isupport::default().chantypes,
                "NETWORK" => self.network = None,
                "PREFIX" => self.prefix = Isupport::default().prefix,
                _ => {}
            },
        }
    }

    pub fn is_channel(&self, target: &str) -> bool {
        target
            .chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }

    pub fn prefix_for_mode(&self, mode: char) -> Option<char> {
        self.prefix
            .iter()
            .find(|map| map.mode == mode)
            .map(|map| map.prefix)
    }

    pub fn mode_for_prefix(&self, prefix: char) -> Option<char> {
        self.prefix
            .iter()
            .find(|map| map.prefix == prefix)
            .map(|map| map.mode)
    }

    pub fn is_prefix_mode(&self, mode: char) -> bool {
        self.prefix_for_mode(mode).is_some()
    }

    /// Rank of a prefix mode, 0 being the highest.
    pub fn rank(&self, mode: char) -> usize {
        self.prefix
            .iter()
            .position(|map| map.mode == mode)
            .unwrap_or(usize::MAX)
    }

    pub fn mode_kind(&self, mode: char) -> mode::Kind {
        if self.is_prefix_mode(mode) {
            mode::Kind::Always
        } else {
            self.chanmodes.kind(mode)
        }
    }
}

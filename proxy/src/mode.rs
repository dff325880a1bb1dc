#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Add(char, Option<String>),
    Remove(char, Option<String>),
    NoPrefix(char),
}

impl Mode {
    pub fn value(&self) -> char {
        match self {
            Mode::Add(value, _) => *value,
            Mode::Remove(value, _) => *value,
            Mode::NoPrefix(value) => *value,
        }
    }

    pub fn arg(&self) -> Option<&str> {
        match self {
            Mode::Add(_, arg) => arg.as_deref(),
            Mode::Remove(_, arg) => arg.as_deref(),
            Mode::NoPrefix(_) => None,
        }
    }
}

/// Argument behaviour of a channel mode, see `CHANMODES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Type A, an address list. Takes an argument when set or unset.
    List,
    /// Type B, always takes an argument.
    Always,
    /// Type C, takes an argument when set.
    OnSet,
    /// Type D, never takes an argument.
    Never,
}

impl Kind {
    fn takes_arg(self, adding: bool) -> bool {
        match self {
            Kind::List | Kind::Always => true,
            Kind::OnSet => adding,
            Kind::Never => false,
        }
    }
}

// Reference: https://modern.ircdocs.horse/#chanmodes-parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChanModes {
    pub list: String,
    pub always: String,
    pub on_set: String,
    pub never: String,
}

impl Default for ChanModes {
    fn default() -> Self {
        Self {
            list: "beI".to_string(),
            always: "k".to_string(),
            on_set: "l".to_string(),
            never: "imnpst".to_string(),
        }
    }
}

impl ChanModes {
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
            && self.always.is_empty()
            && self.on_set.is_empty()
            && self.never.is_empty()
    }

    pub fn kind(&self, mode: char) -> Kind {
        if self.list.contains(mode) {
            Kind::List
        } else if self.always.contains(mode) {
            Kind::Always
        } else if self.on_set.contains(mode) {
            Kind::OnSet
        } else {
            Kind::Never
        }
    }
}

/// Splits a mode string into its modes in order, pairing arguments
/// according to `kind`.
pub fn parse(encoded: &str, args: &[String], kind: impl Fn(char) -> Kind) -> Vec<Mode> {
    let mut args = args.iter();
    let mut parsed = vec![];
    let mut adding = None;

    for c in encoded.chars() {
        match c {
            '+' => adding = Some(true),
            '-' => adding = Some(false),
            _ => {
                let mode = match adding {
                    Some(adding) => {
                        let arg = if kind(c).takes_arg(adding) {
                            args.next().cloned()
                        } else {
                            None
                        };

                        if adding {
                            Mode::Add(c, arg)
                        } else {
                            Mode::Remove(c, arg)
                        }
                    }
                    None => Mode::NoPrefix(c),
                };

                parsed.push(mode);
            }
        }
    }

    parsed
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel() {
        let chanmodes = ChanModes::default();
        let kind = |c| chanmodes.kind(c);

        let tests = [
            ("+r", vec![], vec![Mode::Add('r', None)]),
            (
                "-rb+il",
                vec!["*@192.168.0.1".into(), "10".into()],
                vec![
                    Mode::Remove('r', None),
                    Mode::Remove('b', Some("*@192.168.0.1".into())),
                    Mode::Add('i', None),
                    Mode::Add('l', Some("10".into())),
                ],
            ),
            ("-l", vec![], vec![Mode::Remove('l', None)]),
            ("bI", vec![], vec![Mode::NoPrefix('b'), Mode::NoPrefix('I')]),
        ];

        for (modes, args, expected) in tests {
            assert_eq!(parse(modes, &args, kind), expected, "{modes}");
        }
    }

    #[test]
    fn missing_args() {
        let chanmodes = ChanModes::default();

        let modes = parse("+kb", &["key".into()], |c| chanmodes.kind(c));

        assert_eq!(
            modes,
            vec![Mode::Add('k', Some("key".into())), Mode::Add('b', None)]
        );
        assert_eq!(modes[0].arg(), Some("key"));
        assert_eq!(modes[1].value(), 'b');
    }
}

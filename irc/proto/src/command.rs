#[allow(non_camel_case_types)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /* Connection Messages */
    /// [*] <subcommand> [*] [<param>]
    CAP(Option<String>, String, Option<String>, Option<String>),
    /// <password>
    PASS(String),
    /// <nickname>
    NICK(String),
    /// <username> <realname>
    USER(String, String),
    /// <token>
    PING(String),
    /// [<server>] <token>
    PONG(String, Option<String>),
    /// [<reason>]
    QUIT(Option<String>),
    /// <reason>
    ERROR(String),

    /* Channel Operations */
    /// <channel>{,<channel>} [<key>{,<key>}] (send)
    /// <channel> [<accountname> <realname>] (receive [extended-join])
    JOIN(String, Option<String>, Option<String>),
    /// <channel>{,<channel>} [<reason>]
    PART(String, Option<String>),
    /// <channel> [<topic>]
    TOPIC(String, Option<String>),
    /// <channel>{,<channel>}
    NAMES(String),
    /// <channel> <user> [<comment>]
    KICK(String, String, Option<String>),
    /// <target> [<modestring> [<mode arguments>...]]
    MODE(String, Option<String>, Option<Vec<String>>),

    /* Sending Messages */
    /// <target>{,<target>} <text to be sent>
    PRIVMSG(String, String),
    /// <target>{,<target>} <text to be sent>
    NOTICE(String, String),

    /* Optional Messages */
    /// [<text>]
    AWAY(Option<String>),

    /* IRC extensions */
    /// <accountname>
    ACCOUNT(String),
    /// <reference> [<type> [<params>]]
    BATCH(String, Vec<String>),
    /// <new_username> <new_hostname>
    CHGHOST(String, String),

    Numeric(Numeric, Vec<String>),
    Unknown(String, Vec<String>),
    Raw(String),
}

impl Command {
    pub fn new(tag: &str, parameters: Vec<String>) -> Self {
        use Command::*;

        if let Ok(num) = tag.parse::<u16>() {
            return match self::Numeric::try_from(num) {
                Ok(numeric) => Numeric(numeric, parameters),
                Err(_) => Unknown(format!("{num:03}"), parameters),
            };
        }

        let tag = tag.to_uppercase();
        let len = parameters.len();

        let mut params = parameters.into_iter();

        // Guarded by the length checks on each arm
        macro_rules! req {
            () => {
                params.next().unwrap_or_default()
            };
        }
        macro_rules! opt {
            () => {
                params.next()
            };
        }

        match tag.as_str() {
            "CAP" if len > 0 => {
                let a = req!();
                match opt!() {
                    Some(b) => CAP(Some(a), b, opt!(), opt!()),
                    None => CAP(None, a, None, None),
                }
            }
            "PASS" if len > 0 => PASS(req!()),
            "NICK" if len > 0 => NICK(req!()),
            // USER <username> <mode> <unused> <realname>
            "USER" if len > 1 => USER(req!(), params.last().unwrap_or_default()),
            "PING" if len > 0 => PING(req!()),
            "PONG" if len > 0 => PONG(req!(), opt!()),
            "QUIT" => QUIT(opt!()),
            "ERROR" if len > 0 => ERROR(req!()),
            "JOIN" if len > 0 => JOIN(req!(), opt!(), opt!()),
            "PART" if len > 0 => PART(req!(), opt!()),
            "TOPIC" if len > 0 => TOPIC(req!(), opt!()),
            "NAMES" if len > 0 => NAMES(req!()),
            "KICK" if len > 1 => KICK(req!(), req!(), opt!()),
            "MODE" if len > 0 => MODE(req!(), opt!(), Some(params.collect())),
            "PRIVMSG" if len > 1 => PRIVMSG(req!(), req!()),
            "NOTICE" if len > 1 => NOTICE(req!(), req!()),
            "AWAY" => AWAY(opt!()),
            "ACCOUNT" if len > 0 => ACCOUNT(req!()),
            "BATCH" if len > 0 => BATCH(req!(), params.collect()),
            "CHGHOST" if len > 1 => CHGHOST(req!(), req!()),
            _ => Self::Unknown(tag, params.collect()),
        }
    }

    pub fn parameters(self) -> Vec<String> {
        match self {
            Command::CAP(a, b, c, d) => a.into_iter().chain(Some(b)).chain(c).chain(d).collect(),
            Command::PASS(a) => vec![a],
            Command::NICK(a) => vec![a],
            Command::USER(a, b) => vec![a, "0".into(), "*".into(), b],
            Command::PING(a) => vec![a],
            Command::PONG(a, b) => std::iter::once(a).chain(b).collect(),
            Command::QUIT(a) => a.into_iter().collect(),
            Command::ERROR(a) => vec![a],
            Command::JOIN(a, b, c) => std::iter::once(a).chain(b).chain(c).collect(),
            Command::PART(a, b) => std::iter::once(a).chain(b).collect(),
            Command::TOPIC(a, b) => std::iter::once(a).chain(b).collect(),
            Command::NAMES(a) => vec![a],
            Command::KICK(a, b, c) => std::iter::once(a).chain(Some(b)).chain(c).collect(),
            Command::MODE(a, b, c) => std::iter::once(a)
                .chain(b)
                .chain(c.into_iter().flatten())
                .collect(),
            Command::PRIVMSG(a, b) => vec![a, b],
            Command::NOTICE(a, b) => vec![a, b],
            Command::AWAY(a) => a.into_iter().collect(),
            Command::ACCOUNT(a) => vec![a],
            Command::BATCH(a, rest) => std::iter::once(a).chain(rest).collect(),
            Command::CHGHOST(a, b) => vec![a, b],
            Command::Numeric(_, params) => params,
            Command::Unknown(_, params) => params,
            Command::Raw(_) => vec![],
        }
    }

    pub fn command(&self) -> String {
        use Command::*;

        match self {
            CAP(..) => "CAP".to_string(),
            PASS(_) => "PASS".to_string(),
            NICK(_) => "NICK".to_string(),
            USER(..) => "USER".to_string(),
            PING(_) => "PING".to_string(),
            PONG(..) => "PONG".to_string(),
            QUIT(_) => "QUIT".to_string(),
            ERROR(_) => "ERROR".to_string(),
            JOIN(..) => "JOIN".to_string(),
            PART(..) => "PART".to_string(),
            TOPIC(..) => "TOPIC".to_string(),
            NAMES(_) => "NAMES".to_string(),
            KICK(..) => "KICK".to_string(),
            MODE(..) => "MODE".to_string(),
            PRIVMSG(..) => "PRIVMSG".to_string(),
            NOTICE(..) => "NOTICE".to_string(),
            AWAY(_) => "AWAY".to_string(),
            ACCOUNT(_) => "ACCOUNT".to_string(),
            BATCH(..) => "BATCH".to_string(),
            CHGHOST(..) => "CHGHOST".to_string(),
            Numeric(numeric, _) => format!("{:03}", *numeric as u16),
            Unknown(tag, _) => tag.clone(),
            Raw(_) => String::new(),
        }
    }

    /// Three digit reply code, for both known and unknown numerics.
    pub fn numeric(&self) -> Option<u16> {
        match self {
            Command::Numeric(numeric, _) => Some(*numeric as u16),
            Command::Unknown(tag, _) if tag.len() == 3 => tag.parse().ok(),
            _ => None,
        }
    }
}

macro_rules! numerics {
    ($($name:ident = $code:literal,)*) => {
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Numeric {
            $($name = $code,)*
        }

        impl TryFrom<u16> for Numeric {
            type Error = ();

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                Ok(match value {
                    $($code => Numeric::$name,)*
                    _ => return Err(()),
                })
            }
        }
    };
}

numerics! {
    RPL_WELCOME = 1,
    RPL_YOURHOST = 2,
    RPL_CREATED = 3,
    RPL_MYINFO = 4,
    RPL_ISUPPORT = 5,
    RPL_UMODEIS = 221,
    RPL_AWAY = 301,
    RPL_UNAWAY = 305,
    RPL_NOWAWAY = 306,
    RPL_CHANNELMODEIS = 324,
    RPL_CREATIONTIME = 329,
    RPL_NOTOPIC = 331,
    RPL_TOPIC = 332,
    RPL_TOPICWHOTIME = 333,
    RPL_REOPLIST = 344,
    RPL_ENDOFREOPLIST = 345,
    RPL_INVEXLIST = 346,
    RPL_ENDOFINVEXLIST = 347,
    RPL_EXCEPTLIST = 348,
    RPL_ENDOFEXCEPTLIST = 349,
    RPL_NAMREPLY = 353,
    RPL_ENDOFNAMES = 366,
    RPL_BANLIST = 367,
    RPL_ENDOFBANLIST = 368,
    RPL_MOTD = 372,
    RPL_MOTDSTART = 375,
    RPL_ENDOFMOTD = 376,
    RPL_QLIST = 386,
    RPL_ENDOFQLIST = 387,
    RPL_ALIST = 388,
    RPL_ENDOFALIST = 389,
    ERR_NOSUCHCHANNEL = 403,
    ERR_UNKNOWNCOMMAND = 421,
    ERR_NOMOTD = 422,
    ERR_NONICKNAMEGIVEN = 431,
    ERR_ERRONEUSNICKNAME = 432,
    ERR_NICKNAMEINUSE = 433,
    ERR_NICKCOLLISION = 436,
    ERR_NOTONCHANNEL = 442,
    ERR_NOTREGISTERED = 451,
    ERR_NEEDMOREPARAMS = 461,
    ERR_ALREADYREGISTERED = 462,
    ERR_PASSWDMISMATCH = 464,
    ERR_YOUREBANNEDCREEP = 465,
    ERR_UNKNOWNMODE = 472,
    RPL_QUIETLIST = 728,
    RPL_ENDOFQUIETLIST = 729,
    RPL_ACCESSLIST = 910,
    RPL_ENDOFACCESSLIST = 911,
    RPL_ENDOFSPAMFILTER = 940,
    RPL_SPAMFILTER = 941,
    RPL_ENDOFEXEMPTCHANOPS = 953,
    RPL_EXEMPTCHANOPS = 954,
}
